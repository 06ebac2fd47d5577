//! Per-block surface budget: detection and greedy repair.
//!
//! The target engine splits a terrain into square blocks and can only blend
//! a limited number of surfaces inside each one. A mask occupies a block when
//! any of its pixels there exceeds the coverage threshold.

use log::{debug, info};
use serde::Serialize;

use super::config::SurfaceKind;
use super::SurfaceMaskSet;
use crate::config::SurfaceConfig;

/// Violating blocks listed individually in a report; the count is always exact.
pub const MAX_REPORTED_BLOCKS: usize = 100;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BlockViolation {
    pub block_x: usize,
    pub block_y: usize,
    pub surface_count: usize,
    pub surfaces: Vec<SurfaceKind>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BlockReport {
    pub violations: usize,
    pub total_blocks: usize,
    pub details: Vec<BlockViolation>,
}

impl BlockReport {
    pub fn is_within_budget(&self) -> bool {
        self.violations == 0
    }
}

#[derive(Clone, Copy, Debug)]
struct Block {
    bx: usize,
    by: usize,
    x0: usize,
    x1: usize,
    y0: usize,
    y1: usize,
}

fn blocks(width: usize, height: usize, size: usize) -> impl Iterator<Item = Block> {
    let size = size.max(1);
    (0..height.div_ceil(size)).flat_map(move |by| {
        (0..width.div_ceil(size)).map(move |bx| Block {
            bx,
            by,
            x0: bx * size,
            x1: ((bx + 1) * size).min(width),
            y0: by * size,
            y1: ((by + 1) * size).min(height),
        })
    })
}

fn block_peak(masks: &SurfaceMaskSet, kind: SurfaceKind, block: &Block) -> u8 {
    let mask = masks.get(kind);
    (block.y0..block.y1)
        .map(|y| mask.row(y)[block.x0..block.x1].iter().copied().max().unwrap_or(0))
        .max()
        .unwrap_or(0)
}

fn occupying(masks: &SurfaceMaskSet, block: &Block, threshold: u8) -> Vec<(SurfaceKind, u8)> {
    SurfaceKind::ALL
        .iter()
        .map(|&kind| (kind, block_peak(masks, kind, block)))
        .filter(|&(_, peak)| peak > threshold)
        .collect()
}

/// Count the blocks that hold more occupying masks than the budget allows.
pub fn check_block_saturation(masks: &SurfaceMaskSet, config: &SurfaceConfig) -> BlockReport {
    let mut report = BlockReport::default();
    for block in blocks(masks.width(), masks.height(), config.block_size) {
        report.total_blocks += 1;
        let present = occupying(masks, &block, config.coverage_threshold);
        if present.len() > config.max_surfaces_per_block {
            report.violations += 1;
            if report.details.len() < MAX_REPORTED_BLOCKS {
                report.details.push(BlockViolation {
                    block_x: block.bx,
                    block_y: block.by,
                    surface_count: present.len(),
                    surfaces: present.into_iter().map(|(kind, _)| kind).collect(),
                });
            }
        }
    }
    report
}

/// Bring every block within budget by dropping, block by block, the
/// occupying non-default mask with the lowest peak. Dropped values move into
/// the default mask inside that block. Returns the number of drops.
pub fn repair_block_saturation(masks: &mut SurfaceMaskSet, config: &SurfaceConfig) -> usize {
    let limit = config.max_surfaces_per_block.max(1);
    let mut drops = 0;

    for block in blocks(masks.width(), masks.height(), config.block_size) {
        loop {
            let present = occupying(masks, &block, config.coverage_threshold);
            if present.len() <= limit {
                break;
            }
            let weakest = present
                .iter()
                .filter(|(kind, _)| !kind.is_default())
                .min_by_key(|(_, peak)| *peak)
                .copied();
            let Some((kind, peak)) = weakest else {
                break;
            };

            masks.merge_into_default(kind, block.x0..block.x1, block.y0..block.y1);
            drops += 1;
            debug!(
                "Dropped {} (peak {}) from block ({}, {})",
                kind.name(),
                peak,
                block.bx,
                block.by
            );
        }
    }

    if drops > 0 {
        info!("Block repair dropped {} surface occurrences", drops);
    }
    drops
}
