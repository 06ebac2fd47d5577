//! Surface classification: per-pixel material weights from terrain and features.
//!
//! The classifier works on the same pixel grid as the finished heightmap:
//! 1. Rasterize feature layers with resolution-scaled buffers
//! 2. Build four candidate weights (rock, forest floor, asphalt, sand/dirt)
//!    concurrently, each from soft-edged masks
//! 3. Zero everything on water and normalize to a partition of unity, with
//!    grass taking the remainder
//! 4. Quantize to 8 bits and repair blocks that exceed the surface budget
//! 5. Report coverage and a recommended default surface

pub mod blocks;
pub mod config;
pub mod coverage;
pub mod soft_edge;

use std::ops::Range;

use log::{debug, info};

use crate::config::SurfaceConfig;
use crate::error::ExecutorError;
use crate::features::{FeatureCollection, FeatureLayers, TagFilter};
use crate::filters::binary_dilation;
use crate::geo::BoundingBox;
use crate::grid::Grid;
use crate::parallel::{parallel_gaussian_filter, ChunkedExecutor};
use crate::rasterize::rasterize_features;

pub use blocks::{check_block_saturation, repair_block_saturation, BlockReport, BlockViolation};
pub use config::{treeline_elevation, ScaledWidths, SurfaceKind};
pub use coverage::{compute_coverage_stats, CoverageStats, SurfaceCoverage};
use soft_edge::{slope_degrees, slope_ramp, soft_edge_mask, treeline_ramp};

/// Soft-edge widths that do not scale with resolution.
const PAVED_TRANSITION_PX: usize = 2;
const URBAN_TRANSITION_PX: usize = 3;
const FARMLAND_TRANSITION_PX: usize = 5;
const GRAVEL_TRANSITION_PX: usize = 2;

const URBAN_WEIGHT: f32 = 0.5;
const FARMLAND_WEIGHT: f32 = 0.6;
const GRAVEL_WEIGHT: f32 = 0.8;

/// Guards the normalization divide.
const MIN_WEIGHT_SUM: f32 = 1e-10;

const WATER_PREVIEW: [u8; 3] = [30, 30, 200];

// =============================================================================
// MASK SET
// =============================================================================

/// One 8-bit grid per surface, all the same shape.
#[derive(Clone, Debug, PartialEq)]
pub struct SurfaceMaskSet {
    width: usize,
    height: usize,
    masks: Vec<Grid<u8>>,
}

impl SurfaceMaskSet {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            masks: SurfaceKind::ALL.iter().map(|_| Grid::new_with(width, height, 0u8)).collect(),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn get(&self, kind: SurfaceKind) -> &Grid<u8> {
        &self.masks[kind as usize]
    }

    pub fn get_mut(&mut self, kind: SurfaceKind) -> &mut Grid<u8> {
        &mut self.masks[kind as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (SurfaceKind, &Grid<u8>)> {
        SurfaceKind::ALL.iter().copied().zip(self.masks.iter())
    }

    /// Sum of all masks at one pixel.
    pub fn pixel_sum(&self, x: usize, y: usize) -> u32 {
        self.masks.iter().map(|m| *m.get(x, y) as u32).sum()
    }

    /// Zero `kind` inside the window and add its values to the default mask.
    pub fn merge_into_default(&mut self, kind: SurfaceKind, xs: Range<usize>, ys: Range<usize>) {
        if kind.is_default() {
            return;
        }
        let default = SurfaceKind::Grass as usize;
        for y in ys {
            for x in xs.clone() {
                let moved = std::mem::take(self.masks[kind as usize].get_mut(x, y));
                let target = self.masks[default].get_mut(x, y);
                *target = target.saturating_add(moved);
            }
        }
    }
}

// =============================================================================
// CLASSIFIER
// =============================================================================

/// Everything the classifier reads for one job.
pub struct SurfaceInputs<'a> {
    /// Corrected elevation on the heightmap's pixel grid
    pub elevation: &'a Grid<f32>,
    pub layers: &'a FeatureLayers,
    pub bbox: &'a BoundingBox,
    pub cell_size_m: f64,
    pub country: Option<&'a str>,
}

#[derive(Clone, Debug)]
pub struct SurfaceClassification {
    pub masks: SurfaceMaskSet,
    pub water: Grid<bool>,
    pub treeline_m: f32,
    pub widths: ScaledWidths,
    /// Budget check on the freshly quantized masks
    pub blocks_before_repair: BlockReport,
    /// Budget check after repair
    pub blocks: BlockReport,
    pub repairs: usize,
    pub coverage: CoverageStats,
}

impl SurfaceClassification {
    /// False-colour overview: grass green, forest and rock red, asphalt and
    /// sand blue, water a fixed blue.
    pub fn preview_rgb(&self) -> Grid<[u8; 3]> {
        let masks = &self.masks;
        let mut preview = Grid::new_with(masks.width(), masks.height(), [0u8; 3]);
        for (x, y, pixel) in preview.iter_mut() {
            if *self.water.get(x, y) {
                *pixel = WATER_PREVIEW;
                continue;
            }
            let value = |kind: SurfaceKind| *masks.get(kind).get(x, y) as f32;
            let r = value(SurfaceKind::ForestFloor) * 0.6 + value(SurfaceKind::Rock) * 0.4;
            let b = value(SurfaceKind::Asphalt) + value(SurfaceKind::SandDirt) * 0.5;
            *pixel = [
                r.clamp(0.0, 255.0) as u8,
                *masks.get(SurfaceKind::Grass).get(x, y),
                b.clamp(0.0, 255.0) as u8,
            ];
        }
        preview
    }
}

struct BinaryLayers {
    water: Grid<bool>,
    forests: Grid<bool>,
    paved: Grid<bool>,
    gravel: Grid<bool>,
    farmland: Grid<bool>,
    urban: Grid<bool>,
}

pub struct SurfaceClassifier {
    config: SurfaceConfig,
    executor: ChunkedExecutor,
}

impl SurfaceClassifier {
    pub fn new(config: SurfaceConfig, executor: ChunkedExecutor) -> Self {
        Self { config, executor }
    }

    fn rasterize(inputs: &SurfaceInputs, widths: &ScaledWidths) -> BinaryLayers {
        let (w, h) = (inputs.elevation.width, inputs.elevation.height);
        let draw = |collection: &FeatureCollection, filter: TagFilter, buffer: usize| {
            rasterize_features(collection, &filter, inputs.bbox, w, h, buffer)
        };
        let layers = inputs.layers;

        let urban = draw(&layers.land_use, config::urban(), 0);
        let buildings = draw(&layers.buildings, TagFilter::any(), 0);
        BinaryLayers {
            water: draw(&layers.water, config::surface_water(), 0),
            forests: draw(&layers.forests, TagFilter::any(), 0),
            paved: draw(&layers.roads, config::paved_roads(), widths.road_buffer_px),
            gravel: draw(&layers.roads, config::loose_roads(), widths.gravel_buffer_px),
            farmland: draw(&layers.land_use, config::farmland(), 0),
            urban: urban.zip_map(&buildings, |&u, &b| u || b),
        }
    }

    fn rock_candidate(
        &self,
        elevation: &Grid<f32>,
        above_treeline: &Grid<f32>,
        cell_size_m: f64,
        sigma: f32,
    ) -> Result<Grid<f32>, ExecutorError> {
        let slope = slope_degrees(elevation, cell_size_m as f32);
        let steep = slope_ramp(&slope, self.config.slope_start_deg, self.config.slope_full_deg);
        let base = steep.zip_map(above_treeline, |&s, &t| s.max(t));
        parallel_gaussian_filter(&self.executor, &base, sigma)
    }

    fn forest_candidate(&self, forests: &Grid<bool>, above_treeline: &Grid<f32>, transition: usize) -> Grid<f32> {
        soft_edge_mask(&self.executor, forests, transition).zip_map(above_treeline, |&f, &t| f * (1.0 - t))
    }

    fn asphalt_candidate(&self, paved: &Grid<bool>, urban: &Grid<bool>) -> Grid<f32> {
        let roads = soft_edge_mask(&self.executor, paved, PAVED_TRANSITION_PX);
        let built = soft_edge_mask(&self.executor, urban, URBAN_TRANSITION_PX);
        roads.zip_map(&built, |&r, &u| r.max(u * URBAN_WEIGHT))
    }

    fn sand_candidate(&self, layers: &BinaryLayers, shore_px: usize) -> Grid<f32> {
        let shore = binary_dilation(&layers.water, shore_px).zip_map(&layers.water, |&d, &w| d && !w);
        let shore = soft_edge_mask(&self.executor, &shore, shore_px);
        let farmland = soft_edge_mask(&self.executor, &layers.farmland, FARMLAND_TRANSITION_PX);
        let gravel = soft_edge_mask(&self.executor, &layers.gravel, GRAVEL_TRANSITION_PX);

        let mut sand = shore;
        for (x, y, value) in sand.iter_mut() {
            *value = value
                .max(farmland.get(x, y) * FARMLAND_WEIGHT)
                .max(gravel.get(x, y) * GRAVEL_WEIGHT);
        }
        sand
    }

    pub fn classify(&self, inputs: &SurfaceInputs) -> Result<SurfaceClassification, ExecutorError> {
        let (width, height) = (inputs.elevation.width, inputs.elevation.height);
        let widths = ScaledWidths::for_cell_size(inputs.cell_size_m);
        let treeline_m = treeline_elevation(inputs.country, inputs.bbox);
        info!(
            "Classifying surfaces on {}x{} at {} m/px, treeline {} m",
            width, height, inputs.cell_size_m, treeline_m
        );
        debug!("Scaled widths: {:?}", widths);

        let layers = Self::rasterize(inputs, &widths);
        let above_treeline = treeline_ramp(inputs.elevation, treeline_m, self.config.treeline_ramp_m);

        let ((rock, forest), (asphalt, sand)) = self.executor.install(|| {
            rayon::join(
                || {
                    rayon::join(
                        || self.rock_candidate(inputs.elevation, &above_treeline, inputs.cell_size_m, widths.sigma),
                        || self.forest_candidate(&layers.forests, &above_treeline, widths.forest_transition_px),
                    )
                },
                || {
                    rayon::join(
                        || self.asphalt_candidate(&layers.paved, &layers.urban),
                        || self.sand_candidate(&layers, widths.sand_transition_px),
                    )
                },
            )
        });
        let candidates = [
            (SurfaceKind::Rock, rock?),
            (SurfaceKind::ForestFloor, forest),
            (SurfaceKind::Asphalt, asphalt),
            (SurfaceKind::SandDirt, sand),
        ];

        let mut masks = quantize(&candidates, &layers.water);

        let blocks_before_repair = check_block_saturation(&masks, &self.config);
        let repairs = if blocks_before_repair.is_within_budget() {
            0
        } else {
            info!(
                "Block saturation: {} of {} blocks over budget, repairing",
                blocks_before_repair.violations, blocks_before_repair.total_blocks
            );
            repair_block_saturation(&mut masks, &self.config)
        };
        let blocks = check_block_saturation(&masks, &self.config);
        let coverage = compute_coverage_stats(&masks);

        info!(
            "Surface coverage: {}",
            coverage
                .per_surface
                .iter()
                .map(|(name, c)| format!("{} {}%", name, c.percentage))
                .collect::<Vec<_>>()
                .join(", ")
        );
        info!(
            "Recommended default: {} ({}), {} of {} blocks over budget",
            coverage.recommended_default.name(),
            coverage.recommended_default_material,
            blocks.violations,
            blocks.total_blocks
        );

        Ok(SurfaceClassification {
            masks,
            water: layers.water,
            treeline_m,
            widths,
            blocks_before_repair,
            blocks,
            repairs,
            coverage,
        })
    }
}

/// Normalize the candidates per pixel and quantize to 8 bits.
///
/// Water pixels are zero in every mask. Elsewhere the candidates are scaled
/// down when they sum above 1, floored to bytes, and the default mask gets
/// `255 - sum`.
fn quantize(candidates: &[(SurfaceKind, Grid<f32>)], water: &Grid<bool>) -> SurfaceMaskSet {
    let mut masks = SurfaceMaskSet::new(water.width, water.height);
    let mut weights = vec![0.0f32; candidates.len()];

    for (x, y, &is_water) in water.iter() {
        if is_water {
            continue;
        }
        for (slot, (_, grid)) in weights.iter_mut().zip(candidates) {
            *slot = grid.get(x, y).clamp(0.0, 1.0);
        }
        let sum: f32 = weights.iter().sum();
        if sum > 1.0 {
            let scale = 1.0 / sum.max(MIN_WEIGHT_SUM);
            weights.iter_mut().for_each(|w| *w *= scale);
        }

        let mut used = 0u32;
        for (&w, (kind, _)) in weights.iter().zip(candidates) {
            let q = (w * 255.0).floor().clamp(0.0, 255.0) as u8;
            masks.get_mut(*kind).set(x, y, q);
            used += q as u32;
        }
        let rest = 255u32.saturating_sub(used) as u8;
        masks.get_mut(SurfaceKind::Grass).set(x, y, rest);
    }
    masks
}
