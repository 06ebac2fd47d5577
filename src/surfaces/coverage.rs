//! Coverage statistics and the recommended default surface.

use std::collections::BTreeMap;

use serde::Serialize;

use super::config::SurfaceKind;
use super::SurfaceMaskSet;

/// A mask value above this marks the pixel as dominated by that surface.
const DOMINANT_VALUE: u8 = 128;
/// Rock covering more than this share becomes the recommended default.
const ROCK_DEFAULT_PCT: f64 = 40.0;
/// Grass covering more than this share becomes the recommended default.
const GRASS_DEFAULT_PCT: f64 = 50.0;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SurfaceCoverage {
    /// Share of pixels where the mask exceeds 128
    pub percentage: f64,
    /// Share of pixels where the mask is non-zero
    pub any_coverage_pct: f64,
    pub pixels_dominant: usize,
    pub pixels_any: usize,
    pub mean_value: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CoverageStats {
    pub per_surface: BTreeMap<&'static str, SurfaceCoverage>,
    pub recommended_default: SurfaceKind,
    pub recommended_default_material: String,
    pub import_order: Vec<SurfaceKind>,
}

impl CoverageStats {
    pub fn get(&self, kind: SurfaceKind) -> Option<&SurfaceCoverage> {
        self.per_surface.get(kind.name())
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub fn compute_coverage_stats(masks: &SurfaceMaskSet) -> CoverageStats {
    let total = (masks.width() * masks.height()).max(1) as f64;
    let mut per_surface = BTreeMap::new();
    let mut best: Option<(SurfaceKind, f64)> = None;

    for &kind in SurfaceKind::ALL.iter() {
        let mask = masks.get(kind);
        let (mut dominant, mut any, mut sum) = (0usize, 0usize, 0u64);
        for &v in mask.as_slice() {
            if v > DOMINANT_VALUE {
                dominant += 1;
            }
            if v > 0 {
                any += 1;
            }
            sum += v as u64;
        }

        let coverage = SurfaceCoverage {
            percentage: round1(dominant as f64 / total * 100.0),
            any_coverage_pct: round1(any as f64 / total * 100.0),
            pixels_dominant: dominant,
            pixels_any: any,
            mean_value: round1(sum as f64 / total),
        };
        // First surface wins ties.
        if best.map_or(true, |(_, pct)| coverage.percentage > pct) {
            best = Some((kind, coverage.percentage));
        }
        per_surface.insert(kind.name(), coverage);
    }

    let pct = |kind: SurfaceKind| per_surface.get(kind.name()).map_or(0.0, |c| c.percentage);
    let recommended = if pct(SurfaceKind::Rock) > ROCK_DEFAULT_PCT {
        SurfaceKind::Rock
    } else if pct(SurfaceKind::Grass) > GRASS_DEFAULT_PCT {
        SurfaceKind::Grass
    } else {
        best.map_or(SurfaceKind::Grass, |(kind, _)| kind)
    };

    CoverageStats {
        per_surface,
        recommended_default: recommended,
        recommended_default_material: recommended.material_path(),
        import_order: SurfaceKind::IMPORT_ORDER.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coverage_counts() {
        let mut masks = SurfaceMaskSet::new(10, 10);
        // Three left columns are forest, the rest grass.
        for (x, _, v) in masks.get_mut(SurfaceKind::ForestFloor).iter_mut() {
            *v = if x < 3 { 255 } else { 0 };
        }
        for (x, _, v) in masks.get_mut(SurfaceKind::Grass).iter_mut() {
            *v = if x < 3 { 0 } else { 255 };
        }
        masks.get_mut(SurfaceKind::Asphalt).set(9, 9, 60);

        let stats = compute_coverage_stats(&masks);
        let forest = stats.get(SurfaceKind::ForestFloor).unwrap();
        assert_eq!(forest.percentage, 30.0);
        assert_eq!(forest.pixels_dominant, 30);
        assert_eq!(forest.mean_value, 76.5);

        let asphalt = stats.get(SurfaceKind::Asphalt).unwrap();
        assert_eq!(asphalt.percentage, 0.0);
        assert_eq!(asphalt.pixels_any, 1);
        assert_eq!(asphalt.any_coverage_pct, 1.0);

        assert_eq!(stats.recommended_default, SurfaceKind::Grass);
        assert!(stats.recommended_default_material.ends_with("Grass_01.emat"));
        assert_eq!(stats.import_order.len(), 4);
    }

    #[test]
    fn test_rock_override() {
        let mut masks = SurfaceMaskSet::new(10, 10);
        for (x, _, v) in masks.get_mut(SurfaceKind::Rock).iter_mut() {
            *v = if x < 5 { 200 } else { 0 };
        }
        for (x, _, v) in masks.get_mut(SurfaceKind::ForestFloor).iter_mut() {
            *v = if x >= 4 { 200 } else { 0 };
        }
        // Forest covers more, but rock above 40% takes precedence.
        let stats = compute_coverage_stats(&masks);
        assert_eq!(stats.get(SurfaceKind::ForestFloor).unwrap().percentage, 60.0);
        assert_eq!(stats.recommended_default, SurfaceKind::Rock);
    }

    #[test]
    fn test_highest_coverage_wins_without_override() {
        let mut masks = SurfaceMaskSet::new(10, 10);
        for (x, _, v) in masks.get_mut(SurfaceKind::SandDirt).iter_mut() {
            *v = if x < 4 { 255 } else { 0 };
        }
        for (x, _, v) in masks.get_mut(SurfaceKind::Grass).iter_mut() {
            *v = if x >= 7 { 255 } else { 0 };
        }
        let stats = compute_coverage_stats(&masks);
        assert_eq!(stats.recommended_default, SurfaceKind::SandDirt);
    }
}
