//! Heightmap synthesis: terrain correction and 16-bit fixed-point conversion.
//!
//! The float elevation grid is first resampled to the engine's vertex grid,
//! then corrected along vector features:
//! 1. Roads are flattened by blending toward a heavily blurred surface
//! 2. Each connected water body is leveled to its own low percentile
//! 3. A light blur removes resampling artifacts
//!
//! Only then is it quantized, so every correction works in metres.

use log::{debug, info};
use serde::Serialize;

use crate::config::HeightmapConfig;
use crate::error::ExecutorError;
use crate::features::{FeatureCollection, TagFilter};
use crate::filters::{binary_dilation, label_components, percentile, Interpolation};
use crate::geo::{BoundingBox, METRES_PER_DEGREE};
use crate::grid::Grid;
use crate::parallel::{parallel_gaussian_filter, parallel_zoom, ChunkedExecutor};
use crate::raster::ElevationRaster;
use crate::rasterize::rasterize_features;

// =============================================================================
// SIZES AND CONSTANTS
// =============================================================================

/// Vertex counts per axis the terrain engine accepts (2^n + 1).
pub const VALID_SIZES: [usize; 7] = [129, 257, 513, 1025, 2049, 4097, 8193];

/// Largest raw heightmap value.
pub const HEIGHTMAP_MAX: f32 = 65535.0;

/// Smallest elevation range used for scaling, so flat terrain still gets a
/// non-zero scale.
pub const MIN_ELEVATION_RANGE: f32 = 0.01;

/// Nearest valid vertex count; ties go to the smaller size.
pub fn snap_size(size: usize) -> usize {
    VALID_SIZES
        .iter()
        .copied()
        .min_by_key(|&valid| valid.abs_diff(size))
        .unwrap_or(VALID_SIZES[0])
}

/// Water that gets leveled: open water polygons and named still water.
pub fn leveling_water_filter() -> TagFilter {
    TagFilter::new("natural", &["water"]).or("water_type", &["lake", "pond", "reservoir"])
}

// =============================================================================
// HEIGHTMAP
// =============================================================================

/// Scaling information stored alongside the raw grid.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HeightmapStats {
    pub min_elevation: f32,
    pub max_elevation: f32,
    pub elevation_range: f32,
    /// Metres per raw unit
    pub height_scale: f32,
    /// Elevation of raw value 0
    pub height_offset: f32,
    pub width: usize,
    pub height: usize,
}

/// 16-bit heightmap where `real = raw * height_scale + height_offset`.
#[derive(Clone, Debug, PartialEq)]
pub struct Heightmap {
    raw: Grid<u16>,
    stats: HeightmapStats,
}

impl Heightmap {
    /// Quantize a float elevation grid.
    ///
    /// NaN and `nodata` pixels are excluded from the range and written as 0.
    /// With no valid pixel at all the result is all zeros with zero scale.
    pub fn from_raster(elevation: &Grid<f32>, nodata: Option<f32>) -> Self {
        let is_valid = |v: f32| !v.is_nan() && nodata.map_or(true, |nd| v != nd);
        let (width, height) = (elevation.width, elevation.height);

        let range = elevation
            .as_slice()
            .iter()
            .copied()
            .filter(|&v| is_valid(v))
            .fold(None, |acc: Option<(f32, f32)>, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            });

        let Some((min, max)) = range else {
            return Self {
                raw: Grid::new_with(width, height, 0u16),
                stats: HeightmapStats {
                    min_elevation: 0.0,
                    max_elevation: 0.0,
                    elevation_range: 0.0,
                    height_scale: 0.0,
                    height_offset: 0.0,
                    width,
                    height,
                },
            };
        };

        let span = (max - min).max(MIN_ELEVATION_RANGE);
        let raw = elevation.map(|&v| {
            if is_valid(v) {
                ((v - min) / span * HEIGHTMAP_MAX).clamp(0.0, HEIGHTMAP_MAX) as u16
            } else {
                0
            }
        });

        Self {
            raw,
            stats: HeightmapStats {
                min_elevation: min,
                max_elevation: max,
                elevation_range: span,
                height_scale: span / HEIGHTMAP_MAX,
                height_offset: min,
                width,
                height,
            },
        }
    }

    pub fn raw(&self) -> &Grid<u16> {
        &self.raw
    }

    pub fn stats(&self) -> &HeightmapStats {
        &self.stats
    }

    pub fn width(&self) -> usize {
        self.raw.width
    }

    pub fn height(&self) -> usize {
        self.raw.height
    }

    pub fn real_to_heightmap(&self, real: f32) -> u16 {
        if self.stats.height_scale <= 0.0 {
            return 0;
        }
        ((real - self.stats.height_offset) / self.stats.height_scale)
            .round()
            .clamp(0.0, HEIGHTMAP_MAX) as u16
    }

    pub fn heightmap_to_real(&self, raw: u16) -> f32 {
        raw as f32 * self.stats.height_scale + self.stats.height_offset
    }

    /// Real elevations for every pixel.
    pub fn to_real(&self) -> Grid<f32> {
        self.raw.map(|&r| self.heightmap_to_real(r))
    }

    /// 8-bit grayscale preview (`raw / 256`).
    pub fn preview(&self) -> Grid<u8> {
        self.raw.map(|&r| (r >> 8) as u8)
    }
}

// =============================================================================
// SYNTHESIS
// =============================================================================

/// Inputs for one heightmap.
#[derive(Clone, Copy, Debug)]
pub struct SynthesisJob<'a> {
    /// WGS84 box the raster covers; features are rasterized against it
    pub bbox: &'a BoundingBox,
    /// Requested size; each axis is snapped to `VALID_SIZES`
    pub target_size: Option<(usize, usize)>,
    /// Ground size of one output cell in metres
    pub resolution_m: f64,
    pub roads: &'a FeatureCollection,
    pub water: &'a FeatureCollection,
}

#[derive(Clone, Debug)]
pub struct SynthesizedTerrain {
    pub heightmap: Heightmap,
    /// Corrected float elevation on the heightmap's pixel grid
    pub elevation: Grid<f32>,
    pub cell_size_m: f64,
}

pub struct HeightmapSynthesizer {
    config: HeightmapConfig,
    executor: ChunkedExecutor,
}

impl HeightmapSynthesizer {
    pub fn new(config: HeightmapConfig, executor: ChunkedExecutor) -> Self {
        Self { config, executor }
    }

    /// Ground size of a raster pixel in metres; geographic rasters use the
    /// latitude axis.
    fn native_resolution_m(raster: &ElevationRaster) -> f64 {
        if raster.crs().is_geographic() {
            raster.pixel_size().1 * METRES_PER_DEGREE
        } else {
            raster.pixel_size().0
        }
    }

    /// Resample to the snapped target size, or by the resolution ratio when
    /// no size was requested.
    pub fn resample(&self, raster: &ElevationRaster, job: &SynthesisJob) -> Result<Grid<f32>, ExecutorError> {
        let data = raster.data();
        let (width, height) = match job.target_size {
            Some((w, h)) => {
                let snapped = (snap_size(w), snap_size(h));
                if snapped != (w, h) {
                    info!("Snapped heightmap size from {}x{} to {}x{}", w, h, snapped.0, snapped.1);
                }
                snapped
            }
            None => {
                let native = Self::native_resolution_m(raster);
                if native <= 0.0 || job.resolution_m <= 0.0 {
                    return Ok(data.clone());
                }
                let zoom = native / job.resolution_m;
                if (zoom - 1.0).abs() <= 0.01 {
                    return Ok(data.clone());
                }
                (
                    ((data.width as f64 * zoom).round() as usize).max(1),
                    ((data.height as f64 * zoom).round() as usize).max(1),
                )
            }
        };

        if (width, height) == (data.width, data.height) {
            return Ok(data.clone());
        }
        info!("Resampling elevation {}x{} -> {}x{}", data.width, data.height, width, height);
        parallel_zoom(&self.executor, data, width, height, Interpolation::Cubic)
    }

    /// Blend a blurred copy of the terrain into a dilated road corridor.
    ///
    /// Pixels where the blurred corridor weight is exactly zero are returned
    /// untouched.
    pub fn flatten_roads(&self, elevation: &Grid<f32>, road_mask: &Grid<bool>) -> Result<Grid<f32>, ExecutorError> {
        if !road_mask.any() {
            return Ok(elevation.clone());
        }
        let sigma = self.config.road_sigma;
        let dilated = binary_dilation(road_mask, self.config.road_dilation_px);
        let smoothed = parallel_gaussian_filter(&self.executor, elevation, sigma)?;
        let blend = parallel_gaussian_filter(&self.executor, &dilated.to_f32(), sigma)?;

        let mut result = elevation.clone();
        for (x, y, value) in result.iter_mut() {
            let b = blend.get(x, y).clamp(0.0, 1.0);
            if b > 0.0 {
                *value = *value * (1.0 - b) + smoothed.get(x, y) * b;
            }
        }
        Ok(result)
    }

    /// Level each connected water region to its own low percentile and blend
    /// the shore band.
    pub fn level_water(&self, elevation: &Grid<f32>, water_mask: &Grid<bool>) -> Result<Grid<f32>, ExecutorError> {
        if !water_mask.any() {
            return Ok(elevation.clone());
        }
        let (labels, count) = label_components(water_mask);

        let mut regions: Vec<Vec<f32>> = vec![Vec::new(); count as usize + 1];
        for (x, y, &label) in labels.iter() {
            if label > 0 {
                regions[label as usize].push(*elevation.get(x, y));
            }
        }
        let levels: Vec<f32> = regions
            .iter_mut()
            .map(|values| percentile(values, self.config.water_percentile).unwrap_or(0.0))
            .collect();
        debug!("Leveling {} water regions", count);

        let mut result = elevation.clone();
        for (x, y, value) in result.iter_mut() {
            let label = *labels.get(x, y);
            if label > 0 {
                *value = levels[label as usize];
            }
        }

        let transition = self.config.water_transition_px;
        if transition > 0 {
            let dilated = binary_dilation(water_mask, transition);
            let shore = dilated.zip_map(water_mask, |&d, &w| d && !w);
            if shore.any() {
                let sigma = transition as f32;
                let blend = parallel_gaussian_filter(&self.executor, &water_mask.to_f32(), sigma)?;
                let water_surface = parallel_gaussian_filter(&self.executor, &result, sigma)?;
                for (x, y, &in_band) in shore.iter() {
                    if in_band {
                        let b = blend.get(x, y).clamp(0.0, 1.0);
                        result.set(x, y, elevation.get(x, y) * (1.0 - b) + water_surface.get(x, y) * b);
                    }
                }
            }
        }
        Ok(result)
    }

    /// Run resampling, corrections, smoothing and quantization.
    pub fn synthesize(&self, raster: &ElevationRaster, job: &SynthesisJob) -> Result<SynthesizedTerrain, ExecutorError> {
        let mut elevation = self.resample(raster, job)?;
        let (width, height) = (elevation.width, elevation.height);

        if !job.roads.is_empty() {
            info!("Flattening terrain along {} road segments", job.roads.len());
            let mask = rasterize_features(
                job.roads,
                &TagFilter::any(),
                job.bbox,
                width,
                height,
                self.config.road_buffer_px,
            );
            elevation = self.flatten_roads(&elevation, &mask)?;
        }

        if !job.water.is_empty() {
            info!("Leveling {} water bodies", job.water.len());
            let mask = rasterize_features(job.water, &leveling_water_filter(), job.bbox, width, height, 0);
            elevation = self.level_water(&elevation, &mask)?;
        }

        elevation = parallel_gaussian_filter(&self.executor, &elevation, self.config.final_sigma)?;
        let heightmap = Heightmap::from_raster(&elevation, raster.nodata());
        let stats = heightmap.stats();
        info!(
            "Heightmap {}x{}, elevation {:.1} - {:.1} m",
            stats.width, stats.height, stats.min_elevation, stats.max_elevation
        );

        Ok(SynthesizedTerrain {
            heightmap,
            elevation,
            cell_size_m: job.resolution_m,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Feature, Geometry};
    use crate::geo::Crs;

    fn synthesizer() -> HeightmapSynthesizer {
        HeightmapSynthesizer::new(HeightmapConfig::default(), ChunkedExecutor::new(2).unwrap())
    }

    fn hills(width: usize, height: usize) -> Grid<f32> {
        let data = (0..width * height)
            .map(|i| {
                let (x, y) = ((i % width) as f32, (i / width) as f32);
                200.0 + (x * 0.3).sin() * 15.0 + (y * 0.17).cos() * 10.0 + x * 0.5
            })
            .collect();
        Grid::from_vec(width, height, data).unwrap()
    }

    #[test]
    fn test_snap_size() {
        assert_eq!(snap_size(100), 129);
        assert_eq!(snap_size(257), 257);
        assert_eq!(snap_size(2000), 2049);
        assert_eq!(snap_size(3000), 2049);
        assert_eq!(snap_size(100_000), 8193);
    }

    #[test]
    fn test_from_raster_scale_and_roundtrip() {
        let grid = Grid::from_vec(3, 1, vec![100.0, 150.0, 300.0]).unwrap();
        let hm = Heightmap::from_raster(&grid, None);
        let stats = hm.stats();
        assert_eq!(stats.min_elevation, 100.0);
        assert_eq!(stats.max_elevation, 300.0);
        assert!((stats.height_scale - 200.0 / 65535.0).abs() < 1e-9);
        assert_eq!(*hm.raw().get(0, 0), 0);
        assert_eq!(*hm.raw().get(2, 0), 65535);

        for real in [100.0f32, 123.456, 222.2, 299.99, 300.0] {
            let back = hm.heightmap_to_real(hm.real_to_heightmap(real));
            assert!((back - real).abs() <= stats.height_scale, "{real} -> {back}");
        }
    }

    #[test]
    fn test_from_raster_excludes_nodata() {
        let grid = Grid::from_vec(4, 1, vec![-9999.0, 10.0, f32::NAN, 20.0]).unwrap();
        let hm = Heightmap::from_raster(&grid, Some(-9999.0));
        assert_eq!(hm.stats().min_elevation, 10.0);
        assert_eq!(*hm.raw().get(0, 0), 0);
        assert_eq!(*hm.raw().get(2, 0), 0);
        assert_eq!(*hm.raw().get(3, 0), 65535);
    }

    #[test]
    fn test_from_raster_degenerate_cases() {
        let empty = Heightmap::from_raster(&Grid::new_with(2, 2, -1.0), Some(-1.0));
        assert!(empty.raw().as_slice().iter().all(|&v| v == 0));
        assert_eq!(empty.stats().height_scale, 0.0);
        assert_eq!(empty.real_to_heightmap(42.0), 0);

        let flat = Heightmap::from_raster(&Grid::new_with(2, 2, 55.0), None);
        assert_eq!(flat.stats().elevation_range, MIN_ELEVATION_RANGE);
        assert!(flat.stats().height_scale > 0.0);
    }

    #[test]
    fn test_road_flattening_is_local() {
        let elevation = hills(200, 200);
        let mut road = Grid::new_with(200, 200, false);
        for x in 0..200 {
            for y in 98..=102 {
                road.set(x, y, true);
            }
        }
        let flattened = synthesizer().flatten_roads(&elevation, &road).unwrap();

        // Corridor and its dilation band both move toward the smoothed surface.
        assert_ne!(flattened.get(50, 100), elevation.get(50, 100));
        assert_ne!(flattened.get(50, 104), elevation.get(50, 104));

        // Beyond dilation (3) plus blur support (20) nothing changes, bit for bit.
        for y in (0..75).chain(128..200) {
            for x in 0..200 {
                assert_eq!(flattened.get(x, y).to_bits(), elevation.get(x, y).to_bits(), "({x}, {y})");
            }
        }
    }

    #[test]
    fn test_two_lakes_level_independently() {
        // Left half near 100 m, right half near 300 m.
        let data = (0..120 * 60)
            .map(|i| {
                let x = i % 120;
                let base = if x < 60 { 100.0 } else { 300.0 };
                base + (x % 60) as f32 * 0.5
            })
            .collect();
        let elevation = Grid::from_vec(120, 60, data).unwrap();
        let mut water = Grid::new_with(120, 60, false);
        for y in 20..40 {
            for x in 10..30 {
                water.set(x, y, true);
            }
            for x in 80..100 {
                water.set(x, y, true);
            }
        }

        let leveled = synthesizer().level_water(&elevation, &water).unwrap();
        let left = *leveled.get(15, 25);
        let right = *leveled.get(85, 25);
        assert!((left - 105.95).abs() < 0.01, "left lake at {left}");
        assert!((right - 310.95).abs() < 0.01, "right lake at {right}");
        for y in 20..40 {
            for x in 10..30 {
                assert_eq!(*leveled.get(x, y), left);
            }
            for x in 80..100 {
                assert_eq!(*leveled.get(x, y), right);
            }
        }
        // Far from both lakes the terrain is untouched.
        assert_eq!(leveled.get(50, 5), elevation.get(50, 5));
    }

    #[test]
    fn test_synthesize_snaps_and_levels_multipolygon_lake() {
        let bbox = BoundingBox::new(10.0, 60.0, 10.1, 60.1).unwrap();
        let raster =
            ElevationRaster::from_bounds(hills(100, 100), Crs(25833), (0.0, 0.0, 100.0, 100.0), None).unwrap();
        let square = |w: f64, s: f64| {
            vec![vec![
                vec![w, s],
                vec![w + 0.02, s],
                vec![w + 0.02, s + 0.02],
                vec![w, s + 0.02],
                vec![w, s],
            ]]
        };
        let lake = Feature::new(Geometry::MultiPolygon {
            coordinates: vec![square(10.01, 60.01), square(10.07, 60.07)],
        })
        .with_property("natural", "water");
        let water = FeatureCollection::new(vec![lake]);
        let roads = FeatureCollection::default();

        let job = SynthesisJob {
            bbox: &bbox,
            target_size: Some((120, 130)),
            resolution_m: 2.0,
            roads: &roads,
            water: &water,
        };
        let terrain = synthesizer().synthesize(&raster, &job).unwrap();
        assert_eq!((terrain.heightmap.width(), terrain.heightmap.height()), (129, 129));
        assert_eq!((terrain.elevation.width, terrain.elevation.height), (129, 129));
        assert_eq!(terrain.cell_size_m, 2.0);
    }
}
