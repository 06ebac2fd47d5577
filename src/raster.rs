//! Georeferenced elevation rasters.
//!
//! An `ElevationRaster` is never modified in place once built: resampling
//! and nodata filling return a new raster.

use std::collections::VecDeque;

use log::info;

use crate::error::{ExecutorError, RasterError};
use crate::filters::Interpolation;
use crate::geo::Crs;
use crate::grid::Grid;
use crate::parallel::{parallel_zoom, ChunkedExecutor};

/// Pixels with `|v|` below this count as near-zero for truncation checks.
pub const NEAR_ZERO_EPSILON: f32 = 0.01;

#[derive(Clone, Debug, PartialEq)]
pub struct ElevationRaster {
    data: Grid<f32>,
    crs: Crs,
    /// Top-left corner of the top-left pixel in CRS units.
    origin: (f64, f64),
    /// Pixel width and height in CRS units, both positive.
    pixel_size: (f64, f64),
    nodata: Option<f32>,
}

impl ElevationRaster {
    pub fn new(
        data: Grid<f32>,
        crs: Crs,
        origin: (f64, f64),
        pixel_size: (f64, f64),
        nodata: Option<f32>,
    ) -> Result<Self, RasterError> {
        if data.is_empty() {
            return Err(RasterError::Empty);
        }
        Ok(Self {
            data,
            crs,
            origin,
            pixel_size: (pixel_size.0.abs(), pixel_size.1.abs()),
            nodata,
        })
    }

    /// Build a raster that exactly covers `(min_x, min_y, max_x, max_y)`.
    pub fn from_bounds(
        data: Grid<f32>,
        crs: Crs,
        bounds: (f64, f64, f64, f64),
        nodata: Option<f32>,
    ) -> Result<Self, RasterError> {
        if data.is_empty() {
            return Err(RasterError::Empty);
        }
        let (min_x, min_y, max_x, max_y) = bounds;
        let pixel_size = (
            (max_x - min_x) / data.width as f64,
            (max_y - min_y) / data.height as f64,
        );
        Self::new(data, crs, (min_x, max_y), pixel_size, nodata)
    }

    pub fn data(&self) -> &Grid<f32> {
        &self.data
    }

    pub fn into_data(self) -> Grid<f32> {
        self.data
    }

    pub fn width(&self) -> usize {
        self.data.width
    }

    pub fn height(&self) -> usize {
        self.data.height
    }

    pub fn crs(&self) -> Crs {
        self.crs
    }

    pub fn origin(&self) -> (f64, f64) {
        self.origin
    }

    pub fn pixel_size(&self) -> (f64, f64) {
        self.pixel_size
    }

    pub fn nodata(&self) -> Option<f32> {
        self.nodata
    }

    /// `(min_x, min_y, max_x, max_y)` in CRS units.
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        let (x0, y1) = self.origin;
        let x1 = x0 + self.pixel_size.0 * self.width() as f64;
        let y0 = y1 - self.pixel_size.1 * self.height() as f64;
        (x0, y0, x1, y1)
    }

    pub fn is_valid(&self, value: f32) -> bool {
        !value.is_nan() && self.nodata.map_or(true, |nd| value != nd)
    }

    pub fn valid_mask(&self) -> Grid<bool> {
        self.data.map(|&v| self.is_valid(v))
    }

    /// Replace nodata and NaN pixels with the value of the nearest valid
    /// pixel (breadth-first over 4-neighbours). A raster with no valid pixel
    /// at all is returned unchanged.
    pub fn fill_nodata(&self) -> Self {
        let valid = self.valid_mask();
        let missing = valid.len() - valid.count_true();
        if missing == 0 || missing == valid.len() {
            return self.clone();
        }

        let mut data = self.data.clone();
        let mut filled = valid.clone();
        let mut queue: VecDeque<(usize, usize)> = valid
            .iter()
            .filter(|(_, _, &v)| v)
            .map(|(x, y, _)| (x, y))
            .collect();

        while let Some((x, y)) = queue.pop_front() {
            let value = *data.get(x, y);
            for (nx, ny) in data.neighbors(x, y) {
                if !*filled.get(nx, ny) {
                    filled.set(nx, ny, true);
                    data.set(nx, ny, value);
                    queue.push_back((nx, ny));
                }
            }
        }

        info!("Interpolated {} nodata pixels", missing);
        Self { data, ..self.clone() }
    }

    /// Fraction of pixels with `|v| < NEAR_ZERO_EPSILON`, in `[0, 1]`.
    pub fn near_zero_fraction(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let near_zero = self
            .data
            .as_slice()
            .iter()
            .filter(|v| v.abs() < NEAR_ZERO_EPSILON)
            .count();
        near_zero as f32 / self.data.len() as f32
    }

    /// Resample to `width x height` over the same bounds.
    pub fn resampled(
        &self,
        executor: &ChunkedExecutor,
        width: usize,
        height: usize,
        method: Interpolation,
    ) -> Result<Self, ExecutorError> {
        let data = parallel_zoom(executor, &self.data, width, height, method)?;
        let (x0, y0, x1, y1) = self.bounds();
        Ok(Self {
            data,
            crs: self.crs,
            origin: (x0, y1),
            pixel_size: ((x1 - x0) / width.max(1) as f64, (y1 - y0) / height.max(1) as f64),
            nodata: self.nodata,
        })
    }

    /// Nominal ground resolution: the mean of the two pixel dimensions.
    pub fn resolution(&self) -> f64 {
        (self.pixel_size.0 + self.pixel_size.1) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raster(width: usize, height: usize, data: Vec<f32>, nodata: Option<f32>) -> ElevationRaster {
        ElevationRaster::from_bounds(
            Grid::from_vec(width, height, data).unwrap(),
            Crs(25833),
            (1000.0, 2000.0, 1000.0 + width as f64 * 2.0, 2000.0 + height as f64 * 2.0),
            nodata,
        )
        .unwrap()
    }

    #[test]
    fn test_bounds_roundtrip() {
        let r = raster(4, 3, vec![1.0; 12], None);
        assert_eq!(r.origin(), (1000.0, 2006.0));
        assert_eq!(r.pixel_size(), (2.0, 2.0));
        assert_eq!(r.bounds(), (1000.0, 2000.0, 1008.0, 2006.0));
        assert_eq!(r.resolution(), 2.0);
    }

    #[test]
    fn test_empty_rejected() {
        let empty = Grid::<f32>::new(0, 0);
        assert!(matches!(
            ElevationRaster::new(empty, Crs::WGS84, (0.0, 0.0), (1.0, 1.0), None),
            Err(RasterError::Empty)
        ));
    }

    #[test]
    fn test_fill_nodata_uses_nearest() {
        #[rustfmt::skip]
        let data = vec![
            10.0, -9999.0, -9999.0, 30.0,
            10.0, f32::NAN, -9999.0, 30.0,
        ];
        let r = raster(4, 2, data, Some(-9999.0));
        let filled = r.fill_nodata();
        assert_eq!(*filled.data().get(1, 0), 10.0);
        assert_eq!(*filled.data().get(2, 0), 30.0);
        assert_eq!(*filled.data().get(1, 1), 10.0);
        assert!(filled.valid_mask().all());
        // Original untouched
        assert_eq!(*r.data().get(1, 0), -9999.0);
    }

    #[test]
    fn test_fill_nodata_all_missing_is_noop() {
        let r = raster(2, 2, vec![-1.0; 4], Some(-1.0));
        assert_eq!(r.fill_nodata(), r);
    }

    #[test]
    fn test_near_zero_fraction() {
        let r = raster(4, 1, vec![0.0, 0.005, 12.0, -0.009], None);
        assert!((r.near_zero_fraction() - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_resampled_keeps_bounds() {
        let r = raster(8, 8, (0..64).map(|v| v as f32).collect(), None);
        let executor = ChunkedExecutor::new(2).unwrap();
        let up = r.resampled(&executor, 16, 12, Interpolation::Bilinear).unwrap();
        assert_eq!((up.width(), up.height()), (16, 12));
        let (a, b) = (r.bounds(), up.bounds());
        assert!((a.0 - b.0).abs() < 1e-9 && (a.1 - b.1).abs() < 1e-9);
        assert!((a.2 - b.2).abs() < 1e-9 && (a.3 - b.3).abs() < 1e-9);
    }
}
