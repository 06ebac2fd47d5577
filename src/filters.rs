//! Raster filters used throughout the pipeline.
//!
//! Every filter here is a pure function of its input grid, so the chunked
//! executor can run it on disjoint row spans from several threads at once.
//! Boundary handling mirrors what the pipeline has always used: gaussian
//! blurs reflect at the edges, resampling clamps, morphology treats the
//! outside as background.

use std::collections::VecDeque;
use std::ops::Range;

use rayon::prelude::*;

use crate::grid::Grid;

// ===== GAUSSIAN BLUR =====

/// Kernel half-width for a gaussian of the given sigma (truncated at 4 sigma).
pub fn gaussian_radius(sigma: f32) -> usize {
    (4.0 * sigma + 0.5) as usize
}

/// Generate a normalized 1D gaussian kernel.
fn generate_gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = gaussian_radius(sigma);
    let size = radius * 2 + 1;
    let sigma_sq = sigma * sigma;

    let mut kernel: Vec<f32> = (0..size)
        .map(|i| {
            let x = i as f32 - radius as f32;
            (-x * x / (2.0 * sigma_sq)).exp()
        })
        .collect();

    let total: f32 = kernel.iter().sum();
    for w in kernel.iter_mut() {
        *w /= total;
    }
    kernel
}

/// Mirror an out-of-range index back into `[0, n)` (d c b a | a b c d | d c b a).
fn reflect_index(i: i64, n: usize) -> usize {
    let n = n as i64;
    let period = 2 * n;
    let m = i.rem_euclid(period);
    if m < n {
        m as usize
    } else {
        (period - 1 - m) as usize
    }
}

/// Separable gaussian blur with reflected edges.
///
/// A sigma of zero (or below) returns the input unchanged.
pub fn gaussian_filter(grid: &Grid<f32>, sigma: f32) -> Grid<f32> {
    if sigma <= 0.0 || grid.is_empty() {
        return grid.clone();
    }

    let kernel = generate_gaussian_kernel(sigma);
    let half = (kernel.len() / 2) as i64;
    let width = grid.width;
    let height = grid.height;

    // Horizontal pass
    let mut horizontal = Grid::new_with(width, height, 0.0f32);
    for y in 0..height {
        let row = grid.row(y);
        for x in 0..width {
            let mut sum = 0.0;
            for (ki, &weight) in kernel.iter().enumerate() {
                let sx = reflect_index(x as i64 + ki as i64 - half, width);
                sum += row[sx] * weight;
            }
            horizontal.set(x, y, sum);
        }
    }

    // Vertical pass
    let mut result = Grid::new_with(width, height, 0.0f32);
    for y in 0..height {
        for x in 0..width {
            let mut sum = 0.0;
            for (ki, &weight) in kernel.iter().enumerate() {
                let sy = reflect_index(y as i64 + ki as i64 - half, height);
                sum += *horizontal.get(x, sy) * weight;
            }
            result.set(x, y, sum);
        }
    }

    result
}

// ===== RESAMPLING =====

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interpolation {
    Bilinear,
    /// Catmull-Rom cubic
    Cubic,
}

/// Source coordinate for output index `i` when mapping `n_in` samples onto
/// `n_out` samples with the first and last samples aligned.
fn aligned_source(i: usize, n_in: usize, n_out: usize) -> f32 {
    if n_out <= 1 || n_in <= 1 {
        return 0.0;
    }
    i as f64 as f32 * ((n_in - 1) as f32 / (n_out - 1) as f32)
}

/// Resample a grid to `out_width x out_height` with corner-aligned sampling.
pub fn resample(grid: &Grid<f32>, out_width: usize, out_height: usize, method: Interpolation) -> Grid<f32> {
    resample_rows(grid, 0, grid.height, out_width, 0..out_height, out_height, method)
}

/// Produce output rows `out_rows` of a resample whose full source has
/// `total_rows` rows and whose full output has `total_out_rows` rows.
///
/// `chunk` holds source rows starting at `chunk_offset`. Sampling uses global
/// row coordinates, so a chunk with enough halo rows yields exactly the rows
/// a whole-array resample would.
pub fn resample_rows(
    chunk: &Grid<f32>,
    chunk_offset: usize,
    total_rows: usize,
    out_width: usize,
    out_rows: Range<usize>,
    total_out_rows: usize,
    method: Interpolation,
) -> Grid<f32> {
    let rows = out_rows.len();
    let mut result = Grid::new_with(out_width, rows, 0.0f32);
    if chunk.is_empty() {
        return result;
    }

    for (local_y, out_y) in out_rows.enumerate() {
        let sy = aligned_source(out_y, total_rows, total_out_rows) - chunk_offset as f32;
        for out_x in 0..out_width {
            let sx = aligned_source(out_x, chunk.width, out_width);
            let value = match method {
                Interpolation::Bilinear => chunk.sample_bilinear(sx, sy),
                Interpolation::Cubic => chunk.sample_bicubic(sx, sy),
            };
            result.set(out_x, local_y, value);
        }
    }

    result
}

// ===== MORPHOLOGY =====

/// City-block distance from every pixel to the nearest `true` pixel.
/// Pixels with no `true` pixel anywhere get `u32::MAX`.
fn manhattan_distance_to_set(mask: &Grid<bool>) -> Grid<u32> {
    let width = mask.width;
    let height = mask.height;
    let far = u32::MAX / 2;
    let mut dist = mask.map(|&v| if v { 0 } else { far });

    // Forward pass
    for y in 0..height {
        for x in 0..width {
            let mut d = *dist.get(x, y);
            if x > 0 {
                d = d.min(dist.get(x - 1, y) + 1);
            }
            if y > 0 {
                d = d.min(dist.get(x, y - 1) + 1);
            }
            dist.set(x, y, d);
        }
    }

    // Backward pass
    for y in (0..height).rev() {
        for x in (0..width).rev() {
            let mut d = *dist.get(x, y);
            if x + 1 < width {
                d = d.min(dist.get(x + 1, y) + 1);
            }
            if y + 1 < height {
                d = d.min(dist.get(x, y + 1) + 1);
            }
            dist.set(x, y, d);
        }
    }

    dist
}

/// Binary dilation with the 4-connected cross element, repeated `iterations` times.
///
/// Repeating the cross `k` times reaches exactly the pixels within city-block
/// distance `k`, which is computed directly in two passes.
pub fn binary_dilation(mask: &Grid<bool>, iterations: usize) -> Grid<bool> {
    if iterations == 0 {
        return mask.clone();
    }
    let dist = manhattan_distance_to_set(mask);
    dist.map(|&d| (d as usize) <= iterations)
}

/// Label 4-connected components of `true` pixels.
///
/// Returns the label grid (0 = background, 1..=count) and the component count.
pub fn label_components(mask: &Grid<bool>) -> (Grid<u32>, u32) {
    let mut labels = Grid::new_with(mask.width, mask.height, 0u32);
    let mut count = 0u32;
    let mut queue = VecDeque::new();

    for y in 0..mask.height {
        for x in 0..mask.width {
            if !*mask.get(x, y) || *labels.get(x, y) != 0 {
                continue;
            }
            count += 1;
            labels.set(x, y, count);
            queue.push_back((x, y));

            while let Some((cx, cy)) = queue.pop_front() {
                for (nx, ny) in mask.neighbors(cx, cy) {
                    if *mask.get(nx, ny) && *labels.get(nx, ny) == 0 {
                        labels.set(nx, ny, count);
                        queue.push_back((nx, ny));
                    }
                }
            }
        }
    }

    (labels, count)
}

// ===== DISTANCE TRANSFORM =====

const EDT_INF: f64 = 1e20;

/// One-dimensional squared distance transform of a sampled function
/// (lower envelope of parabolas).
fn edt_1d(f: &[f64], out: &mut [f64]) {
    let n = f.len();
    if n == 0 {
        return;
    }
    let mut v = vec![0usize; n];
    let mut z = vec![0.0f64; n + 1];
    let mut k = 0usize;
    z[0] = f64::NEG_INFINITY;
    z[1] = f64::INFINITY;

    let intersect = |q: usize, p: usize| {
        ((f[q] + (q * q) as f64) - (f[p] + (p * p) as f64)) / (2.0 * q as f64 - 2.0 * p as f64)
    };

    for q in 1..n {
        let mut s = intersect(q, v[k]);
        // z[0] is -inf, so k never underflows
        while s <= z[k] {
            k -= 1;
            s = intersect(q, v[k]);
        }
        k += 1;
        v[k] = q;
        z[k] = s;
        z[k + 1] = f64::INFINITY;
    }

    k = 0;
    for (q, slot) in out.iter_mut().enumerate() {
        while z[k + 1] < q as f64 {
            k += 1;
        }
        let p = v[k];
        let d = q as f64 - p as f64;
        *slot = d * d + f[p];
    }
}

/// Exact Euclidean distance from every `true` pixel to the nearest `false`
/// pixel. `false` pixels get 0. A grid with no `false` pixel at all yields
/// very large distances for every pixel.
///
/// Columns and then rows are processed in parallel on the current rayon pool.
pub fn distance_transform_edt(mask: &Grid<bool>) -> Grid<f32> {
    let width = mask.width;
    let height = mask.height;
    if width == 0 || height == 0 {
        return Grid::new_with(width, height, 0.0);
    }

    // Column pass
    let columns: Vec<Vec<f64>> = (0..width)
        .into_par_iter()
        .map(|x| {
            let f: Vec<f64> = (0..height)
                .map(|y| if *mask.get(x, y) { EDT_INF } else { 0.0 })
                .collect();
            let mut out = vec![0.0; height];
            edt_1d(&f, &mut out);
            out
        })
        .collect();

    let mut squared = vec![0.0f64; width * height];
    for (x, column) in columns.iter().enumerate() {
        for (y, &d) in column.iter().enumerate() {
            squared[y * width + x] = d;
        }
    }

    // Row pass
    let distances: Vec<f32> = squared
        .par_chunks(width)
        .flat_map_iter(|row| {
            let mut out = vec![0.0; width];
            edt_1d(row, &mut out);
            out.into_iter().map(|d| d.sqrt() as f32)
        })
        .collect();

    Grid::from_vec(width, height, distances).unwrap_or_else(|| Grid::new_with(width, height, 0.0))
}

// ===== DERIVATIVES & STATISTICS =====

/// Central-difference gradient with one-sided differences at the edges.
/// Returns `(d/dy, d/dx)` in elevation units per metre for the given pixel spacing.
pub fn gradient(grid: &Grid<f32>, spacing_y: f32, spacing_x: f32) -> (Grid<f32>, Grid<f32>) {
    let width = grid.width;
    let height = grid.height;
    let mut gy = Grid::new_with(width, height, 0.0f32);
    let mut gx = Grid::new_with(width, height, 0.0f32);

    for y in 0..height {
        for x in 0..width {
            let dx = if width < 2 {
                0.0
            } else if x == 0 {
                (grid.get(1, y) - grid.get(0, y)) / spacing_x
            } else if x == width - 1 {
                (grid.get(x, y) - grid.get(x - 1, y)) / spacing_x
            } else {
                (grid.get(x + 1, y) - grid.get(x - 1, y)) / (2.0 * spacing_x)
            };
            let dy = if height < 2 {
                0.0
            } else if y == 0 {
                (grid.get(x, 1) - grid.get(x, 0)) / spacing_y
            } else if y == height - 1 {
                (grid.get(x, y) - grid.get(x, y - 1)) / spacing_y
            } else {
                (grid.get(x, y + 1) - grid.get(x, y - 1)) / (2.0 * spacing_y)
            };
            gx.set(x, y, dx);
            gy.set(x, y, dy);
        }
    }

    (gy, gx)
}

/// Percentile `q` (0-100) with linear interpolation between closest ranks.
/// Returns None for an empty slice. The slice is reordered.
pub fn percentile(values: &mut [f32], q: f32) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let rank = (q.clamp(0.0, 100.0) / 100.0) * (values.len() - 1) as f32;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f32;
    Some(values[lo] + (values[hi] - values[lo]) * frac)
}

/// Linear ramp: 0 at or below `start`, 1 at or above `end`.
pub fn ramp(value: f32, start: f32, end: f32) -> f32 {
    if end <= start {
        return if value >= end { 1.0 } else { 0.0 };
    }
    ((value - start) / (end - start)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_from(width: usize, height: usize, on: &[(usize, usize)]) -> Grid<bool> {
        let mut mask = Grid::new_with(width, height, false);
        for &(x, y) in on {
            mask.set(x, y, true);
        }
        mask
    }

    #[test]
    fn test_gaussian_preserves_constant() {
        let grid = Grid::new_with(16, 12, 42.0f32);
        let blurred = gaussian_filter(&grid, 2.0);
        for (_, _, &v) in blurred.iter() {
            assert!((v - 42.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_gaussian_spreads_impulse_symmetrically() {
        let mut grid = Grid::new_with(21, 21, 0.0f32);
        grid.set(10, 10, 1.0);
        let blurred = gaussian_filter(&grid, 1.5);
        let total: f32 = blurred.as_slice().iter().sum();
        assert!((total - 1.0).abs() < 1e-4);
        assert!((blurred.get(8, 10) - blurred.get(12, 10)).abs() < 1e-6);
        assert!((blurred.get(10, 7) - blurred.get(7, 10)).abs() < 1e-6);
        assert!(*blurred.get(10, 10) < 1.0);
    }

    #[test]
    fn test_reflect_index() {
        assert_eq!(reflect_index(-1, 4), 0);
        assert_eq!(reflect_index(-2, 4), 1);
        assert_eq!(reflect_index(4, 4), 3);
        assert_eq!(reflect_index(5, 4), 2);
        assert_eq!(reflect_index(2, 4), 2);
    }

    #[test]
    fn test_resample_corner_aligned() {
        let grid = Grid::from_vec(3, 1, vec![0.0, 10.0, 20.0]).unwrap();
        let up = resample(&grid, 5, 1, Interpolation::Bilinear);
        let expected = [0.0, 5.0, 10.0, 15.0, 20.0];
        for (x, e) in expected.iter().enumerate() {
            assert!((up.get(x, 0) - e).abs() < 1e-4);
        }
        let cubic = resample(&grid, 5, 1, Interpolation::Cubic);
        assert!((cubic.get(0, 0) - 0.0).abs() < 1e-4);
        assert!((cubic.get(4, 0) - 20.0).abs() < 1e-4);
    }

    #[test]
    fn test_dilation_reaches_city_block_distance() {
        let mask = mask_from(9, 9, &[(4, 4)]);
        let once = binary_dilation(&mask, 1);
        assert_eq!(once.count_true(), 5);
        let twice = binary_dilation(&mask, 2);
        assert_eq!(twice.count_true(), 13);
        assert!(!*twice.get(6, 6));
        assert!(*twice.get(6, 4));
    }

    #[test]
    fn test_label_components_separates_regions() {
        let mask = mask_from(6, 3, &[(0, 0), (1, 0), (4, 2), (5, 2), (5, 1)]);
        let (labels, count) = label_components(&mask);
        assert_eq!(count, 2);
        assert_eq!(labels.get(0, 0), labels.get(1, 0));
        assert_ne!(labels.get(0, 0), labels.get(5, 2));
        assert_eq!(*labels.get(3, 1), 0);
    }

    #[test]
    fn test_diagonal_pixels_are_separate_components() {
        let mask = mask_from(3, 3, &[(0, 0), (1, 1)]);
        let (_, count) = label_components(&mask);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_edt_matches_brute_force() {
        let mut mask = Grid::new_with(12, 9, true);
        for &(x, y) in &[(0, 0), (7, 3), (11, 8), (3, 6)] {
            mask.set(x, y, false);
        }
        let edt = distance_transform_edt(&mask);
        for (x, y, &d) in edt.iter() {
            let brute = [(0, 0), (7, 3), (11, 8), (3, 6)]
                .iter()
                .map(|&(bx, by): &(i32, i32)| {
                    let dx = (x as i32 - bx) as f32;
                    let dy = (y as i32 - by) as f32;
                    (dx * dx + dy * dy).sqrt()
                })
                .fold(f32::MAX, f32::min);
            assert!((d - brute).abs() < 1e-4, "({x},{y}) {d} vs {brute}");
        }
    }

    #[test]
    fn test_gradient_of_plane() {
        let grid = Grid::from_vec(4, 3, (0..12).map(|i| ((i % 4) * 2 + (i / 4) * 3) as f32).collect()).unwrap();
        let (gy, gx) = gradient(&grid, 1.0, 2.0);
        for (_, _, &v) in gx.iter() {
            assert!((v - 1.0).abs() < 1e-6);
        }
        for (_, _, &v) in gy.iter() {
            assert!((v - 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_percentile_interpolates() {
        let mut values = vec![5.0, 1.0, 3.0, 2.0, 4.0];
        assert_eq!(percentile(&mut values, 50.0), Some(3.0));
        assert!((percentile(&mut values, 10.0).unwrap() - 1.4).abs() < 1e-6);
        assert_eq!(percentile(&mut [], 10.0), None);
    }

    #[test]
    fn test_ramp() {
        assert_eq!(ramp(20.0, 25.0, 40.0), 0.0);
        assert_eq!(ramp(50.0, 25.0, 40.0), 1.0);
        assert!((ramp(32.5, 25.0, 40.0) - 0.5).abs() < 1e-6);
    }
}
