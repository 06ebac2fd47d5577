//! Parallel chunked execution of raster filters.
//!
//! Large grids are split along the row axis into `workers` nearly equal
//! spans. Each span is padded with halo rows, filtered on its own worker
//! thread, then trimmed back to the span before reassembly. With a halo at
//! least as wide as the filter's support the result is identical to running
//! the filter on the whole grid.
//!
//! Scale-changing operations (resampling) get each span's exact output row
//! range up front, so the reassembled grid always has the requested height.

use std::ops::Range;
use std::sync::Arc;

use log::debug;
use rayon::prelude::*;

use crate::error::ExecutorError;
use crate::filters::{self, Interpolation};
use crate::grid::Grid;

/// Default worker count: available cores, capped at 8.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .min(8)
}

/// Split `rows` into `parts` spans, like an integer linspace from 0 to rows.
pub fn split_points(rows: usize, parts: usize) -> Vec<usize> {
    let parts = parts.max(1);
    (0..=parts).map(|i| i * rows / parts).collect()
}

/// What a resampling chunk must produce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResizeWindow {
    /// Row of the full source grid at which the padded chunk starts.
    pub chunk_offset: usize,
    /// Source rows in the full grid.
    pub total_rows: usize,
    /// Output rows (global indices) this chunk is responsible for.
    pub out_rows: Range<usize>,
    /// Output rows in the full result.
    pub total_out_rows: usize,
}

/// A fixed-size worker pool that runs filters on row chunks.
#[derive(Clone)]
pub struct ChunkedExecutor {
    workers: usize,
    pool: Arc<rayon::ThreadPool>,
}

impl std::fmt::Debug for ChunkedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedExecutor").field("workers", &self.workers).finish()
    }
}

impl ChunkedExecutor {
    pub fn new(workers: usize) -> Result<Self, ExecutorError> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("chunk-worker-{i}"))
            .build()?;
        Ok(Self {
            workers,
            pool: Arc::new(pool),
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Small grids and single-worker executors run the operation directly.
    pub fn should_chunk(&self, rows: usize) -> bool {
        self.workers > 1 && rows >= 4 * self.workers
    }

    /// Run `f` inside this executor's pool so nested rayon work uses its threads.
    pub fn install<R, F>(&self, f: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        self.pool.install(f)
    }

    /// Run a shape-preserving operation over row chunks with `overlap` halo rows.
    ///
    /// The operation must return a grid with the same number of rows as the
    /// padded chunk it was given. If any chunk fails, every chunk still runs
    /// to completion and the first error is returned; no partial grid escapes.
    pub fn run_chunked<T, U, F>(&self, grid: &Grid<T>, overlap: usize, op: F) -> Result<Grid<U>, ExecutorError>
    where
        T: Clone + Send + Sync,
        U: Clone + Send,
        F: Fn(&Grid<T>) -> Result<Grid<U>, ExecutorError> + Sync,
    {
        let rows = grid.height;
        if !self.should_chunk(rows) {
            return op(grid);
        }

        let starts = split_points(rows, self.workers);
        debug!("run_chunked: {} rows in {} chunks, overlap {}", rows, self.workers, overlap);

        let results: Vec<Result<Grid<U>, ExecutorError>> = self.pool.install(|| {
            (0..self.workers)
                .into_par_iter()
                .map(|idx| {
                    let start = starts[idx];
                    let end = starts[idx + 1];
                    let padded_start = start.saturating_sub(overlap);
                    let padded_end = (end + overlap).min(rows);

                    let chunk = grid.rows(padded_start, padded_end);
                    let filtered = op(&chunk)?;
                    if filtered.height != chunk.height {
                        return Err(ExecutorError::ChunkShape {
                            index: idx,
                            got: filtered.height,
                            expected: chunk.height,
                        });
                    }

                    let trim_start = start - padded_start;
                    Ok(filtered.rows(trim_start, trim_start + (end - start)))
                })
                .collect()
        });

        let parts = results.into_iter().collect::<Result<Vec<_>, _>>()?;
        Grid::vstack(parts).ok_or(ExecutorError::Reassembly)
    }

    /// Run a row-scaling operation (resampling) producing exactly `target_rows` rows.
    ///
    /// Each chunk's output row range is derived from the global target before
    /// any work starts; the operation must produce exactly that many rows.
    pub fn run_chunked_resize<T, U, F>(
        &self,
        grid: &Grid<T>,
        overlap: usize,
        target_rows: usize,
        op: F,
    ) -> Result<Grid<U>, ExecutorError>
    where
        T: Clone + Send + Sync,
        U: Clone + Send,
        F: Fn(&Grid<T>, &ResizeWindow) -> Result<Grid<U>, ExecutorError> + Sync,
    {
        let rows = grid.height;
        if !self.should_chunk(rows) || target_rows == 0 {
            let window = ResizeWindow {
                chunk_offset: 0,
                total_rows: rows,
                out_rows: 0..target_rows,
                total_out_rows: target_rows,
            };
            let result = op(grid, &window)?;
            if result.height != target_rows {
                return Err(ExecutorError::ChunkShape {
                    index: 0,
                    got: result.height,
                    expected: target_rows,
                });
            }
            return Ok(result);
        }

        let zoom_y = target_rows as f64 / rows as f64;
        let starts = split_points(rows, self.workers);
        let mut out_starts: Vec<usize> = starts
            .iter()
            .map(|&s| ((s as f64 * zoom_y).round() as usize).min(target_rows))
            .collect();
        if let Some(last) = out_starts.last_mut() {
            *last = target_rows;
        }
        debug!(
            "run_chunked_resize: {} -> {} rows in {} chunks, overlap {}",
            rows, target_rows, self.workers, overlap
        );

        let results: Vec<Result<Grid<U>, ExecutorError>> = self.pool.install(|| {
            (0..self.workers)
                .into_par_iter()
                .map(|idx| {
                    let padded_start = starts[idx].saturating_sub(overlap);
                    let padded_end = (starts[idx + 1] + overlap).min(rows);
                    let window = ResizeWindow {
                        chunk_offset: padded_start,
                        total_rows: rows,
                        out_rows: out_starts[idx]..out_starts[idx + 1],
                        total_out_rows: target_rows,
                    };

                    let chunk = grid.rows(padded_start, padded_end);
                    let resized = op(&chunk, &window)?;
                    let expected = window.out_rows.len();
                    if resized.height != expected {
                        return Err(ExecutorError::ChunkShape {
                            index: idx,
                            got: resized.height,
                            expected,
                        });
                    }
                    Ok(resized)
                })
                .collect()
        });

        let parts = results.into_iter().collect::<Result<Vec<_>, _>>()?;
        Grid::vstack(parts).ok_or(ExecutorError::Reassembly)
    }
}

// ===== PARALLEL FILTER WRAPPERS =====

/// Gaussian blur over row chunks with a halo of `ceil(4 * sigma)` rows.
pub fn parallel_gaussian_filter(
    executor: &ChunkedExecutor,
    grid: &Grid<f32>,
    sigma: f32,
) -> Result<Grid<f32>, ExecutorError> {
    let overlap = ((4.0 * sigma).ceil() as usize).max(1);
    executor.run_chunked(grid, overlap, |chunk| Ok(filters::gaussian_filter(chunk, sigma)))
}

/// Resample to `out_width x out_height` over row chunks.
pub fn parallel_zoom(
    executor: &ChunkedExecutor,
    grid: &Grid<f32>,
    out_width: usize,
    out_height: usize,
    method: Interpolation,
) -> Result<Grid<f32>, ExecutorError> {
    // Cubic order 3 needs order + 2 halo rows; bilinear needs less but shares it.
    let overlap = 3 + 2;
    executor.run_chunked_resize(grid, overlap, out_height, |chunk, window| {
        Ok(filters::resample_rows(
            chunk,
            window.chunk_offset,
            window.total_rows,
            out_width,
            window.out_rows.clone(),
            window.total_out_rows,
            method,
        ))
    })
}

/// Euclidean distance transform using the executor's threads.
pub fn parallel_edt(executor: &ChunkedExecutor, mask: &Grid<bool>) -> Grid<f32> {
    executor.install(|| filters::distance_transform_edt(mask))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_grid(width: usize, height: usize) -> Grid<f32> {
        let data = (0..width * height)
            .map(|i| {
                let x = (i % width) as f32;
                let y = (i / width) as f32;
                (x * 0.37).sin() * 40.0 + (y * 0.21).cos() * 25.0 + y * 1.5
            })
            .collect();
        Grid::from_vec(width, height, data).unwrap()
    }

    #[test]
    fn test_split_points_cover_all_rows() {
        assert_eq!(split_points(10, 3), vec![0, 3, 6, 10]);
        assert_eq!(split_points(8, 4), vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn test_small_grids_skip_chunking() {
        let executor = ChunkedExecutor::new(4).unwrap();
        assert!(!executor.should_chunk(15));
        assert!(executor.should_chunk(16));
        let single = ChunkedExecutor::new(1).unwrap();
        assert!(!single.should_chunk(10_000));
    }

    #[test]
    fn test_chunked_gaussian_matches_unchunked() {
        let grid = ramp_grid(40, 97);
        let executor = ChunkedExecutor::new(4).unwrap();
        for sigma in [0.5f32, 1.1, 3.0] {
            let chunked = parallel_gaussian_filter(&executor, &grid, sigma).unwrap();
            let whole = filters::gaussian_filter(&grid, sigma);
            assert!(chunked.same_shape(&whole));
            for (a, b) in chunked.as_slice().iter().zip(whole.as_slice()) {
                assert!((a - b).abs() < 1e-4, "sigma {sigma}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_chunked_zoom_has_exact_shape() {
        let executor = ChunkedExecutor::new(3).unwrap();
        for &(rows, target) in &[(100usize, 129usize), (257, 129), (61, 200), (37, 37)] {
            let grid = ramp_grid(20, rows);
            let zoomed = parallel_zoom(&executor, &grid, 33, target, Interpolation::Cubic).unwrap();
            assert_eq!(zoomed.height, target);
            assert_eq!(zoomed.width, 33);
        }
    }

    #[test]
    fn test_chunked_zoom_matches_whole_resample() {
        let grid = ramp_grid(24, 90);
        let executor = ChunkedExecutor::new(3).unwrap();
        let chunked = parallel_zoom(&executor, &grid, 50, 181, Interpolation::Cubic).unwrap();
        let whole = filters::resample(&grid, 50, 181, Interpolation::Cubic);
        for (a, b) in chunked.as_slice().iter().zip(whole.as_slice()) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn test_chunk_failure_discards_everything() {
        let grid = ramp_grid(8, 64);
        let executor = ChunkedExecutor::new(4).unwrap();
        let result: Result<Grid<f32>, _> = executor.run_chunked(&grid, 2, |chunk| {
            if *chunk.get(0, 0) > 50.0 {
                Err(ExecutorError::Chunk { index: 0, message: "boom".into() })
            } else {
                Ok(chunk.clone())
            }
        });
        assert!(matches!(result, Err(ExecutorError::Chunk { .. })));
    }

    #[test]
    fn test_wrong_chunk_shape_is_reported() {
        let grid = ramp_grid(8, 64);
        let executor = ChunkedExecutor::new(4).unwrap();
        let result = executor.run_chunked(&grid, 2, |chunk| Ok(chunk.rows(0, 1)));
        assert!(matches!(result, Err(ExecutorError::ChunkShape { .. })));
    }

    #[test]
    fn test_parallel_edt_matches_serial() {
        let mut mask = Grid::new_with(30, 30, true);
        mask.set(3, 4, false);
        mask.set(25, 20, false);
        let executor = ChunkedExecutor::new(2).unwrap();
        assert_eq!(parallel_edt(&executor, &mask), filters::distance_transform_edt(&mask));
    }
}
