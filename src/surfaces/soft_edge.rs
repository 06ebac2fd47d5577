//! Soft-edged masks and slope-derived rock candidates.
//!
//! A binary region becomes a float mask that is 0 on its boundary and climbs
//! to 1 over `transition` pixels inland:
//!
//! 1. Measure every inside pixel's Euclidean distance to the nearest outside pixel
//! 2. Divide by the transition width
//! 3. Clamp to [0, 1]

use crate::filters::{self, ramp};
use crate::grid::Grid;
use crate::parallel::{parallel_edt, ChunkedExecutor};

/// Binary mask to float mask with a linear inland ramp of `transition_px`.
pub fn soft_edge_mask(executor: &ChunkedExecutor, mask: &Grid<bool>, transition_px: usize) -> Grid<f32> {
    if transition_px == 0 {
        return mask.to_f32();
    }
    if !mask.any() {
        return Grid::new_with(mask.width, mask.height, 0.0);
    }
    if mask.all() {
        return Grid::new_with(mask.width, mask.height, 1.0);
    }

    let transition = transition_px as f32;
    parallel_edt(executor, mask).map(|d| (d / transition).clamp(0.0, 1.0))
}

/// Slope angle in degrees for an elevation grid with square cells.
pub fn slope_degrees(elevation: &Grid<f32>, cell_size_m: f32) -> Grid<f32> {
    let spacing = if cell_size_m > 0.0 { cell_size_m } else { 1.0 };
    let (gy, gx) = filters::gradient(elevation, spacing, spacing);
    gy.zip_map(&gx, |dy, dx| dx.hypot(*dy).atan().to_degrees())
}

/// 0 below `start_deg`, 1 above `full_deg`, linear between.
pub fn slope_ramp(slope: &Grid<f32>, start_deg: f32, full_deg: f32) -> Grid<f32> {
    slope.map(|s| ramp(*s, start_deg, full_deg))
}

/// 0 at the treeline, 1 at `ramp_m` metres above it.
pub fn treeline_ramp(elevation: &Grid<f32>, treeline_m: f32, ramp_m: f32) -> Grid<f32> {
    elevation.map(|e| ramp(*e, treeline_m, treeline_m + ramp_m))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> ChunkedExecutor {
        ChunkedExecutor::new(2).unwrap()
    }

    #[test]
    fn test_soft_edge_ramps_inland() {
        let mut mask = Grid::new_with(21, 21, false);
        for y in 0..21 {
            for x in 5..16 {
                mask.set(x, y, true);
            }
        }
        let soft = soft_edge_mask(&executor(), &mask, 4);

        assert_eq!(*soft.get(2, 10), 0.0);
        // First inside column is one pixel from the boundary.
        assert!((soft.get(5, 10) - 0.25).abs() < 1e-6);
        assert!((soft.get(6, 10) - 0.5).abs() < 1e-6);
        assert_eq!(*soft.get(10, 10), 1.0);
        for (_, _, v) in soft.iter() {
            assert!((0.0..=1.0).contains(v));
        }
    }

    #[test]
    fn test_soft_edge_degenerate_masks() {
        let exec = executor();
        let empty = Grid::new_with(8, 8, false);
        assert!(soft_edge_mask(&exec, &empty, 3).iter().all(|(_, _, v)| *v == 0.0));

        let full = Grid::new_with(8, 8, true);
        assert!(soft_edge_mask(&exec, &full, 3).iter().all(|(_, _, v)| *v == 1.0));

        let mut single = Grid::new_with(8, 8, false);
        single.set(4, 4, true);
        let hard = soft_edge_mask(&exec, &single, 0);
        assert_eq!(*hard.get(4, 4), 1.0);
        assert_eq!(*hard.get(3, 4), 0.0);
    }

    #[test]
    fn test_slope_of_inclined_plane() {
        // Rises 1 m per metre eastwards: 45 degrees everywhere.
        let data = (0..100).map(|i| (i % 10) as f32 * 2.0).collect();
        let plane = Grid::from_vec(10, 10, data).unwrap();
        let slope = slope_degrees(&plane, 2.0);
        for (_, _, s) in slope.iter() {
            assert!((s - 45.0).abs() < 1e-3);
        }

        let rock = slope_ramp(&slope, 25.0, 40.0);
        assert!(rock.iter().all(|(_, _, v)| *v == 1.0));
        let gentle = slope_ramp(&slope, 50.0, 60.0);
        assert!(gentle.iter().all(|(_, _, v)| *v == 0.0));
    }

    #[test]
    fn test_treeline_ramp() {
        let elevation = Grid::from_vec(3, 1, vec![900.0, 1100.0, 1300.0]).unwrap();
        let above = treeline_ramp(&elevation, 1000.0, 200.0);
        assert_eq!(above.as_slice(), &[0.0, 0.5, 1.0]);
    }
}
