/// A 2D raster grid stored row-major. Row 0 is the north edge of whatever
/// area the grid covers; x grows east, y grows south.
#[derive(Clone, Debug, PartialEq)]
pub struct Grid<T> {
    pub width: usize,
    pub height: usize,
    data: Vec<T>,
}

impl<T: Clone + Default> Grid<T> {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![T::default(); width * height],
        }
    }
}

impl<T: Clone> Grid<T> {
    pub fn new_with(width: usize, height: usize, value: T) -> Self {
        Self {
            width,
            height,
            data: vec![value; width * height],
        }
    }

    /// Wrap an existing row-major buffer. Returns None when the buffer length
    /// does not match `width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Option<Self> {
        if data.len() != width * height {
            return None;
        }
        Some(Self { width, height, data })
    }

    fn index(&self, x: usize, y: usize) -> usize {
        debug_assert!(x < self.width && y < self.height);
        y * self.width + x
    }

    pub fn get(&self, x: usize, y: usize) -> &T {
        &self.data[self.index(x, y)]
    }

    pub fn get_mut(&mut self, x: usize, y: usize) -> &mut T {
        let idx = self.index(x, y);
        &mut self.data[idx]
    }

    pub fn set(&mut self, x: usize, y: usize, value: T) {
        let idx = self.index(x, y);
        self.data[idx] = value;
    }

    /// Get with signed coordinates clamped to the grid edge.
    pub fn get_clamped(&self, x: i64, y: i64) -> &T {
        let cx = x.clamp(0, self.width as i64 - 1) as usize;
        let cy = y.clamp(0, self.height as i64 - 1) as usize;
        self.get(cx, cy)
    }

    /// Fill the entire grid with a value.
    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    pub fn row(&self, y: usize) -> &[T] {
        let start = y * self.width;
        &self.data[start..start + self.width]
    }

    /// Copy rows `[start, end)` into a new grid.
    pub fn rows(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.height);
        let start = start.min(end);
        Self {
            width: self.width,
            height: end - start,
            data: self.data[start * self.width..end * self.width].to_vec(),
        }
    }

    /// Stack grids of equal width on top of each other.
    /// Returns None if the widths disagree.
    pub fn vstack(parts: Vec<Grid<T>>) -> Option<Self> {
        let width = parts.first().map(|g| g.width).unwrap_or(0);
        if parts.iter().any(|g| g.width != width) {
            return None;
        }
        let height = parts.iter().map(|g| g.height).sum();
        let mut data = Vec::with_capacity(width * height);
        for part in parts {
            data.extend(part.data);
        }
        Some(Self { width, height, data })
    }

    /// Apply a function to every cell, producing a grid of the same shape.
    pub fn map<U, F: Fn(&T) -> U>(&self, f: F) -> Grid<U> {
        Grid {
            width: self.width,
            height: self.height,
            data: self.data.iter().map(f).collect(),
        }
    }

    /// Combine two grids of identical shape cell by cell.
    pub fn zip_map<U: Clone, V, F: Fn(&T, &U) -> V>(&self, other: &Grid<U>, f: F) -> Grid<V> {
        debug_assert_eq!((self.width, self.height), (other.width, other.height));
        Grid {
            width: self.width,
            height: self.height,
            data: self.data.iter().zip(other.data.iter()).map(|(a, b)| f(a, b)).collect(),
        }
    }

    pub fn same_shape<U>(&self, other: &Grid<U>) -> bool {
        self.width == other.width && self.height == other.height
    }

    /// Get 4-connected neighbors. Edges do not wrap.
    pub fn neighbors(&self, x: usize, y: usize) -> Vec<(usize, usize)> {
        let mut result = Vec::with_capacity(4);
        if x > 0 {
            result.push((x - 1, y));
        }
        if x + 1 < self.width {
            result.push((x + 1, y));
        }
        if y > 0 {
            result.push((x, y - 1));
        }
        if y + 1 < self.height {
            result.push((x, y + 1));
        }
        result
    }

    /// Iterate over all cells with their coordinates.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, &T)> {
        let width = self.width;
        self.data.iter().enumerate().map(move |(idx, val)| {
            (idx % width, idx / width, val)
        })
    }

    /// Iterate mutably over all cells with their coordinates.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, usize, &mut T)> {
        let width = self.width;
        self.data.iter_mut().enumerate().map(move |(idx, val)| {
            (idx % width, idx / width, val)
        })
    }
}

impl Grid<bool> {
    pub fn count_true(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }

    pub fn any(&self) -> bool {
        self.data.iter().any(|&v| v)
    }

    pub fn all(&self) -> bool {
        self.data.iter().all(|&v| v)
    }

    pub fn to_f32(&self) -> Grid<f32> {
        self.map(|&v| if v { 1.0 } else { 0.0 })
    }
}

impl Grid<f32> {
    /// Minimum and maximum over finite values, or None if there are none.
    pub fn finite_range(&self) -> Option<(f32, f32)> {
        let mut min_v = f32::MAX;
        let mut max_v = f32::MIN;
        let mut seen = false;
        for &v in &self.data {
            if v.is_finite() {
                min_v = min_v.min(v);
                max_v = max_v.max(v);
                seen = true;
            }
        }
        seen.then_some((min_v, max_v))
    }

    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        (self.data.iter().map(|&v| v as f64).sum::<f64>() / self.data.len() as f64) as f32
    }

    /// Sample at fractional coordinates using bicubic interpolation.
    /// Coordinates outside the grid are clamped to the edge.
    pub fn sample_bicubic(&self, x: f32, y: f32) -> f32 {
        let x0 = x.floor() as i64;
        let y0 = y.floor() as i64;

        let fx = x - x.floor();
        let fy = y - y.floor();

        // Sample 4x4 grid of points
        let mut values = [[0.0f32; 4]; 4];
        for (j, row) in values.iter_mut().enumerate() {
            for (i, value) in row.iter_mut().enumerate() {
                *value = *self.get_clamped(x0 + i as i64 - 1, y0 + j as i64 - 1);
            }
        }

        bicubic_interpolate(&values, fx, fy)
    }

    /// Sample using bilinear interpolation.
    pub fn sample_bilinear(&self, x: f32, y: f32) -> f32 {
        let x0 = x.floor() as i64;
        let y0 = y.floor() as i64;

        let fx = x - x.floor();
        let fy = y - y.floor();

        let v00 = *self.get_clamped(x0, y0);
        let v10 = *self.get_clamped(x0 + 1, y0);
        let v01 = *self.get_clamped(x0, y0 + 1);
        let v11 = *self.get_clamped(x0 + 1, y0 + 1);

        let v0 = v00 * (1.0 - fx) + v10 * fx;
        let v1 = v01 * (1.0 - fx) + v11 * fx;
        v0 * (1.0 - fy) + v1 * fy
    }
}

/// Bicubic interpolation using Catmull-Rom spline
fn bicubic_interpolate(values: &[[f32; 4]; 4], fx: f32, fy: f32) -> f32 {
    let mut row_values = [0.0f32; 4];
    for (j, row) in values.iter().enumerate() {
        row_values[j] = catmull_rom(row[0], row[1], row[2], row[3], fx);
    }
    catmull_rom(row_values[0], row_values[1], row_values[2], row_values[3], fy)
}

/// Catmull-Rom spline interpolation
fn catmull_rom(p0: f32, p1: f32, p2: f32, p3: f32, t: f32) -> f32 {
    let t2 = t * t;
    let t3 = t2 * t;

    0.5 * ((2.0 * p1)
        + (-p0 + p2) * t
        + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * t2
        + (-p0 + 3.0 * p1 - 3.0 * p2 + p3) * t3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_and_vstack_roundtrip() {
        let grid = Grid::from_vec(3, 4, (0..12).map(|v| v as f32).collect()).unwrap();
        let top = grid.rows(0, 2);
        let bottom = grid.rows(2, 4);
        assert_eq!(top.height, 2);
        assert_eq!(*bottom.get(0, 0), 6.0);
        let stacked = Grid::vstack(vec![top, bottom]).unwrap();
        assert_eq!(stacked, grid);
    }

    #[test]
    fn test_vstack_rejects_mismatched_widths() {
        let a = Grid::new_with(2, 2, 0u8);
        let b = Grid::new_with(3, 2, 0u8);
        assert!(Grid::vstack(vec![a, b]).is_none());
    }

    #[test]
    fn test_from_vec_length_check() {
        assert!(Grid::from_vec(2, 2, vec![0.0f32; 3]).is_none());
    }

    #[test]
    fn test_neighbors_at_corner() {
        let grid = Grid::new_with(4, 4, 0u8);
        let n = grid.neighbors(0, 0);
        assert_eq!(n.len(), 2);
        assert!(n.contains(&(1, 0)));
        assert!(n.contains(&(0, 1)));
    }

    #[test]
    fn test_bicubic_reproduces_samples() {
        let grid = Grid::from_vec(3, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]).unwrap();
        assert!((grid.sample_bicubic(1.0, 1.0) - 5.0).abs() < 1e-6);
        assert!((grid.sample_bilinear(0.5, 0.0) - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_finite_range_skips_nan() {
        let grid = Grid::from_vec(3, 1, vec![f32::NAN, -2.0, 7.5]).unwrap();
        assert_eq!(grid.finite_range(), Some((-2.0, 7.5)));
        let empty = Grid::new_with(2, 1, f32::NAN);
        assert_eq!(empty.finite_range(), None);
    }
}
