//! Burn vector features into binary masks on the job's pixel grid.
//!
//! Pixel mapping is a plain linear stretch of the WGS84 box onto the grid
//! (row 0 = north edge). Lines are drawn with a round brush, polygons are
//! scan-filled with the even-odd rule so holes stay open, and a non-zero
//! buffer grows polygon coverage by cross-shaped dilation.

use crate::features::{FeatureCollection, Geometry, Position, TagFilter};
use crate::filters::binary_dilation;
use crate::geo::BoundingBox;
use crate::grid::Grid;

/// Linear mapping from WGS84 degrees to pixel indices.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PixelFrame {
    west: f64,
    north: f64,
    lon_range: f64,
    lat_range: f64,
    width: usize,
    height: usize,
}

impl PixelFrame {
    pub fn new(bbox: &BoundingBox, width: usize, height: usize) -> Self {
        Self {
            west: bbox.west(),
            north: bbox.north(),
            lon_range: bbox.lon_span(),
            lat_range: bbox.lat_span(),
            width,
            height,
        }
    }

    /// Pixel containing `(lon, lat)`, clamped to the grid.
    pub fn to_pixel(&self, lon: f64, lat: f64) -> (i64, i64) {
        let px = ((lon - self.west) / self.lon_range * self.width as f64) as i64;
        let py = ((self.north - lat) / self.lat_range * self.height as f64) as i64;
        (
            px.clamp(0, self.width as i64 - 1),
            py.clamp(0, self.height as i64 - 1),
        )
    }

    fn ring_to_pixels(&self, ring: &[Position]) -> Vec<(i64, i64)> {
        ring.iter()
            .filter(|p| p.len() >= 2)
            .map(|p| self.to_pixel(p[0], p[1]))
            .collect()
    }
}

/// Rasterize the features of `collection` that pass `filter`.
///
/// `buffer_px` is the line half-width in pixels and, when any polygon was
/// drawn, the number of cross dilations applied to the finished mask.
pub fn rasterize_features(
    collection: &FeatureCollection,
    filter: &TagFilter,
    bbox: &BoundingBox,
    width: usize,
    height: usize,
    buffer_px: usize,
) -> Grid<bool> {
    let mut mask = Grid::new_with(width, height, false);
    if width == 0 || height == 0 {
        return mask;
    }

    let frame = PixelFrame::new(bbox, width, height);
    let line_width = if buffer_px > 0 { (buffer_px * 2).max(1) } else { 1 };
    let mut has_polygons = false;

    for feature in collection.filtered(filter) {
        if let Some(geometry) = &feature.geometry {
            has_polygons |= draw_geometry(&mut mask, &frame, geometry, line_width);
        }
    }

    if buffer_px > 0 && has_polygons {
        mask = binary_dilation(&mask, buffer_px);
    }
    mask
}

/// Draw one geometry. Returns true if it contained a polygon.
fn draw_geometry(mask: &mut Grid<bool>, frame: &PixelFrame, geometry: &Geometry, line_width: usize) -> bool {
    match geometry {
        Geometry::Point { coordinates } => {
            if coordinates.len() >= 2 {
                let (x, y) = frame.to_pixel(coordinates[0], coordinates[1]);
                stamp(mask, x, y, line_width);
            }
            false
        }
        Geometry::MultiPoint { coordinates } => {
            for (x, y) in frame.ring_to_pixels(coordinates) {
                stamp(mask, x, y, line_width);
            }
            false
        }
        Geometry::LineString { coordinates } => {
            draw_polyline(mask, &frame.ring_to_pixels(coordinates), line_width);
            false
        }
        Geometry::MultiLineString { coordinates } => {
            for line in coordinates {
                draw_polyline(mask, &frame.ring_to_pixels(line), line_width);
            }
            false
        }
        Geometry::Polygon { coordinates } => fill_polygon(mask, frame, coordinates),
        Geometry::MultiPolygon { coordinates } => {
            let mut drawn = false;
            for polygon in coordinates {
                drawn |= fill_polygon(mask, frame, polygon);
            }
            drawn
        }
        Geometry::GeometryCollection { geometries } => {
            let mut drawn = false;
            for g in geometries {
                drawn |= draw_geometry(mask, frame, g, line_width);
            }
            drawn
        }
    }
}

/// Set every pixel within a round brush of diameter `width` around (cx, cy).
fn stamp(mask: &mut Grid<bool>, cx: i64, cy: i64, width: usize) {
    if width <= 1 {
        set_if_inside(mask, cx, cy);
        return;
    }
    let r = width as f64 / 2.0;
    let reach = r.ceil() as i64;
    for dy in -reach..=reach {
        for dx in -reach..=reach {
            if ((dx * dx + dy * dy) as f64) <= r * r {
                set_if_inside(mask, cx + dx, cy + dy);
            }
        }
    }
}

fn set_if_inside(mask: &mut Grid<bool>, x: i64, y: i64) {
    if x >= 0 && y >= 0 && (x as usize) < mask.width && (y as usize) < mask.height {
        mask.set(x as usize, y as usize, true);
    }
}

fn draw_polyline(mask: &mut Grid<bool>, pixels: &[(i64, i64)], width: usize) {
    match pixels {
        [] => {}
        [single] => stamp(mask, single.0, single.1, width),
        _ => {
            for pair in pixels.windows(2) {
                for (x, y) in bresenham_line(pair[0], pair[1]) {
                    stamp(mask, x, y, width);
                }
            }
        }
    }
}

/// Bresenham's line algorithm, both endpoints included.
fn bresenham_line(from: (i64, i64), to: (i64, i64)) -> Vec<(i64, i64)> {
    let (x0, y0) = from;
    let (x1, y1) = to;
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    let (mut x, mut y) = (x0, y0);
    let mut path = Vec::with_capacity((dx - dy + 1) as usize);

    loop {
        path.push((x, y));
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
    path
}

/// Scan-fill a polygon (outer ring plus holes) with the even-odd rule and
/// stroke its outer ring so slivers narrower than a pixel still show up.
fn fill_polygon(mask: &mut Grid<bool>, frame: &PixelFrame, rings: &[Vec<Position>]) -> bool {
    let rings: Vec<Vec<(i64, i64)>> = rings
        .iter()
        .map(|r| frame.ring_to_pixels(r))
        .filter(|r| r.len() >= 3)
        .collect();
    if rings.is_empty() {
        return false;
    }

    let min_y = rings.iter().flatten().map(|p| p.1).min().unwrap_or(0);
    let max_y = rings.iter().flatten().map(|p| p.1).max().unwrap_or(-1);
    let mut crossings: Vec<f64> = Vec::new();

    for y in min_y..=max_y {
        let yc = y as f64;
        crossings.clear();
        for ring in &rings {
            let n = ring.len();
            for i in 0..n {
                let (xi, yi) = ring[i];
                let (xj, yj) = ring[(i + n - 1) % n];
                let (yi, yj) = (yi as f64, yj as f64);
                if (yi > yc) != (yj > yc) {
                    let t = (yc - yi) / (yj - yi);
                    crossings.push(xi as f64 + t * (xj - xi) as f64);
                }
            }
        }
        crossings.sort_by(|a, b| a.total_cmp(b));
        for span in crossings.chunks_exact(2) {
            let start = span[0].ceil() as i64;
            let end = span[1].floor() as i64;
            for x in start..=end {
                set_if_inside(mask, x, y);
            }
        }
    }

    let outer = &rings[0];
    let mut closed = outer.clone();
    closed.push(outer[0]);
    draw_polyline(mask, &closed, 1);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::Feature;

    fn unit_box() -> BoundingBox {
        BoundingBox::new(0.0, 0.0, 1.0, 1.0).unwrap()
    }

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> Vec<Position> {
        vec![vec![x0, y0], vec![x1, y0], vec![x1, y1], vec![x0, y1], vec![x0, y0]]
    }

    #[test]
    fn test_pixel_mapping_clamps() {
        let frame = PixelFrame::new(&unit_box(), 10, 10);
        assert_eq!(frame.to_pixel(0.0, 1.0), (0, 0));
        assert_eq!(frame.to_pixel(0.55, 0.45), (5, 5));
        assert_eq!(frame.to_pixel(1.0, 0.0), (9, 9));
        assert_eq!(frame.to_pixel(-3.0, 4.0), (0, 0));
    }

    #[test]
    fn test_polygon_fill_respects_holes() {
        let polygon = Geometry::Polygon {
            coordinates: vec![square(0.1, 0.1, 0.9, 0.9), square(0.4, 0.4, 0.6, 0.6)],
        };
        let fc = FeatureCollection::new(vec![Feature::new(polygon)]);
        let mask = rasterize_features(&fc, &TagFilter::any(), &unit_box(), 20, 20, 0);

        assert!(*mask.get(4, 4));
        assert!(*mask.get(15, 15));
        assert!(!*mask.get(10, 10), "hole should stay empty");
        assert!(!*mask.get(0, 0));
        assert!(!*mask.get(19, 19));
    }

    #[test]
    fn test_line_width_follows_buffer() {
        let line = Geometry::LineString {
            coordinates: vec![vec![0.0, 0.5], vec![1.0, 0.5]],
        };
        let fc = FeatureCollection::new(vec![Feature::new(line)]);

        let thin = rasterize_features(&fc, &TagFilter::any(), &unit_box(), 21, 21, 0);
        let thick = rasterize_features(&fc, &TagFilter::any(), &unit_box(), 21, 21, 2);

        let column = |m: &Grid<bool>| (0..21).filter(|&y| *m.get(10, y)).count();
        assert_eq!(column(&thin), 1);
        assert!(column(&thick) >= 4);
        assert!(thick.count_true() > thin.count_true());
    }

    #[test]
    fn test_polygon_buffer_dilates() {
        let polygon = Geometry::Polygon {
            coordinates: vec![square(0.4, 0.4, 0.6, 0.6)],
        };
        let fc = FeatureCollection::new(vec![Feature::new(polygon)]);
        let plain = rasterize_features(&fc, &TagFilter::any(), &unit_box(), 20, 20, 0);
        let grown = rasterize_features(&fc, &TagFilter::any(), &unit_box(), 20, 20, 2);
        assert!(grown.count_true() > plain.count_true());
        for (x, y, &on) in plain.iter() {
            if on {
                assert!(*grown.get(x, y));
            }
        }
    }

    #[test]
    fn test_filter_and_collection() {
        let fc = FeatureCollection::new(vec![
            Feature::new(Geometry::Point { coordinates: vec![0.25, 0.75] }).with_property("highway", "track"),
            Feature::new(Geometry::GeometryCollection {
                geometries: vec![Geometry::Point { coordinates: vec![0.75, 0.25] }],
            })
            .with_property("highway", "primary"),
        ]);
        let tracks = rasterize_features(&fc, &TagFilter::new("highway", &["track"]), &unit_box(), 8, 8, 0);
        assert_eq!(tracks.count_true(), 1);
        assert!(*tracks.get(2, 2));

        let all = rasterize_features(&fc, &TagFilter::any(), &unit_box(), 8, 8, 0);
        assert!(*all.get(6, 6));
    }

    #[test]
    fn test_bresenham_endpoints() {
        let path = bresenham_line((0, 0), (5, 2));
        assert_eq!(path.first(), Some(&(0, 0)));
        assert_eq!(path.last(), Some(&(5, 2)));
        assert_eq!(path.len(), 6);
    }
}
