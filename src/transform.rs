//! Geographic <-> local terrain coordinates.
//!
//! The local frame is metric with its origin at the bounding box's
//! south-west corner: +x east, +z north. When a target terrain size is
//! given, the frame is stretched so the box maps exactly onto it.

use log::{info, warn};
use serde::Serialize;

use crate::error::GeoError;
use crate::features::{FeatureCollection, Position};
use crate::geo::{BoundingBox, Crs, Projector, METRES_PER_DEGREE};
use crate::grid::Grid;

/// Metres per degree of latitude for the equirectangular approximation.
const METRES_PER_DEGREE_LAT: f64 = 110_540.0;

enum Method {
    Projected { projector: Projector, origin: (f64, f64) },
    Equirectangular { m_per_deg_lon: f64, m_per_deg_lat: f64 },
}

/// A point in the local frame with an elevation sampled from a raster.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct LocalPoint {
    pub x: f64,
    /// Elevation, 0 when no raster was supplied.
    pub y: f64,
    pub z: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CornerMapping {
    pub wgs84: [f64; 2],
    pub local: [f64; 2],
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Corners {
    pub sw: CornerMapping,
    pub ne: CornerMapping,
    pub nw: CornerMapping,
    pub se: CornerMapping,
}

/// Where the corners and centre of the box land, for operator checks.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Verification {
    pub method: &'static str,
    pub crs: String,
    pub projected_width_m: f64,
    pub projected_depth_m: f64,
    pub terrain_size_m: Option<[f64; 2]>,
    pub corners: Corners,
    pub center: CornerMapping,
}

pub struct CoordinateTransform {
    bbox: BoundingBox,
    crs: Crs,
    method: Method,
    projected_width: f64,
    projected_depth: f64,
    target_size: Option<(f64, f64)>,
}

impl std::fmt::Debug for CoordinateTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinateTransform")
            .field("bbox", &self.bbox)
            .field("crs", &self.crs)
            .field("method", &self.method_name())
            .field("target_size", &self.target_size)
            .finish()
    }
}

impl CoordinateTransform {
    /// Build a transform for `bbox` in `crs`.
    ///
    /// A geographic CRS, or one the projection table does not know, falls
    /// back to the equirectangular approximation around the box's
    /// mid-latitude.
    pub fn new(bbox: BoundingBox, crs: Crs, target_size: Option<(f64, f64)>) -> Result<Self, GeoError> {
        if let Some((w, d)) = target_size {
            if !(w.is_finite() && d.is_finite() && w > 0.0 && d > 0.0) {
                return Err(GeoError::InvalidTargetSize { width: w, height: d });
            }
        }

        let projected = if crs.is_geographic() {
            None
        } else {
            match Projector::new(crs).and_then(|p| p.project_bbox(&bbox).map(|corners| (p, corners))) {
                Ok(found) => Some(found),
                Err(e) => {
                    warn!("Projection to {} unavailable ({}), using equirectangular approximation", crs, e);
                    None
                }
            }
        };

        let (method, projected_width, projected_depth) = match projected {
            Some((projector, (x0, y0, x1, y1))) => {
                info!(
                    "Coordinate transform: CRS={}, projected extent {:.1}m x {:.1}m",
                    crs,
                    x1 - x0,
                    y1 - y0
                );
                (Method::Projected { projector, origin: (x0, y0) }, x1 - x0, y1 - y0)
            }
            None => {
                let (_, center_lat) = bbox.center();
                let m_per_deg_lon = METRES_PER_DEGREE * center_lat.to_radians().cos();
                let width = bbox.lon_span() * m_per_deg_lon;
                let depth = bbox.lat_span() * METRES_PER_DEGREE_LAT;
                info!(
                    "Equirectangular approximation: extent {:.1}m x {:.1}m (center lat {:.2})",
                    width, depth, center_lat
                );
                (
                    Method::Equirectangular {
                        m_per_deg_lon,
                        m_per_deg_lat: METRES_PER_DEGREE_LAT,
                    },
                    width,
                    depth,
                )
            }
        };

        Ok(Self {
            bbox,
            crs,
            method,
            projected_width,
            projected_depth,
            target_size,
        })
    }

    pub fn projected_width(&self) -> f64 {
        self.projected_width
    }

    pub fn projected_depth(&self) -> f64 {
        self.projected_depth
    }

    /// Extent of the local frame: the target size if set, else the projected extent.
    pub fn local_extent(&self) -> (f64, f64) {
        self.target_size.unwrap_or((self.projected_width, self.projected_depth))
    }

    fn method_name(&self) -> &'static str {
        match self.method {
            Method::Projected { .. } => "proj",
            Method::Equirectangular { .. } => "equirectangular",
        }
    }

    /// WGS84 degrees to local metres `(x east, z north)`.
    pub fn to_local(&self, lon: f64, lat: f64) -> Result<(f64, f64), GeoError> {
        let (mut x, mut z) = match &self.method {
            Method::Projected { projector, origin } => {
                let (px, py) = projector.forward(lon, lat)?;
                (px - origin.0, py - origin.1)
            }
            Method::Equirectangular { m_per_deg_lon, m_per_deg_lat } => (
                (lon - self.bbox.west()) * m_per_deg_lon,
                (lat - self.bbox.south()) * m_per_deg_lat,
            ),
        };

        if let Some((tw, td)) = self.target_size {
            if self.projected_width > 0.0 {
                x *= tw / self.projected_width;
            }
            if self.projected_depth > 0.0 {
                z *= td / self.projected_depth;
            }
        }
        Ok((x, z))
    }

    /// Local metres back to WGS84 degrees `(lon, lat)`.
    pub fn to_geographic(&self, x: f64, z: f64) -> Result<(f64, f64), GeoError> {
        let (mut x, mut z) = (x, z);
        if let Some((tw, td)) = self.target_size {
            x *= self.projected_width / tw;
            z *= self.projected_depth / td;
        }

        match &self.method {
            Method::Projected { projector, origin } => projector.inverse(x + origin.0, z + origin.1),
            Method::Equirectangular { m_per_deg_lon, m_per_deg_lat } => Ok((
                self.bbox.west() + x / m_per_deg_lon,
                self.bbox.south() + z / m_per_deg_lat,
            )),
        }
    }

    fn transform_position(&self, position: &mut Position) -> Result<(), GeoError> {
        if position.len() < 2 {
            return Ok(());
        }
        let (x, z) = self.to_local(position[0], position[1])?;
        position[0] = x;
        position[1] = z;
        Ok(())
    }

    /// A copy of `collection` with every position converted to local metres.
    /// Values after the first two in each position are kept as they are.
    pub fn transform_collection(&self, collection: &FeatureCollection) -> Result<FeatureCollection, GeoError> {
        let mut result = collection.clone();
        for feature in &mut result.features {
            if let Some(geometry) = feature.geometry.as_mut() {
                geometry.try_for_each_position_mut(&mut |p| self.transform_position(p))?;
            }
        }
        Ok(result)
    }

    /// Convert `(lon, lat)` points to local metres, sampling the nearest
    /// elevation from `elevation` (row 0 = north edge) when given.
    /// Coordinates are rounded to millimetres.
    pub fn sample_points(
        &self,
        points: &[(f64, f64)],
        elevation: Option<&Grid<f32>>,
    ) -> Result<Vec<LocalPoint>, GeoError> {
        let (tw, td) = self.local_extent();
        points
            .iter()
            .map(|&(lon, lat)| {
                let (x, z) = self.to_local(lon, lat)?;
                let y = match elevation {
                    Some(grid) if !grid.is_empty() => {
                        let max_x = (grid.width - 1) as f64;
                        let max_z = (grid.height - 1) as f64;
                        let px = ((x / tw * max_x) as i64).clamp(0, max_x as i64) as usize;
                        let pz = ((z / td * max_z) as i64).clamp(0, max_z as i64) as usize;
                        let row = grid.height - 1 - pz;
                        *grid.get(px, row) as f64
                    }
                    _ => 0.0,
                };
                Ok(LocalPoint {
                    x: round3(x),
                    y: round3(y),
                    z: round3(z),
                })
            })
            .collect()
    }

    pub fn verification(&self) -> Result<Verification, GeoError> {
        let b = &self.bbox;
        let corner = |lon: f64, lat: f64| -> Result<CornerMapping, GeoError> {
            let (x, z) = self.to_local(lon, lat)?;
            Ok(CornerMapping {
                wgs84: [lon, lat],
                local: [x, z],
            })
        };
        let (center_lon, center_lat) = b.center();

        Ok(Verification {
            method: self.method_name(),
            crs: self.crs.to_string(),
            projected_width_m: self.projected_width,
            projected_depth_m: self.projected_depth,
            terrain_size_m: self.target_size.map(|(w, d)| [w, d]),
            corners: Corners {
                sw: corner(b.west(), b.south())?,
                ne: corner(b.east(), b.north())?,
                nw: corner(b.west(), b.north())?,
                se: corner(b.east(), b.south())?,
            },
            center: corner(center_lon, center_lat)?,
        })
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}
