//! Geographic primitives: bounding boxes, CRS identifiers and projection.
//!
//! Projection goes through `proj4rs` with a small built-in table of the
//! coordinate systems the elevation providers deliver in.

use std::fmt;
use std::str::FromStr;

use proj4rs::proj::Proj;
use proj4rs::transform::transform;
use serde::{Deserialize, Serialize};

use crate::error::GeoError;

/// Metres per degree of latitude used for quick footprint estimates.
pub const METRES_PER_DEGREE: f64 = 111_320.0;

/// A WGS84 bounding box in degrees. Always satisfies west < east and south < north.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawBoundingBox")]
pub struct BoundingBox {
    west: f64,
    south: f64,
    east: f64,
    north: f64,
}

#[derive(Deserialize)]
struct RawBoundingBox {
    west: f64,
    south: f64,
    east: f64,
    north: f64,
}

impl TryFrom<RawBoundingBox> for BoundingBox {
    type Error = GeoError;

    fn try_from(raw: RawBoundingBox) -> Result<Self, Self::Error> {
        BoundingBox::new(raw.west, raw.south, raw.east, raw.north)
    }
}

impl BoundingBox {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Result<Self, GeoError> {
        let finite = [west, south, east, north].iter().all(|v| v.is_finite());
        let in_range = (-180.0..=180.0).contains(&west)
            && (-180.0..=180.0).contains(&east)
            && (-90.0..=90.0).contains(&south)
            && (-90.0..=90.0).contains(&north);
        if !finite || !in_range || west >= east || south >= north {
            return Err(GeoError::InvalidBoundingBox { west, south, east, north });
        }
        Ok(Self { west, south, east, north })
    }

    pub fn west(&self) -> f64 {
        self.west
    }

    pub fn south(&self) -> f64 {
        self.south
    }

    pub fn east(&self) -> f64 {
        self.east
    }

    pub fn north(&self) -> f64 {
        self.north
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.west + self.east) / 2.0, (self.south + self.north) / 2.0)
    }

    pub fn lon_span(&self) -> f64 {
        self.east - self.west
    }

    pub fn lat_span(&self) -> f64 {
        self.north - self.south
    }

    /// Approximate (width, height) in metres from a spherical degree length.
    pub fn estimate_dimensions_m(&self) -> (f64, f64) {
        let (_, lat_mid) = self.center();
        let width = self.lon_span() * METRES_PER_DEGREE * lat_mid.to_radians().cos();
        let height = self.lat_span() * METRES_PER_DEGREE;
        (width, height)
    }
}

impl FromStr for BoundingBox {
    type Err = GeoError;

    /// Parse "west,south,east,north".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|_| GeoError::InvalidBoundingBox {
                west: f64::NAN,
                south: f64::NAN,
                east: f64::NAN,
                north: f64::NAN,
            })?;
        match parts.as_slice() {
            [w, s, e, n] => BoundingBox::new(*w, *s, *e, *n),
            _ => Err(GeoError::InvalidBoundingBox {
                west: f64::NAN,
                south: f64::NAN,
                east: f64::NAN,
                north: f64::NAN,
            }),
        }
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6},{:.6},{:.6},{:.6}", self.west, self.south, self.east, self.north)
    }
}

// ===== CRS =====

/// A coordinate reference system identified by its EPSG code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Crs(pub u32);

impl Crs {
    pub const WGS84: Crs = Crs(4326);

    pub fn epsg(&self) -> u32 {
        self.0
    }

    pub fn is_geographic(&self) -> bool {
        self.0 == 4326
    }

    /// PROJ definition string for the supported systems.
    pub fn proj_string(&self) -> Option<String> {
        let towgs = "+ellps=GRS80 +towgs84=0,0,0,0,0,0,0 +units=m +no_defs";
        let def = match self.0 {
            4326 => "+proj=longlat +datum=WGS84 +no_defs".to_string(),
            // ETRS89 / UTM 32N, 33N, 35N
            25832 => format!("+proj=utm +zone=32 {towgs}"),
            25833 => format!("+proj=utm +zone=33 {towgs}"),
            25835 => format!("+proj=utm +zone=35 {towgs}"),
            // ETRS-TM35FIN
            3067 => format!("+proj=utm +zone=35 {towgs}"),
            // SWEREF99 TM
            3006 => format!("+proj=utm +zone=33 {towgs}"),
            // L-EST97
            3301 => format!(
                "+proj=lcc +lat_1=59.33333333333334 +lat_2=58 +lat_0=57.51755393055556 \
                 +lon_0=24 +x_0=500000 +y_0=6375000 {towgs}"
            ),
            // PL-1992
            2180 => format!("+proj=tmerc +lat_0=0 +lon_0=19 +k=0.9993 +x_0=500000 +y_0=-5300000 {towgs}"),
            // WGS84 / UTM north
            code @ 32601..=32660 => format!("+proj=utm +zone={} +datum=WGS84 +units=m +no_defs", code - 32600),
            _ => return None,
        };
        Some(def)
    }
}

impl FromStr for Crs {
    type Err = GeoError;

    /// Accepts "EPSG:25833" (any case) or a bare code.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let code = trimmed
            .strip_prefix("EPSG:")
            .or_else(|| trimmed.strip_prefix("epsg:"))
            .unwrap_or(trimmed);
        code.parse::<u32>()
            .map(Crs)
            .map_err(|_| GeoError::MalformedCrs(s.to_string()))
    }
}

impl TryFrom<String> for Crs {
    type Error = GeoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Crs> for String {
    fn from(crs: Crs) -> Self {
        crs.to_string()
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.0)
    }
}

// ===== PROJECTION =====

/// Projects WGS84 longitude/latitude to a projected CRS and back.
pub struct Projector {
    geographic: Proj,
    projected: Proj,
    crs: Crs,
}

impl fmt::Debug for Projector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Projector").field("crs", &self.crs).finish()
    }
}

impl Projector {
    pub fn new(crs: Crs) -> Result<Self, GeoError> {
        let target = crs.proj_string().ok_or(GeoError::UnsupportedCrs(crs.epsg()))?;
        let source = Crs::WGS84.proj_string().ok_or(GeoError::UnsupportedCrs(4326))?;

        let geographic = Proj::from_proj_string(&source)
            .map_err(|e| GeoError::Projection(format!("EPSG:4326: {e:?}")))?;
        let projected = Proj::from_proj_string(&target)
            .map_err(|e| GeoError::Projection(format!("{crs}: {e:?}")))?;

        Ok(Self { geographic, projected, crs })
    }

    pub fn crs(&self) -> Crs {
        self.crs
    }

    /// WGS84 degrees to projected metres.
    pub fn forward(&self, lon: f64, lat: f64) -> Result<(f64, f64), GeoError> {
        let mut point = (lon.to_radians(), lat.to_radians(), 0.0);
        transform(&self.geographic, &self.projected, &mut point)
            .map_err(|e| GeoError::Projection(format!("({lon}, {lat}) -> {}: {e:?}", self.crs)))?;
        Ok((point.0, point.1))
    }

    /// Projected metres to WGS84 degrees.
    pub fn inverse(&self, x: f64, y: f64) -> Result<(f64, f64), GeoError> {
        let mut point = (x, y, 0.0);
        transform(&self.projected, &self.geographic, &mut point)
            .map_err(|e| GeoError::Projection(format!("{} ({x}, {y}) -> EPSG:4326: {e:?}", self.crs)))?;
        Ok((point.0.to_degrees(), point.1.to_degrees()))
    }

    /// Project the south-west and north-east corners of a box.
    /// Returns (min_x, min_y, max_x, max_y) in projected metres.
    pub fn project_bbox(&self, bbox: &BoundingBox) -> Result<(f64, f64, f64, f64), GeoError> {
        let (x0, y0) = self.forward(bbox.west(), bbox.south())?;
        let (x1, y1) = self.forward(bbox.east(), bbox.north())?;
        Ok((x0, y0, x1, y1))
    }
}
