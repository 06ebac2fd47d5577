//! Request sizing, area chunking and URL construction.

use reqwest::Url;

use crate::error::AcquisitionError;

use super::provider::{Protocol, ProviderConfig, ResolvedAuth, WcsVersion};
use super::transport::HttpRequest;

/// Smallest raster dimension ever requested.
pub const MIN_REQUEST_PX: usize = 64;

const SENSITIVE_PARAMS: &[&str] = &["api-key", "api_key", "apikey", "token", "access_token", "key"];

/// An axis-aligned box in a provider's native CRS.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Extent {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Extent {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn as_tuple(&self) -> (f64, f64, f64, f64) {
        (self.min_x, self.min_y, self.max_x, self.max_y)
    }
}

/// Pixels needed to cover `extent_m` at `resolution_m`, kept within
/// `[64, max_px]`.
pub fn request_pixels(extent_m: f64, resolution_m: f64, max_px: usize) -> usize {
    let natural = if resolution_m > 0.0 && extent_m.is_finite() {
        (extent_m / resolution_m).max(0.0) as usize
    } else {
        0
    };
    natural.max(MIN_REQUEST_PX).min(max_px)
}

/// Split `[low, high]` into the fewest equal spans no wider than `max_span`.
/// The last span ends exactly at `high`.
pub fn compute_chunks_1d(low: f64, high: f64, max_span: f64) -> Vec<(f64, f64)> {
    let span = high - low;
    if !(span > 0.0) || !(max_span > 0.0) {
        return vec![(low, high)];
    }
    let n = (span / max_span).ceil().max(1.0) as usize;
    let step = span / n as f64;
    (0..n)
        .map(|i| {
            let lo = low + i as f64 * step;
            let hi = if i == n - 1 { high } else { low + (i + 1) as f64 * step };
            (lo, hi)
        })
        .collect()
}

/// One GetCoverage call.
#[derive(Clone, Debug, PartialEq)]
pub struct TileRequest {
    pub row: usize,
    pub col: usize,
    pub extent: Extent,
    pub width: usize,
    pub height: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FetchPlan {
    Single(TileRequest),
    /// Tiles ordered row by row from the south edge, west to east.
    Chunked {
        columns: usize,
        rows: usize,
        tiles: Vec<TileRequest>,
    },
}

impl FetchPlan {
    pub fn tile_count(&self) -> usize {
        match self {
            FetchPlan::Single(_) => 1,
            FetchPlan::Chunked { tiles, .. } => tiles.len(),
        }
    }
}

/// Decide between one request and a grid of area-limited tiles.
///
/// Chunking only happens for WCS sources that declare a per-axis area limit
/// smaller than the requested extent.
pub fn plan_fetch(provider: &ProviderConfig, extent: Extent, width: usize, height: usize) -> FetchPlan {
    let limit = match (&provider.protocol, provider.max_area_m) {
        (Protocol::Wcs { .. }, Some(limit)) if extent.width() > limit || extent.height() > limit => limit,
        _ => {
            return FetchPlan::Single(TileRequest {
                row: 0,
                col: 0,
                extent,
                width,
                height,
            })
        }
    };

    let x_chunks = compute_chunks_1d(extent.min_x, extent.max_x, limit);
    let y_chunks = compute_chunks_1d(extent.min_y, extent.max_y, limit);
    let mut tiles = Vec::with_capacity(x_chunks.len() * y_chunks.len());
    for (row, &(y_lo, y_hi)) in y_chunks.iter().enumerate() {
        for (col, &(x_lo, x_hi)) in x_chunks.iter().enumerate() {
            tiles.push(TileRequest {
                row,
                col,
                extent: Extent::new(x_lo, y_lo, x_hi, y_hi),
                width: request_pixels(x_hi - x_lo, provider.resolution_m, provider.max_request_size),
                height: request_pixels(y_hi - y_lo, provider.resolution_m, provider.max_request_size),
            });
        }
    }

    FetchPlan::Chunked {
        columns: x_chunks.len(),
        rows: y_chunks.len(),
        tiles,
    }
}

/// Build the GET request for one tile of `provider`.
pub fn build_request(
    provider: &ProviderConfig,
    tile: &TileRequest,
    auth: &ResolvedAuth,
) -> Result<HttpRequest, AcquisitionError> {
    let e = &tile.extent;
    let bbox = format!("{},{},{},{}", e.min_x, e.min_y, e.max_x, e.max_y);
    let crs = provider.native_crs.to_string();
    let mut params: Vec<(String, String)> = Vec::new();
    let mut push = |k: &str, v: String| params.push((k.to_string(), v));

    match &provider.protocol {
        Protocol::Wcs {
            version: WcsVersion::V1_0_0,
            coverage_id,
            format,
            ..
        } => {
            push("SERVICE", "WCS".into());
            push("VERSION", "1.0.0".into());
            push("REQUEST", "GetCoverage".into());
            push("COVERAGE", coverage_id.to_string());
            push("CRS", crs);
            push("BBOX", bbox);
            push("WIDTH", tile.width.to_string());
            push("HEIGHT", tile.height.to_string());
            push("FORMAT", format.to_string());
            params.extend(auth.query.iter().cloned());
        }
        Protocol::Wcs {
            version: WcsVersion::V1_1_1,
            coverage_id,
            format,
            ..
        } => {
            push("service", "WCS".into());
            push("version", "1.1.1".into());
            push("request", "GetCoverage".into());
            push("COVERAGE", coverage_id.to_string());
            push("FORMAT", format.to_string());
            push("CRS", crs.clone());
            push("RESPONSE_CRS", crs);
            push("BBOX", bbox);
            push("WIDTH", tile.width.to_string());
            push("HEIGHT", tile.height.to_string());
            params.extend(auth.query.iter().cloned());
        }
        Protocol::Wcs {
            version: WcsVersion::V2_0_1,
            coverage_id,
            format,
            axis_labels,
            supports_scalesize,
        } => {
            let (ax, ay) = *axis_labels;
            push("SERVICE", "WCS".into());
            push("VERSION", "2.0.1".into());
            push("REQUEST", "GetCoverage".into());
            push("CoverageID", coverage_id.to_string());
            push("FORMAT", format.to_string());
            params.extend(auth.query.iter().cloned());
            params.push(("SUBSET".into(), format!("{ax}({},{})", e.min_x, e.max_x)));
            params.push(("SUBSET".into(), format!("{ay}({},{})", e.min_y, e.max_y)));
            if *supports_scalesize {
                params.push((
                    "SCALESIZE".into(),
                    format!("{ax}({}),{ay}({})", tile.width, tile.height),
                ));
            }
        }
        Protocol::OpenTopography { dem_type } => {
            push("demtype", dem_type.to_string());
            push("south", e.min_y.to_string());
            push("north", e.max_y.to_string());
            push("west", e.min_x.to_string());
            push("east", e.max_x.to_string());
            push("outputFormat", "GTiff".into());
            params.extend(auth.query.iter().cloned());
        }
    }

    let url = Url::parse_with_params(provider.endpoint, &params)
        .map_err(|err| AcquisitionError::Unavailable(format!("invalid endpoint {}: {err}", provider.endpoint)))?;

    Ok(HttpRequest {
        url: url.into(),
        headers: auth.headers.clone(),
    })
}

/// Mask credential values in a URL so it can be logged.
///
/// Matches `name=` and the URL-encoded `name%3D`, case-insensitively.
pub fn sanitize_url(url: &str) -> String {
    let mut result = url.to_string();
    for name in SENSITIVE_PARAMS {
        for sep in ["=", "%3d"] {
            result = mask_values(&result, &format!("{name}{sep}"));
        }
    }
    result
}

fn mask_values(url: &str, pattern: &str) -> String {
    let lower = url.to_ascii_lowercase();
    let mut out = String::with_capacity(url.len());
    let mut pos = 0;

    while let Some(found) = lower[pos..].find(pattern) {
        let value_start = pos + found + pattern.len();
        let value_end = url[value_start..].find('&').map_or(url.len(), |i| value_start + i);
        out.push_str(&url[pos..value_start]);
        if value_end > value_start {
            out.push_str("***");
        }
        pos = value_end;
    }
    out.push_str(&url[pos..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elevation::provider::{global_sources, provider_for_country};
    use crate::geo::BoundingBox;

    fn query_pairs(req: &HttpRequest) -> Vec<(String, String)> {
        Url::parse(&req.url)
            .unwrap()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn test_request_pixels_clamped() {
        assert_eq!(request_pixels(10.0, 1.0, 4096), 64);
        assert_eq!(request_pixels(2000.0, 1.0, 4096), 2000);
        assert_eq!(request_pixels(50_000.0, 1.0, 4096), 4096);
        assert_eq!(request_pixels(1000.0, 0.4, 8192), 2500);
    }

    #[test]
    fn test_chunks_cover_exactly() {
        let chunks = compute_chunks_1d(100.0, 25_100.0, 10_000.0);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].0, 100.0);
        assert_eq!(chunks[2].1, 25_100.0);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
        for (lo, hi) in &chunks {
            assert!(hi - lo <= 10_000.0 + 1e-9);
        }
        assert_eq!(compute_chunks_1d(0.0, 5.0, 10.0), vec![(0.0, 5.0)]);
    }

    #[test]
    fn test_plan_25km_box_against_10km_limit() {
        let fi = provider_for_country("FI").unwrap();
        let extent = Extent::new(380_000.0, 6_670_000.0, 405_000.0, 6_695_000.0);
        let plan = plan_fetch(&fi, extent, 5000, 5000);
        match plan {
            FetchPlan::Chunked { columns, rows, tiles } => {
                assert_eq!((columns, rows), (3, 3));
                assert_eq!(tiles.len(), 9);
                for t in &tiles {
                    assert!(t.extent.width() <= 10_000.0 + 1e-6);
                    assert!(t.extent.height() <= 10_000.0 + 1e-6);
                    assert_eq!(t.width, 4166);
                }
                let area: f64 = tiles.iter().map(|t| t.extent.width() * t.extent.height()).sum();
                assert!((area - 25_000.0 * 25_000.0).abs() < 1.0);
                assert_eq!(tiles.last().unwrap().extent.max_x, 405_000.0);
            }
            other => panic!("expected chunked plan, got {other:?}"),
        }

        let small = Extent::new(380_000.0, 6_670_000.0, 385_000.0, 6_675_000.0);
        assert!(matches!(plan_fetch(&fi, small, 2500, 2500), FetchPlan::Single(_)));
    }

    #[test]
    fn test_wcs_2_0_1_params() {
        let ee = provider_for_country("EE").unwrap();
        let tile = TileRequest {
            row: 0,
            col: 0,
            extent: Extent::new(500_000.0, 6_500_000.0, 501_000.0, 6_501_000.0),
            width: 1000,
            height: 1000,
        };
        let req = build_request(&ee, &tile, &ResolvedAuth::default()).unwrap();
        let pairs = query_pairs(&req);
        let subsets: Vec<&str> = pairs.iter().filter(|(k, _)| k == "SUBSET").map(|(_, v)| v.as_str()).collect();
        assert_eq!(subsets, vec!["X(500000,501000)", "Y(6500000,6501000)"]);
        assert!(pairs.contains(&("SCALESIZE".into(), "X(1000),Y(1000)".into())));
        assert!(pairs.contains(&("CoverageID".into(), "dtm-1".into())));
    }

    #[test]
    fn test_wcs_1_0_0_params_with_token() {
        let dk = provider_for_country("DK").unwrap();
        let tile = TileRequest {
            row: 0,
            col: 0,
            extent: Extent::new(1.0, 2.0, 3.0, 4.0),
            width: 64,
            height: 80,
        };
        let auth = ResolvedAuth {
            query: vec![("token".into(), "abc".into())],
            headers: Vec::new(),
        };
        let req = build_request(&dk, &tile, &auth).unwrap();
        let pairs = query_pairs(&req);
        assert!(pairs.contains(&("BBOX".into(), "1,2,3,4".into())));
        assert!(pairs.contains(&("FORMAT".into(), "GTiff".into())));
        assert!(pairs.contains(&("HEIGHT".into(), "80".into())));
        assert!(pairs.contains(&("token".into(), "abc".into())));
        assert!(!sanitize_url(&req.url).contains("abc"));
    }

    #[test]
    fn test_opentopography_params() {
        let bbox = BoundingBox::new(10.0, 59.0, 10.5, 59.5).unwrap();
        let cop = &global_sources(&bbox)[0];
        let tile = TileRequest {
            row: 0,
            col: 0,
            extent: Extent::new(10.0, 59.0, 10.5, 59.5),
            width: 64,
            height: 64,
        };
        let auth = ResolvedAuth {
            query: vec![("API_Key".into(), "k".into())],
            headers: Vec::new(),
        };
        let pairs = query_pairs(&build_request(cop, &tile, &auth).unwrap());
        assert!(pairs.contains(&("demtype".into(), "COP30".into())));
        assert!(pairs.contains(&("south".into(), "59".into())));
        assert!(pairs.contains(&("east".into(), "10.5".into())));
        assert!(pairs.contains(&("outputFormat".into(), "GTiff".into())));
    }

    #[test]
    fn test_sanitize_url() {
        assert_eq!(
            sanitize_url("https://x/api?demtype=COP30&API_Key=abc123&west=1"),
            "https://x/api?demtype=COP30&API_Key=***&west=1"
        );
        assert_eq!(sanitize_url("https://x/?a=1&Token=zz"), "https://x/?a=1&Token=***");
        assert_eq!(sanitize_url("https://x/?q=token%3Dsecret&b=2"), "https://x/?q=token%3D***&b=2");
        assert_eq!(sanitize_url("https://x/?api-key=s1"), "https://x/?api-key=***");
        assert_eq!(sanitize_url("https://x/?plain=1"), "https://x/?plain=1");
    }
}
