//! Elevation source descriptors.
//!
//! Country sources serve national high-resolution DTMs over WCS. The global
//! chain goes through the OpenTopography DEM API and is tried in order when
//! the country source is missing or fails.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::config::CredentialSource;
use crate::error::AcquisitionError;
use crate::geo::{BoundingBox, Crs};

pub const OPENTOPOGRAPHY_ENDPOINT: &str = "https://portal.opentopography.org/API/globaldem";

/// SRTM has no coverage north of this latitude.
const SRTM_MAX_LATITUDE: f64 = 60.0;

/// How a source authenticates. Each variant names the environment
/// variables holding its secrets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthStrategy {
    None,
    /// Sent as the `token` query parameter
    Token { env_var: &'static str },
    /// Sent as a query parameter named `param`
    ApiKey { env_var: &'static str, param: &'static str },
    /// Sent as an `Authorization: Basic` header
    Basic {
        user_env: &'static str,
        password_env: &'static str,
    },
}

/// Credentials ready to attach to a request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedAuth {
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl AuthStrategy {
    pub fn is_required(&self) -> bool {
        !matches!(self, AuthStrategy::None)
    }

    /// Look up the secrets. A missing secret makes the source unavailable.
    pub fn resolve(&self, credentials: &impl CredentialSource) -> Result<ResolvedAuth, AcquisitionError> {
        let missing = |name: &str| AcquisitionError::Unavailable(format!("credential {name} is not configured"));

        match self {
            AuthStrategy::None => Ok(ResolvedAuth::default()),
            AuthStrategy::Token { env_var } => {
                let token = credentials.get(env_var).ok_or_else(|| missing(env_var))?;
                Ok(ResolvedAuth {
                    query: vec![("token".to_string(), token)],
                    headers: Vec::new(),
                })
            }
            AuthStrategy::ApiKey { env_var, param } => {
                let key = credentials.get(env_var).ok_or_else(|| missing(env_var))?;
                Ok(ResolvedAuth {
                    query: vec![(param.to_string(), key)],
                    headers: Vec::new(),
                })
            }
            AuthStrategy::Basic { user_env, password_env } => {
                let user = credentials.get(user_env).ok_or_else(|| missing(user_env))?;
                let password = credentials.get(password_env).ok_or_else(|| missing(password_env))?;
                let encoded = STANDARD.encode(format!("{user}:{password}"));
                Ok(ResolvedAuth {
                    query: Vec::new(),
                    headers: vec![("Authorization".to_string(), format!("Basic {encoded}"))],
                })
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WcsVersion {
    V1_0_0,
    /// May answer with a multipart MIME body
    V1_1_1,
    V2_0_1,
}

impl WcsVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            WcsVersion::V1_0_0 => "1.0.0",
            WcsVersion::V1_1_1 => "1.1.1",
            WcsVersion::V2_0_1 => "2.0.1",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Protocol {
    Wcs {
        version: WcsVersion,
        coverage_id: &'static str,
        /// Value of the FORMAT parameter
        format: &'static str,
        /// Axis labels for WCS 2.0.1 SUBSET/SCALESIZE
        axis_labels: (&'static str, &'static str),
        supports_scalesize: bool,
    },
    /// OpenTopography global DEM API; requests are made in WGS84 degrees.
    OpenTopography { dem_type: &'static str },
}

/// A single elevation source.
#[derive(Clone, Debug, PartialEq)]
pub struct ProviderConfig {
    /// Country code for national sources, DEM type for global ones
    pub code: &'static str,
    pub name: &'static str,
    pub endpoint: &'static str,
    pub protocol: Protocol,
    pub native_crs: Crs,
    /// Native ground resolution in metres
    pub resolution_m: f64,
    pub auth: AuthStrategy,
    /// Largest width or height a single request may ask for
    pub max_request_size: usize,
    /// Largest extent per axis (metres) a single request may cover
    pub max_area_m: Option<f64>,
}

impl ProviderConfig {
    /// "Norway (1 m)"
    pub fn label(&self) -> String {
        format!("{} ({} m)", self.name, self.resolution_m)
    }

    pub fn is_global(&self) -> bool {
        matches!(self.protocol, Protocol::OpenTopography { .. })
    }
}

fn wcs(
    version: WcsVersion,
    coverage_id: &'static str,
    format: &'static str,
    axis_labels: (&'static str, &'static str),
) -> Protocol {
    Protocol::Wcs {
        version,
        coverage_id,
        format,
        axis_labels,
        supports_scalesize: true,
    }
}

/// The national source for an ISO 3166-1 alpha-2 code, if there is one.
pub fn provider_for_country(code: &str) -> Option<ProviderConfig> {
    let provider = match code.to_ascii_uppercase().as_str() {
        "NO" => ProviderConfig {
            code: "NO",
            name: "Norway",
            endpoint: "https://wcs.geonorge.no/skwms1/wcs.hoyde-dtm-nhm-25833",
            protocol: wcs(WcsVersion::V1_0_0, "NHM_DTM_25833", "GeoTIFF", ("E", "N")),
            native_crs: Crs(25833),
            resolution_m: 1.0,
            auth: AuthStrategy::None,
            max_request_size: 4096,
            max_area_m: None,
        },
        "EE" => ProviderConfig {
            code: "EE",
            name: "Estonia",
            endpoint: "https://teenus.maaamet.ee/ows/wcs-dtm",
            protocol: wcs(WcsVersion::V2_0_1, "dtm-1", "image/tiff", ("X", "Y")),
            native_crs: Crs(3301),
            resolution_m: 1.0,
            auth: AuthStrategy::None,
            max_request_size: 4096,
            max_area_m: None,
        },
        "FI" => ProviderConfig {
            code: "FI",
            name: "Finland",
            endpoint: "https://avoin-karttakuva.maanmittauslaitos.fi/ortokuvat-ja-korkeusmallit/wcs/v2",
            protocol: wcs(WcsVersion::V2_0_1, "korkeusmalli_2m", "image/tiff", ("E", "N")),
            native_crs: Crs(3067),
            resolution_m: 2.0,
            auth: AuthStrategy::ApiKey {
                env_var: "NLS_FINLAND_API_KEY",
                param: "api-key",
            },
            max_request_size: 5000,
            max_area_m: Some(10_000.0),
        },
        "DK" => ProviderConfig {
            code: "DK",
            name: "Denmark",
            endpoint: "https://api.dataforsyningen.dk/dhm_wcs_DAF",
            protocol: wcs(WcsVersion::V1_0_0, "dhm_terraen", "GTiff", ("E", "N")),
            native_crs: Crs(25832),
            resolution_m: 0.4,
            auth: AuthStrategy::Token {
                env_var: "DATAFORSYNINGEN_TOKEN",
            },
            max_request_size: 8192,
            max_area_m: None,
        },
        "PL" => ProviderConfig {
            code: "PL",
            name: "Poland",
            endpoint: "https://mapy.geoportal.gov.pl/wss/service/PZGIK/NMT/GRID1/WCS/DigitalTerrainModelFormatTIFF",
            protocol: wcs(WcsVersion::V2_0_1, "DTM_PL-KRON86-NH_TIFF", "image/tiff", ("X", "Y")),
            native_crs: Crs(2180),
            resolution_m: 1.0,
            auth: AuthStrategy::None,
            max_request_size: 4096,
            // Larger requests come back silently truncated
            max_area_m: Some(5_000.0),
        },
        _ => return None,
    };
    Some(provider)
}

fn opentopography(dem_type: &'static str, name: &'static str) -> ProviderConfig {
    ProviderConfig {
        code: dem_type,
        name,
        endpoint: OPENTOPOGRAPHY_ENDPOINT,
        protocol: Protocol::OpenTopography { dem_type },
        native_crs: Crs::WGS84,
        resolution_m: 30.0,
        auth: AuthStrategy::ApiKey {
            env_var: "OPENTOPOGRAPHY_API_KEY",
            param: "API_Key",
        },
        max_request_size: 8192,
        max_area_m: None,
    }
}

/// Global fallback sources in priority order for `bbox`.
pub fn global_sources(bbox: &BoundingBox) -> Vec<ProviderConfig> {
    let mut sources = vec![opentopography("COP30", "Copernicus DEM GLO-30 (OpenTopography)")];
    if bbox.north() < SRTM_MAX_LATITUDE {
        sources.push(opentopography("SRTMGL1", "SRTM GL1 (OpenTopography)"));
    }
    sources.push(opentopography("AW3D30", "ALOS World 3D (OpenTopography)"));
    sources
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticCredentials;

    #[test]
    fn test_country_table() {
        let fi = provider_for_country("fi").unwrap();
        assert_eq!(fi.native_crs, Crs(3067));
        assert_eq!(fi.max_area_m, Some(10_000.0));
        assert!(fi.auth.is_required());

        let pl = provider_for_country("PL").unwrap();
        match pl.protocol {
            Protocol::Wcs { axis_labels, version, .. } => {
                assert_eq!(axis_labels, ("X", "Y"));
                assert_eq!(version, WcsVersion::V2_0_1);
            }
            _ => panic!("Poland should be WCS"),
        }
        assert!(provider_for_country("SE").is_none());
        assert!(provider_for_country("LV").is_none());
    }

    #[test]
    fn test_global_chain_skips_srtm_in_the_north() {
        let south = BoundingBox::new(10.0, 50.0, 10.1, 50.1).unwrap();
        let north = BoundingBox::new(10.0, 60.0, 10.1, 60.1).unwrap();
        let codes = |b: &BoundingBox| global_sources(b).iter().map(|p| p.code).collect::<Vec<_>>();
        assert_eq!(codes(&south), vec!["COP30", "SRTMGL1", "AW3D30"]);
        assert_eq!(codes(&north), vec!["COP30", "AW3D30"]);
    }

    #[test]
    fn test_auth_resolution() {
        let creds = StaticCredentials::new()
            .with("DATAFORSYNINGEN_TOKEN", "tok")
            .with("USER", "alice")
            .with("PASS", "secret");

        let token = AuthStrategy::Token {
            env_var: "DATAFORSYNINGEN_TOKEN",
        }
        .resolve(&creds)
        .unwrap();
        assert_eq!(token.query, vec![("token".to_string(), "tok".to_string())]);

        let basic = AuthStrategy::Basic {
            user_env: "USER",
            password_env: "PASS",
        }
        .resolve(&creds)
        .unwrap();
        assert_eq!(basic.headers[0].1, "Basic YWxpY2U6c2VjcmV0");

        let missing = AuthStrategy::ApiKey {
            env_var: "NLS_FINLAND_API_KEY",
            param: "api-key",
        }
        .resolve(&creds);
        assert!(matches!(missing, Err(AcquisitionError::Unavailable(_))));
    }

    #[test]
    fn test_label() {
        assert_eq!(provider_for_country("DK").unwrap().label(), "Denmark (0.4 m)");
    }
}
