//! Elevation acquisition from national and global DEM services.

pub mod engine;
pub mod geotiff;
pub mod mosaic;
pub mod provider;
pub mod request;
pub mod transport;
pub mod validate;

pub use engine::{
    AcquisitionOutcome, AcquisitionRequest, AcquisitionState, AttemptRecord, ElevationEngine, Provenance,
};
pub use provider::{global_sources, provider_for_country, AuthStrategy, ProviderConfig};
pub use request::sanitize_url;
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
