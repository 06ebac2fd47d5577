//! Elevation acquisition state machine.
//!
//! Sources are tried in priority order: the national source for the job's
//! country, then the global chain. Each source is either fetched in one
//! request or split into area-limited tiles that are spilled to disk and
//! mosaicked. Retryable transport failures are retried against the same
//! source with exponential backoff; anything else moves on to the next
//! source. Running out of sources is reported as an outcome, not an error.

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::config::{CredentialSource, HttpConfig};
use crate::error::{AcquisitionError, FailureKind};
use crate::filters::Interpolation;
use crate::geo::{BoundingBox, Crs, Projector};
use crate::parallel::ChunkedExecutor;
use crate::raster::ElevationRaster;

use super::geotiff;
use super::mosaic::TileStore;
use super::provider::{global_sources, provider_for_country, ProviderConfig, ResolvedAuth};
use super::request::{build_request, plan_fetch, request_pixels, sanitize_url, Extent, FetchPlan, TileRequest};
use super::transport::Transport;
use super::validate::validate_response;

/// Near-zero share above which a decoded raster counts as truncated.
const TRUNCATION_THRESHOLD: f32 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum AcquisitionState {
    NotStarted,
    TryingCountrySource,
    ChunkedFetch,
    SingleFetch,
    Validating,
    TryNextFallback,
    GlobalFallback,
    Success,
    AllSourcesExhausted,
}

/// One failed source.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub source: String,
    pub resolution_m: f64,
    pub kind: FailureKind,
    pub message: String,
    /// Body size of the last response seen from this source
    pub bytes: usize,
}

/// Where the elevation came from.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Provenance {
    pub source: String,
    pub resolution_m: f64,
    pub crs: Crs,
}

#[derive(Debug)]
pub enum AcquisitionOutcome {
    Acquired {
        raster: ElevationRaster,
        provenance: Provenance,
        attempts: Vec<AttemptRecord>,
    },
    Exhausted {
        attempts: Vec<AttemptRecord>,
    },
}

impl AcquisitionOutcome {
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            AcquisitionOutcome::Acquired { attempts, .. } | AcquisitionOutcome::Exhausted { attempts } => attempts,
        }
    }

    pub fn is_acquired(&self) -> bool {
        matches!(self, AcquisitionOutcome::Acquired { .. })
    }
}

/// What to acquire.
#[derive(Clone, Debug)]
pub struct AcquisitionRequest {
    pub bbox: BoundingBox,
    /// ISO 3166-1 alpha-2 code selecting the national source
    pub country: Option<String>,
    /// Exact output size in pixels for chunked fetches
    pub target_size: Option<(usize, usize)>,
}

pub struct ElevationEngine<T, C> {
    transport: T,
    credentials: C,
    http: HttpConfig,
    executor: ChunkedExecutor,
    trace: Vec<AcquisitionState>,
    last_bytes: usize,
}

impl<T: Transport, C: CredentialSource> ElevationEngine<T, C> {
    pub fn new(transport: T, credentials: C, http: HttpConfig, executor: ChunkedExecutor) -> Self {
        Self {
            transport,
            credentials,
            http,
            executor,
            trace: Vec::new(),
            last_bytes: 0,
        }
    }

    /// States visited by the most recent `acquire` call.
    pub fn trace(&self) -> &[AcquisitionState] {
        &self.trace
    }

    fn enter(&mut self, state: AcquisitionState) {
        debug!("acquisition state -> {:?}", state);
        self.trace.push(state);
    }

    pub async fn acquire(&mut self, request: &AcquisitionRequest) -> AcquisitionOutcome {
        self.trace.clear();
        self.enter(AcquisitionState::NotStarted);
        let mut attempts = Vec::new();

        let country_source = request.country.as_deref().and_then(provider_for_country);
        match (&request.country, country_source) {
            (_, Some(provider)) => {
                self.enter(AcquisitionState::TryingCountrySource);
                match self.try_source(&provider, request).await {
                    Ok(raster) => return self.succeed(&provider, raster, attempts),
                    Err(err) => {
                        attempts.push(self.record_failure(&provider, err));
                        self.enter(AcquisitionState::TryNextFallback);
                    }
                }
            }
            (Some(code), None) => info!("No national elevation source for '{}', using global sources", code),
            (None, None) => {}
        }

        self.enter(AcquisitionState::GlobalFallback);
        for provider in global_sources(&request.bbox) {
            match self.try_source(&provider, request).await {
                Ok(raster) => return self.succeed(&provider, raster, attempts),
                Err(err) => {
                    attempts.push(self.record_failure(&provider, err));
                    self.enter(AcquisitionState::TryNextFallback);
                }
            }
        }

        self.enter(AcquisitionState::AllSourcesExhausted);
        error!("All {} elevation sources failed", attempts.len());
        AcquisitionOutcome::Exhausted { attempts }
    }

    fn succeed(
        &mut self,
        provider: &ProviderConfig,
        raster: ElevationRaster,
        attempts: Vec<AttemptRecord>,
    ) -> AcquisitionOutcome {
        self.enter(AcquisitionState::Success);
        info!(
            "Elevation from {}: {}x{} pixels, {} bytes",
            provider.label(),
            raster.width(),
            raster.height(),
            self.last_bytes
        );
        AcquisitionOutcome::Acquired {
            provenance: Provenance {
                source: provider.label(),
                resolution_m: provider.resolution_m,
                crs: provider.native_crs,
            },
            raster,
            attempts,
        }
    }

    fn record_failure(&self, provider: &ProviderConfig, err: AcquisitionError) -> AttemptRecord {
        warn!(
            "{} failed [{}] after {} bytes: {}",
            provider.label(),
            err.kind(),
            self.last_bytes,
            err
        );
        AttemptRecord {
            source: provider.label(),
            resolution_m: provider.resolution_m,
            kind: err.kind(),
            message: err.to_string(),
            bytes: self.last_bytes,
        }
    }

    /// Request extent in the provider's native CRS.
    fn native_extent(provider: &ProviderConfig, bbox: &BoundingBox) -> Result<Extent, AcquisitionError> {
        if provider.native_crs.is_geographic() {
            return Ok(Extent::new(bbox.west(), bbox.south(), bbox.east(), bbox.north()));
        }
        let (x0, y0, x1, y1) = Projector::new(provider.native_crs)
            .and_then(|p| p.project_bbox(bbox))
            .map_err(|e| AcquisitionError::Unavailable(e.to_string()))?;
        Ok(Extent::new(x0, y0, x1, y1))
    }

    async fn try_source(
        &mut self,
        provider: &ProviderConfig,
        request: &AcquisitionRequest,
    ) -> Result<ElevationRaster, AcquisitionError> {
        self.last_bytes = 0;
        info!("Trying {}", provider.label());

        let auth = provider.auth.resolve(&self.credentials)?;
        let extent = Self::native_extent(provider, &request.bbox)?;
        let (width_m, height_m) = request.bbox.estimate_dimensions_m();
        let width = request_pixels(width_m, provider.resolution_m, provider.max_request_size);
        let height = request_pixels(height_m, provider.resolution_m, provider.max_request_size);

        let raster = match plan_fetch(provider, extent, width, height) {
            FetchPlan::Single(tile) => {
                self.enter(AcquisitionState::SingleFetch);
                let bytes = self.fetch_with_retry(provider, &tile, &auth).await?;
                self.enter(AcquisitionState::Validating);
                geotiff::decode(&bytes, provider.native_crs)?.fill_nodata()
            }
            FetchPlan::Chunked { columns, rows, tiles } => {
                self.enter(AcquisitionState::ChunkedFetch);
                info!(
                    "{}: area exceeds {:?} m per request, fetching {}x{} tiles",
                    provider.name, provider.max_area_m, columns, rows
                );
                let merged = self.fetch_chunked(provider, &tiles, &auth).await?;
                self.enter(AcquisitionState::Validating);
                match request.target_size {
                    Some((w, h)) if (w, h) != (merged.width(), merged.height()) => merged
                        .resampled(&self.executor, w, h, Interpolation::Bilinear)
                        .map_err(|e| AcquisitionError::Validation(format!("resampling merged raster: {e}")))?,
                    _ => merged,
                }
            }
        };

        let near_zero = raster.near_zero_fraction();
        if near_zero > TRUNCATION_THRESHOLD {
            return Err(AcquisitionError::Truncation {
                near_zero_percent: near_zero * 100.0,
            });
        }
        Ok(raster)
    }

    async fn fetch_chunked(
        &mut self,
        provider: &ProviderConfig,
        tiles: &[TileRequest],
        auth: &ResolvedAuth,
    ) -> Result<ElevationRaster, AcquisitionError> {
        let mut store = TileStore::new(provider.native_crs)?;
        let mut total_bytes = 0;

        for (i, tile) in tiles.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.http.tile_delay()).await;
            }
            debug!("{}: tile {}/{} (row {}, col {})", provider.name, i + 1, tiles.len(), tile.row, tile.col);
            let bytes = self.fetch_with_retry(provider, tile, auth).await?;
            total_bytes += bytes.len();
            let raster = geotiff::decode(&bytes, provider.native_crs)?;
            store.save_tile(tile.row, tile.col, &raster)?;
        }

        self.last_bytes = total_bytes;
        store.merge()
    }

    async fn fetch_with_retry(
        &mut self,
        provider: &ProviderConfig,
        tile: &TileRequest,
        auth: &ResolvedAuth,
    ) -> Result<Vec<u8>, AcquisitionError> {
        let request = build_request(provider, tile, auth)?;
        let max_attempts = self.http.max_retries.max(1);
        let mut attempt = 0;

        loop {
            let result = match self.transport.get(&request).await {
                Ok(response) => {
                    self.last_bytes = response.body.len();
                    validate_response(response)
                }
                Err(err) => Err(err),
            };

            match result {
                Ok(bytes) => return Ok(bytes),
                Err(err) if attempt + 1 < max_attempts && err.is_retryable(&self.http.retryable_statuses) => {
                    let wait = self.http.backoff(attempt);
                    warn!(
                        "{}: {} (attempt {}/{}), retrying in {:?}: {}",
                        provider.name,
                        err,
                        attempt + 1,
                        max_attempts,
                        wait,
                        sanitize_url(&request.url)
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
