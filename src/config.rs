//! Pipeline configuration.
//!
//! Every section has defaults, so an empty JSON object (or no file at all)
//! is a valid configuration. Credentials never live here: providers name
//! environment variables that a `CredentialSource` resolves at dispatch.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::parallel::default_workers;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Worker threads for chunked raster filters
    pub workers: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Per-request timeout
    pub timeout_secs: u64,
    /// Attempts per request before giving up on a source
    pub max_retries: u32,
    /// First backoff wait; doubled after every failed attempt
    pub backoff_base_ms: u64,
    /// Pause between consecutive tile requests to the same service
    pub tile_delay_ms: u64,
    pub user_agent: String,
    /// HTTP statuses worth retrying against the same source
    pub retryable_statuses: Vec<u16>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            max_retries: 3,
            backoff_base_ms: 5_000,
            tile_delay_ms: 300,
            user_agent: format!("terrain_pipeline/{}", env!("CARGO_PKG_VERSION")),
            retryable_statuses: vec![429, 502, 503, 504],
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Wait before retry number `attempt + 1` (attempt counts from 0).
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_base_ms.saturating_mul(1u64 << attempt.min(16)))
    }

    pub fn tile_delay(&self) -> Duration {
        Duration::from_millis(self.tile_delay_ms)
    }
}

/// Terrain correction and smoothing applied while building the heightmap.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeightmapConfig {
    /// Road line half-width when rasterizing corridors
    pub road_buffer_px: usize,
    /// Extra dilation of the road corridor
    pub road_dilation_px: usize,
    /// Blur sigma of the flattened road surface and its blend mask
    pub road_sigma: f32,
    /// Width of the blend band around leveled water
    pub water_transition_px: usize,
    /// Percentile each water body is leveled to
    pub water_percentile: f32,
    /// Final smoothing sigma before fixed-point conversion
    pub final_sigma: f32,
}

impl Default for HeightmapConfig {
    fn default() -> Self {
        Self {
            road_buffer_px: 2,
            road_dilation_px: 3,
            road_sigma: 5.0,
            water_transition_px: 3,
            water_percentile: 10.0,
            final_sigma: 0.5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    /// Edge length of a spatial block in pixels
    pub block_size: usize,
    /// Surfaces the target engine blends within one block
    pub max_surfaces_per_block: usize,
    /// A mask occupies a block when any pixel exceeds this value
    pub coverage_threshold: u8,
    /// Slope where rock starts to appear (degrees)
    pub slope_start_deg: f32,
    /// Slope where rock is full (degrees)
    pub slope_full_deg: f32,
    /// Metres above the treeline until rock is full
    pub treeline_ramp_m: f32,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            block_size: 33,
            max_surfaces_per_block: 5,
            coverage_threshold: 10,
            slope_start_deg: 25.0,
            slope_full_deg: 40.0,
            treeline_ramp_m: 200.0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub executor: ExecutorConfig,
    pub http: HttpConfig,
    pub heightmap: HeightmapConfig,
    pub surfaces: SurfaceConfig,
}

impl PipelineConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor.workers == 0 {
            return Err(ConfigError::Invalid("executor.workers must be at least 1".into()));
        }
        if self.http.max_retries == 0 {
            return Err(ConfigError::Invalid("http.max_retries must be at least 1".into()));
        }
        if self.surfaces.block_size == 0 {
            return Err(ConfigError::Invalid("surfaces.block_size must be at least 1".into()));
        }
        if self.surfaces.max_surfaces_per_block == 0 {
            return Err(ConfigError::Invalid("surfaces.max_surfaces_per_block must be at least 1".into()));
        }
        if self.surfaces.slope_full_deg <= self.surfaces.slope_start_deg {
            return Err(ConfigError::Invalid(
                "surfaces.slope_full_deg must exceed surfaces.slope_start_deg".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.heightmap.water_percentile) {
            return Err(ConfigError::Invalid("heightmap.water_percentile must be within 0-100".into()));
        }
        Ok(())
    }
}

// ===== CREDENTIALS =====

/// Looks up secrets by name. Empty values count as missing.
pub trait CredentialSource {
    fn get(&self, name: &str) -> Option<String>;
}

/// Reads credentials from the process environment.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }
}

/// Fixed in-memory credentials.
#[derive(Clone, Debug, Default)]
pub struct StaticCredentials(HashMap<String, String>);

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.0.insert(name.to_string(), value.to_string());
        self
    }
}

impl CredentialSource for StaticCredentials {
    fn get(&self, name: &str) -> Option<String> {
        self.0.get(name).filter(|v| !v.is_empty()).cloned()
    }
}
