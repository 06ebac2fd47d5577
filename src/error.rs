//! Error types for the terrain pipeline.
//!
//! Each stage has its own error enum; `PipelineError` wraps them for the
//! orchestration layer and the binary. Elevation exhaustion is not an error
//! here: the engine reports it through `AcquisitionOutcome::Exhausted`.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Failures of the parallel chunked executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("chunk {index} produced {got} rows, expected {expected}")]
    ChunkShape {
        index: usize,
        got: usize,
        expected: usize,
    },

    #[error("chunk {index} failed: {message}")]
    Chunk { index: usize, message: String },

    #[error("chunk results could not be reassembled: widths differ")]
    Reassembly,
}

/// Failures of bounding box validation and coordinate projection.
#[derive(Debug, Error)]
pub enum GeoError {
    #[error("invalid bounding box: west={west} south={south} east={east} north={north}")]
    InvalidBoundingBox {
        west: f64,
        south: f64,
        east: f64,
        north: f64,
    },

    #[error("unsupported CRS EPSG:{0}")]
    UnsupportedCrs(u32),

    #[error("malformed CRS identifier '{0}'")]
    MalformedCrs(String),

    #[error("projection failed: {0}")]
    Projection(String),

    #[error("invalid target size {width}x{height} m")]
    InvalidTargetSize { width: f64, height: f64 },
}

/// Failures decoding, encoding or reshaping elevation rasters.
#[derive(Debug, Error)]
pub enum RasterError {
    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("unsupported sample format: {0}")]
    UnsupportedSampleFormat(String),

    #[error("raster is missing georeferencing tags")]
    MissingGeoreference,

    #[error("raster buffer has {got} samples, expected {expected}")]
    SampleCount { got: usize, expected: usize },

    #[error("raster has no pixels")]
    Empty,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a failed acquisition attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network, timeout or retryable HTTP status.
    Transport,
    /// Malformed payload, wrong format or a service error body.
    Validation,
    /// Structurally valid payload that is mostly near-zero.
    Truncation,
    /// Source skipped because it cannot be used (missing credential, out of coverage).
    Unavailable,
    /// Local tile storage failed while merging.
    Storage,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Transport => "transport",
            FailureKind::Validation => "validation",
            FailureKind::Truncation => "truncation",
            FailureKind::Unavailable => "unavailable",
            FailureKind::Storage => "storage",
        };
        f.write_str(name)
    }
}

/// A single failed step while acquiring elevation from one source.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("transport failure{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Transport { status: Option<u16>, message: String },

    #[error("invalid response: {0}")]
    Validation(String),

    #[error("truncated response: {near_zero_percent:.1}% of pixels near zero")]
    Truncation { near_zero_percent: f32 },

    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("could not decode raster: {0}")]
    Raster(#[from] RasterError),

    #[error("tile storage: {0}")]
    Storage(#[from] std::io::Error),
}

impl AcquisitionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            AcquisitionError::Transport { .. } => FailureKind::Transport,
            AcquisitionError::Validation(_) | AcquisitionError::Raster(_) => FailureKind::Validation,
            AcquisitionError::Truncation { .. } => FailureKind::Truncation,
            AcquisitionError::Unavailable(_) => FailureKind::Unavailable,
            AcquisitionError::Storage(_) => FailureKind::Storage,
        }
    }

    /// Only transport failures with a retryable status are retried against
    /// the same source. Everything else escalates to the next source.
    pub fn is_retryable(&self, retryable_statuses: &[u16]) -> bool {
        match self {
            AcquisitionError::Transport { status: Some(code), .. } => retryable_statuses.contains(code),
            AcquisitionError::Transport { status: None, .. } => true,
            _ => false,
        }
    }
}

/// Failures writing output artefacts.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Raster(#[from] RasterError),
}

/// Failures loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Umbrella error for a whole job.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Geo(#[from] GeoError),

    #[error(transparent)]
    Raster(#[from] RasterError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error("cannot read features {path}: {source}")]
    Features {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no elevation data: all {attempts} sources failed")]
    NoElevationData { attempts: usize },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kinds() {
        let t = AcquisitionError::Transport { status: Some(503), message: "busy".into() };
        assert_eq!(t.kind(), FailureKind::Transport);
        assert!(t.is_retryable(&[429, 502, 503, 504]));
        assert!(!t.is_retryable(&[429]));

        let v = AcquisitionError::Validation("not a tiff".into());
        assert_eq!(v.kind(), FailureKind::Validation);
        assert!(!v.is_retryable(&[503]));

        let tr = AcquisitionError::Truncation { near_zero_percent: 80.0 };
        assert_eq!(tr.kind(), FailureKind::Truncation);
        assert_eq!(tr.to_string(), "truncated response: 80.0% of pixels near zero");
    }

    #[test]
    fn test_transport_display_includes_status() {
        let err = AcquisitionError::Transport { status: Some(429), message: "slow down".into() };
        assert_eq!(err.to_string(), "transport failure (HTTP 429): slow down");
        let err = AcquisitionError::Transport { status: None, message: "timeout".into() };
        assert_eq!(err.to_string(), "transport failure: timeout");
    }
}
