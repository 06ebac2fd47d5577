//! Terrain pipeline library
//!
//! Turns a geographic bounding box into game-engine terrain: a 16-bit
//! heightmap, per-surface material masks and local-frame vector data.

pub mod config;
pub mod elevation;
pub mod error;
pub mod export;
pub mod features;
pub mod filters;
pub mod geo;
pub mod grid;
pub mod heightmap;
pub mod parallel;
pub mod pipeline;
pub mod raster;
pub mod rasterize;
pub mod surfaces;
pub mod transform;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use pipeline::{JobReport, JobSpec, Pipeline};
