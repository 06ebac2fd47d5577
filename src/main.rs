use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use terrain_pipeline::config::EnvCredentials;
use terrain_pipeline::elevation::ReqwestTransport;
use terrain_pipeline::features::FeatureLayers;
use terrain_pipeline::geo::BoundingBox;
use terrain_pipeline::{JobSpec, Pipeline, PipelineConfig, PipelineError};

#[derive(Parser, Debug)]
#[command(name = "terrain_pipeline")]
#[command(about = "Build engine-ready heightmaps and surface masks for a bounding box")]
struct Args {
    /// Bounding box as west,south,east,north in WGS84 degrees
    #[arg(long, allow_hyphen_values = true)]
    bbox: BoundingBox,

    /// ISO country code selecting the national elevation source (e.g. NO)
    #[arg(long)]
    country: Option<String>,

    /// Heightmap size: one number for a square map, or WIDTHxHEIGHT
    #[arg(long, value_parser = parse_size)]
    size: Option<(usize, usize)>,

    /// Ground resolution of one heightmap cell in metres
    #[arg(long, default_value = "2.0")]
    resolution: f64,

    /// JSON file with roads, water, forests, buildings and land_use collections
    #[arg(long)]
    features: Option<PathBuf>,

    /// Use a local GeoTIFF instead of downloading elevation
    #[arg(long)]
    dem: Option<PathBuf>,

    /// Pipeline configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output directory
    #[arg(short, long, default_value = "output")]
    output: PathBuf,

    /// Also write the acquired elevation raster as a GeoTIFF
    #[arg(long)]
    save_dem: Option<PathBuf>,
}

fn parse_size(value: &str) -> Result<(usize, usize), String> {
    let parse = |s: &str| s.trim().parse::<usize>().map_err(|e| format!("invalid size '{}': {}", s, e));
    match value.split_once(['x', 'X']) {
        Some((w, h)) => Ok((parse(w)?, parse(h)?)),
        None => {
            let n = parse(value)?;
            Ok((n, n))
        }
    }
}

async fn run(args: Args) -> Result<(), PipelineError> {
    let config = match &args.config {
        Some(path) => PipelineConfig::from_path(path)?,
        None => PipelineConfig::default(),
    };
    let layers = match &args.features {
        Some(path) => FeatureLayers::from_path(path)?,
        None => FeatureLayers::default(),
    };

    let transport = ReqwestTransport::new(&config.http)?;
    let mut pipeline = Pipeline::new(config, transport, EnvCredentials)?;
    let job = JobSpec {
        bbox: args.bbox,
        country: args.country.map(|c| c.to_ascii_uppercase()),
        size: args.size,
        resolution_m: args.resolution,
        dem: args.dem,
        save_dem: args.save_dem,
        output_dir: args.output,
    };

    let report = pipeline.run(&job, &layers).await?;
    info!(
        "Done: {}x{} heightmap from {}, elevation {:.1} - {:.1} m",
        report.heightmap.width,
        report.heightmap.height,
        report.provenance.source,
        report.heightmap.min_elevation,
        report.heightmap.max_elevation
    );
    info!(
        "Recommended default surface: {}, {} blocks over budget",
        report.recommended_default.name(),
        report.block_violations
    );
    info!("{} files written to {}", report.files.len(), job.output_dir.display());
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("2049"), Ok((2049, 2049)));
        assert_eq!(parse_size("1025x513"), Ok((1025, 513)));
        assert!(parse_size("big").is_err());
    }

    #[test]
    fn test_cli_arguments() {
        let args = Args::try_parse_from([
            "terrain_pipeline",
            "--bbox",
            "10.7,59.9,10.8,59.95",
            "--country",
            "no",
            "--size",
            "1025",
            "--output",
            "out",
        ])
        .unwrap();
        assert_eq!(args.bbox.west(), 10.7);
        assert_eq!(args.size, Some((1025, 1025)));
        assert_eq!(args.resolution, 2.0);
        assert!(args.dem.is_none());
    }
}
