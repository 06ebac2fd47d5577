//! Job orchestration.
//!
//! One job runs the stages in order:
//! 1. Elevation: a local GeoTIFF, or the acquisition engine's source chain
//! 2. Heightmap synthesis with road flattening and water leveling
//! 3. Surface classification on the heightmap's pixel grid
//! 4. Features and road vertices converted to the local terrain frame
//! 5. Export of every artefact plus metadata
//!
//! Only exhaustion of every elevation source fails the job outright;
//! per-source failures are recorded and reported in the metadata.

use std::path::PathBuf;

use log::{info, warn};

use crate::config::{CredentialSource, PipelineConfig};
use crate::elevation::geotiff::{read_geotiff, write_geotiff};
use crate::elevation::{
    provider_for_country, AcquisitionOutcome, AcquisitionRequest, AttemptRecord, ElevationEngine, Provenance,
    Transport,
};
use crate::error::PipelineError;
use crate::export::JobExport;
use crate::features::{FeatureCollection, FeatureLayers, Geometry};
use crate::geo::{BoundingBox, Crs};
use crate::heightmap::{snap_size, HeightmapStats, HeightmapSynthesizer, SynthesisJob};
use crate::parallel::ChunkedExecutor;
use crate::raster::ElevationRaster;
use crate::surfaces::{SurfaceClassifier, SurfaceInputs, SurfaceKind};
use crate::transform::CoordinateTransform;

/// What to build and where to put it.
#[derive(Clone, Debug)]
pub struct JobSpec {
    pub bbox: BoundingBox,
    /// ISO 3166-1 alpha-2 code
    pub country: Option<String>,
    /// Requested heightmap size; each axis snaps to a valid vertex count
    pub size: Option<(usize, usize)>,
    /// Ground size of one heightmap cell in metres
    pub resolution_m: f64,
    /// Use this GeoTIFF instead of downloading elevation
    pub dem: Option<PathBuf>,
    /// Also write the acquired raster as a GeoTIFF
    pub save_dem: Option<PathBuf>,
    pub output_dir: PathBuf,
}

impl JobSpec {
    fn validate(&self) -> Result<(), PipelineError> {
        if !(self.resolution_m.is_finite() && self.resolution_m > 0.0) {
            return Err(PipelineError::InvalidInput(format!(
                "resolution must be positive, got {}",
                self.resolution_m
            )));
        }
        if let Some((w, h)) = self.size {
            if w < 2 || h < 2 {
                return Err(PipelineError::InvalidInput(format!("size {}x{} is too small", w, h)));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct JobReport {
    pub files: Vec<PathBuf>,
    pub provenance: Provenance,
    pub attempts: Vec<AttemptRecord>,
    pub heightmap: HeightmapStats,
    pub recommended_default: SurfaceKind,
    pub block_violations: usize,
}

pub struct Pipeline<T, C> {
    config: PipelineConfig,
    executor: ChunkedExecutor,
    engine: ElevationEngine<T, C>,
}

impl<T: Transport, C: CredentialSource> Pipeline<T, C> {
    pub fn new(config: PipelineConfig, transport: T, credentials: C) -> Result<Self, PipelineError> {
        config.validate()?;
        let executor = ChunkedExecutor::new(config.executor.workers)?;
        let engine = ElevationEngine::new(transport, credentials, config.http.clone(), executor.clone());
        Ok(Self {
            config,
            executor,
            engine,
        })
    }

    async fn elevation(
        &mut self,
        job: &JobSpec,
    ) -> Result<(ElevationRaster, Provenance, Vec<AttemptRecord>), PipelineError> {
        if let Some(path) = &job.dem {
            let default_crs = job
                .country
                .as_deref()
                .and_then(provider_for_country)
                .map_or(Crs::WGS84, |p| p.native_crs);
            let raster = read_geotiff(path, default_crs)?.fill_nodata();
            info!(
                "Loaded local DEM {} ({}x{}, {})",
                path.display(),
                raster.width(),
                raster.height(),
                raster.crs()
            );
            let provenance = Provenance {
                source: format!("local:{}", path.display()),
                resolution_m: raster.resolution(),
                crs: raster.crs(),
            };
            return Ok((raster, provenance, Vec::new()));
        }

        let request = AcquisitionRequest {
            bbox: job.bbox,
            country: job.country.clone(),
            target_size: job.size.map(|(w, h)| (snap_size(w), snap_size(h))),
        };
        match self.engine.acquire(&request).await {
            AcquisitionOutcome::Acquired {
                raster,
                provenance,
                attempts,
            } => Ok((raster, provenance, attempts)),
            AcquisitionOutcome::Exhausted { attempts } => {
                for attempt in &attempts {
                    warn!(
                        "{} at {} m: {} ({})",
                        attempt.source, attempt.resolution_m, attempt.kind, attempt.message
                    );
                }
                Err(PipelineError::NoElevationData {
                    attempts: attempts.len(),
                })
            }
        }
    }

    pub async fn run(&mut self, job: &JobSpec, layers: &FeatureLayers) -> Result<JobReport, PipelineError> {
        job.validate()?;
        info!(
            "Job {} ({}), {} features",
            job.bbox,
            job.country.as_deref().unwrap_or("no country"),
            layers.total()
        );

        let (raster, provenance, attempts) = self.elevation(job).await?;
        info!("Elevation from {} at {} m", provenance.source, provenance.resolution_m);
        if let Some(path) = &job.save_dem {
            write_geotiff(&raster, path)?;
            info!("Saved DEM to {}", path.display());
        }

        let synthesizer = HeightmapSynthesizer::new(self.config.heightmap.clone(), self.executor.clone());
        let terrain = synthesizer.synthesize(
            &raster,
            &SynthesisJob {
                bbox: &job.bbox,
                target_size: job.size,
                resolution_m: job.resolution_m,
                roads: &layers.roads,
                water: &layers.water,
            },
        )?;
        drop(raster);

        let classifier = SurfaceClassifier::new(self.config.surfaces.clone(), self.executor.clone());
        let surfaces = classifier.classify(&SurfaceInputs {
            elevation: &terrain.elevation,
            layers,
            bbox: &job.bbox,
            cell_size_m: terrain.cell_size_m,
            country: job.country.as_deref(),
        })?;

        let (width, height) = (terrain.heightmap.width(), terrain.heightmap.height());
        let terrain_size = (
            width.saturating_sub(1).max(1) as f64 * terrain.cell_size_m,
            height.saturating_sub(1).max(1) as f64 * terrain.cell_size_m,
        );
        let transform = CoordinateTransform::new(job.bbox, provenance.crs, Some(terrain_size))?;
        let local_features = FeatureLayers {
            roads: transform.transform_collection(&layers.roads)?,
            water: transform.transform_collection(&layers.water)?,
            forests: transform.transform_collection(&layers.forests)?,
            buildings: transform.transform_collection(&layers.buildings)?,
            land_use: transform.transform_collection(&layers.land_use)?,
        };
        let road_points = transform.sample_points(&line_vertices(&layers.roads), Some(&terrain.elevation))?;
        let verification = transform.verification()?;

        let export = JobExport {
            bbox: &job.bbox,
            country: job.country.as_deref(),
            requested_size: job.size,
            resolution_m: job.resolution_m,
            provenance: &provenance,
            attempts: &attempts,
            heightmap: &terrain.heightmap,
            cell_size_m: terrain.cell_size_m,
            surfaces: &surfaces,
            local_features: Some(&local_features),
            road_points: &road_points,
            verification: Some(&verification),
        };
        let files = export.write_all(&job.output_dir)?;

        Ok(JobReport {
            files,
            provenance,
            attempts,
            heightmap: terrain.heightmap.stats().clone(),
            recommended_default: surfaces.coverage.recommended_default,
            block_violations: surfaces.blocks.violations,
        })
    }
}

/// Every vertex of the line geometries in `collection`, as `(lon, lat)`.
fn line_vertices(collection: &FeatureCollection) -> Vec<(f64, f64)> {
    fn push_line(line: &[Vec<f64>], out: &mut Vec<(f64, f64)>) {
        out.extend(line.iter().filter(|p| p.len() >= 2).map(|p| (p[0], p[1])));
    }

    fn visit(geometry: &Geometry, out: &mut Vec<(f64, f64)>) {
        match geometry {
            Geometry::LineString { coordinates } => push_line(coordinates, out),
            Geometry::MultiLineString { coordinates } => coordinates.iter().for_each(|l| push_line(l, out)),
            Geometry::GeometryCollection { geometries } => geometries.iter().for_each(|g| visit(g, out)),
            _ => {}
        }
    }

    let mut out = Vec::new();
    for feature in &collection.features {
        if let Some(geometry) = &feature.geometry {
            visit(geometry, &mut out);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticCredentials;
    use crate::elevation::{HttpRequest, HttpResponse};
    use crate::error::AcquisitionError;
    use crate::export::METADATA_JSON;
    use crate::features::Feature;
    use crate::grid::Grid;

    /// Fails every request; jobs in these tests must not need the network.
    struct Offline;

    impl Transport for Offline {
        async fn get(&self, _request: &HttpRequest) -> Result<HttpResponse, AcquisitionError> {
            Err(AcquisitionError::Transport {
                status: None,
                message: "offline".into(),
            })
        }
    }

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.executor.workers = 2;
        config
    }

    fn layers() -> FeatureLayers {
        FeatureLayers {
            roads: FeatureCollection::new(vec![Feature::new(Geometry::LineString {
                coordinates: vec![vec![10.70, 59.905], vec![10.75, 59.925], vec![10.80, 59.93]],
            })
            .with_property("highway", "primary")]),
            water: FeatureCollection::new(vec![Feature::new(Geometry::Polygon {
                coordinates: vec![vec![
                    vec![10.72, 59.935],
                    vec![10.74, 59.935],
                    vec![10.74, 59.945],
                    vec![10.72, 59.945],
                    vec![10.72, 59.935],
                ]],
            })
            .with_property("natural", "water")
            .with_property("water_type", "lake")]),
            ..FeatureLayers::default()
        }
    }

    #[tokio::test]
    async fn test_job_from_local_dem() {
        let dir = tempfile::tempdir().unwrap();
        let dem_path = dir.path().join("dem.tif");
        let data = (0..200 * 200)
            .map(|i| 50.0 + (i % 200) as f32 * 0.5 + (i / 200) as f32 * 0.25)
            .collect();
        let dem = ElevationRaster::from_bounds(
            Grid::from_vec(200, 200, data).unwrap(),
            Crs(25833),
            (260_000.0, 6_640_000.0, 266_000.0, 6_646_000.0),
            None,
        )
        .unwrap();
        write_geotiff(&dem, &dem_path).unwrap();

        let job = JobSpec {
            bbox: BoundingBox::new(10.70, 59.90, 10.80, 59.95).unwrap(),
            country: Some("NO".into()),
            size: Some((120, 140)),
            resolution_m: 20.0,
            dem: Some(dem_path),
            save_dem: Some(dir.path().join("saved.tif")),
            output_dir: dir.path().join("out"),
        };
        let mut pipeline = Pipeline::new(config(), Offline, StaticCredentials::new()).unwrap();
        let report = pipeline.run(&job, &layers()).await.unwrap();

        assert!(report.attempts.is_empty());
        assert!(report.provenance.source.starts_with("local:"));
        assert_eq!(report.provenance.crs, Crs(25833));
        assert_eq!((report.heightmap.width, report.heightmap.height), (129, 129));
        assert_eq!(report.block_violations, 0);
        assert!(dir.path().join("saved.tif").exists());
        assert!(report.files.iter().all(|p| p.exists()));

        let out = &job.output_dir;
        for name in ["heightmap.png", "heightmap.asc", "surface_grass.png", "road_points.json"] {
            assert!(out.join(name).exists(), "{name} missing");
        }
        let meta: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out.join(METADATA_JSON)).unwrap()).unwrap();
        assert_eq!(meta["heightmap"]["dimensions"], "129x129");
        assert_eq!(meta["coordinate_transform"]["method"], "proj");
        assert_eq!(meta["coordinate_transform"]["terrain_size_m"][0], 2560.0);
    }

    #[tokio::test]
    async fn test_exhaustion_fails_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let job = JobSpec {
            bbox: BoundingBox::new(15.0, 59.0, 15.05, 59.05).unwrap(),
            country: Some("SE".into()),
            size: Some((257, 257)),
            resolution_m: 2.0,
            dem: None,
            save_dem: None,
            output_dir: dir.path().join("out"),
        };
        let mut pipeline = Pipeline::new(config(), Offline, StaticCredentials::new()).unwrap();
        let err = pipeline.run(&job, &FeatureLayers::default()).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoElevationData { attempts: 3 }));
        assert!(!job.output_dir.exists());
    }

    #[tokio::test]
    async fn test_rejects_bad_resolution() {
        let job = JobSpec {
            bbox: BoundingBox::new(15.0, 59.0, 15.05, 59.05).unwrap(),
            country: None,
            size: None,
            resolution_m: 0.0,
            dem: None,
            save_dem: None,
            output_dir: PathBuf::from("unused"),
        };
        let mut pipeline = Pipeline::new(config(), Offline, StaticCredentials::new()).unwrap();
        let err = pipeline.run(&job, &FeatureLayers::default()).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[test]
    fn test_line_vertices() {
        let roads = layers().roads;
        let points = line_vertices(&roads);
        assert_eq!(points.len(), 3);
        assert_eq!(points[1], (10.75, 59.925));
        assert!(line_vertices(&layers().water).is_empty());
    }
}
