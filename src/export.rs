//! Writers for job outputs: heightmap images and ASCII grid, surface masks,
//! previews, local-frame features and the metadata document.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::{GrayImage, ImageBuffer, Luma, RgbImage};
use log::info;
use serde::Serialize;

use crate::elevation::{AttemptRecord, Provenance};
use crate::error::ExportError;
use crate::features::FeatureLayers;
use crate::geo::BoundingBox;
use crate::grid::Grid;
use crate::heightmap::Heightmap;
use crate::surfaces::{CoverageStats, SurfaceClassification, SurfaceKind, SurfaceMaskSet};
use crate::transform::{LocalPoint, Verification};

pub const HEIGHTMAP_PNG: &str = "heightmap.png";
pub const HEIGHTMAP_PREVIEW_PNG: &str = "heightmap_preview.png";
pub const HEIGHTMAP_ASC: &str = "heightmap.asc";
pub const SURFACE_PREVIEW_PNG: &str = "surface_preview.png";
pub const FEATURES_LOCAL_JSON: &str = "features_local.json";
pub const ROAD_POINTS_JSON: &str = "road_points.json";
pub const METADATA_JSON: &str = "metadata.json";

const ASC_NODATA: i32 = -9999;

fn encoding_error(what: &str) -> ExportError {
    ExportError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("{} buffer does not match its dimensions", what),
    ))
}

pub fn surface_mask_filename(kind: SurfaceKind) -> String {
    format!("surface_{}.png", kind.name())
}

// =============================================================================
// HEIGHTMAP
// =============================================================================

/// 16-bit grayscale PNG of the raw heightmap.
pub fn export_heightmap_png(heightmap: &Heightmap, path: &Path) -> Result<(), ExportError> {
    let raw = heightmap.raw();
    let img: ImageBuffer<Luma<u16>, Vec<u16>> =
        ImageBuffer::from_raw(raw.width as u32, raw.height as u32, raw.as_slice().to_vec())
            .ok_or_else(|| encoding_error("heightmap"))?;
    img.save(path)?;
    info!("Saved heightmap PNG: {} ({}x{})", path.display(), raw.width, raw.height);
    Ok(())
}

/// 8-bit preview of the heightmap.
pub fn export_heightmap_preview(heightmap: &Heightmap, path: &Path) -> Result<(), ExportError> {
    export_gray(&heightmap.preview(), path)
}

/// ESRI ASCII grid of real elevations, row 0 first.
pub fn export_heightmap_asc(heightmap: &Heightmap, cell_size_m: f64, path: &Path) -> Result<(), ExportError> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "ncols         {}", heightmap.width())?;
    writeln!(out, "nrows         {}", heightmap.height())?;
    writeln!(out, "xllcorner     {:?}", 0.0f64)?;
    writeln!(out, "yllcorner     {:?}", 0.0f64)?;
    writeln!(out, "cellsize      {:?}", cell_size_m)?;
    writeln!(out, "NODATA_value  {}", ASC_NODATA)?;

    let raw = heightmap.raw();
    let mut line = String::new();
    for y in 0..raw.height {
        line.clear();
        for (i, &value) in raw.row(y).iter().enumerate() {
            if i > 0 {
                line.push(' ');
            }
            line.push_str(&format!("{:.3}", heightmap.heightmap_to_real(value)));
        }
        writeln!(out, "{}", line)?;
    }
    out.flush()?;
    info!("Saved heightmap ASC: {} ({}x{})", path.display(), raw.width, raw.height);
    Ok(())
}

// =============================================================================
// SURFACES
// =============================================================================

fn export_gray(grid: &Grid<u8>, path: &Path) -> Result<(), ExportError> {
    let img = GrayImage::from_raw(grid.width as u32, grid.height as u32, grid.as_slice().to_vec())
        .ok_or_else(|| encoding_error("mask"))?;
    img.save(path)?;
    Ok(())
}

/// One 8-bit PNG per surface. Returns the file names in surface order.
pub fn export_surface_masks(masks: &SurfaceMaskSet, dir: &Path) -> Result<Vec<String>, ExportError> {
    let mut names = Vec::new();
    for (kind, mask) in masks.iter() {
        let name = surface_mask_filename(kind);
        export_gray(mask, &dir.join(&name))?;
        names.push(name);
    }
    info!("Saved {} surface masks", names.len());
    Ok(names)
}

pub fn export_surface_preview(surfaces: &SurfaceClassification, path: &Path) -> Result<(), ExportError> {
    let preview = surfaces.preview_rgb();
    let bytes: Vec<u8> = preview.as_slice().iter().flat_map(|p| p.iter().copied()).collect();
    let img = RgbImage::from_raw(preview.width as u32, preview.height as u32, bytes)
        .ok_or_else(|| encoding_error("preview"))?;
    img.save(path)?;
    info!("Saved surface preview: {}", path.display());
    Ok(())
}

// =============================================================================
// METADATA
// =============================================================================

pub fn write_json<T: Serialize + ?Sized>(value: &T, path: &Path) -> Result<(), ExportError> {
    let mut out = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut out, value)?;
    out.flush()?;
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct InputSection<'a> {
    pub bbox: &'a BoundingBox,
    pub country: Option<&'a str>,
    pub requested_size: Option<(usize, usize)>,
    pub resolution_m: f64,
}

#[derive(Debug, Serialize)]
pub struct ElevationSection<'a> {
    pub source: &'a str,
    pub resolution_m: f64,
    pub crs: String,
    pub min_elevation_m: f32,
    pub max_elevation_m: f32,
    pub height_scale: f32,
    pub height_offset: f32,
    pub attempts: &'a [AttemptRecord],
}

#[derive(Debug, Serialize)]
pub struct HeightmapSection {
    pub dimensions: String,
    pub terrain_size_m: [f64; 2],
    pub grid_cell_size_m: f64,
    pub format: &'static str,
}

#[derive(Debug, Serialize)]
pub struct BlockSaturationSection {
    pub violations: usize,
    pub total_blocks: usize,
    pub violations_before_repair: usize,
    pub repairs: usize,
}

#[derive(Debug, Serialize)]
pub struct SurfaceSection<'a> {
    pub count: usize,
    pub surfaces: Vec<&'static str>,
    pub format: &'static str,
    pub treeline_m: f32,
    pub materials: BTreeMap<&'static str, String>,
    pub coverage: &'a CoverageStats,
    pub block_saturation: BlockSaturationSection,
}

#[derive(Debug, Serialize)]
pub struct RecommendedSettings {
    pub terrain_size: [f64; 2],
    pub grid_cell_size: f64,
    pub height_scale: f32,
    pub height_offset: f32,
    pub invert_x_axis: bool,
    pub invert_z_axis: bool,
}

#[derive(Debug, Serialize)]
pub struct ImportSection {
    pub heightmap_file: &'static str,
    pub heightmap_png: &'static str,
    pub surface_masks: Vec<String>,
    pub feature_data: Option<&'static str>,
    pub recommended_settings: RecommendedSettings,
}

#[derive(Debug, Serialize)]
pub struct Metadata<'a> {
    pub generator: &'static str,
    pub version: &'static str,
    pub generated_at: String,
    pub input: InputSection<'a>,
    pub elevation: ElevationSection<'a>,
    pub heightmap: HeightmapSection,
    pub surface_masks: SurfaceSection<'a>,
    pub import: ImportSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinate_transform: Option<&'a Verification>,
}

/// Everything one finished job writes to its output directory.
#[derive(Debug)]
pub struct JobExport<'a> {
    pub bbox: &'a BoundingBox,
    pub country: Option<&'a str>,
    pub requested_size: Option<(usize, usize)>,
    pub resolution_m: f64,
    pub provenance: &'a Provenance,
    pub attempts: &'a [AttemptRecord],
    pub heightmap: &'a Heightmap,
    pub cell_size_m: f64,
    pub surfaces: &'a SurfaceClassification,
    /// Feature layers converted to the local frame
    pub local_features: Option<&'a FeatureLayers>,
    pub road_points: &'a [LocalPoint],
    pub verification: Option<&'a Verification>,
}

impl<'a> JobExport<'a> {
    pub fn metadata(&self, surface_files: Vec<String>) -> Metadata<'a> {
        let stats = self.heightmap.stats();
        let terrain_size = [
            (self.heightmap.width().saturating_sub(1)) as f64 * self.cell_size_m,
            (self.heightmap.height().saturating_sub(1)) as f64 * self.cell_size_m,
        ];
        let surfaces = self.surfaces;
        let provenance = self.provenance;

        Metadata {
            generator: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            generated_at: chrono::Utc::now().to_rfc3339(),
            input: InputSection {
                bbox: self.bbox,
                country: self.country,
                requested_size: self.requested_size,
                resolution_m: self.resolution_m,
            },
            elevation: ElevationSection {
                source: &provenance.source,
                resolution_m: provenance.resolution_m,
                crs: provenance.crs.to_string(),
                min_elevation_m: stats.min_elevation,
                max_elevation_m: stats.max_elevation,
                height_scale: stats.height_scale,
                height_offset: stats.height_offset,
                attempts: self.attempts,
            },
            heightmap: HeightmapSection {
                dimensions: format!("{}x{}", stats.width, stats.height),
                terrain_size_m: terrain_size,
                grid_cell_size_m: self.cell_size_m,
                format: "16-bit PNG + ESRI ASCII Grid",
            },
            surface_masks: SurfaceSection {
                count: surface_files.len(),
                surfaces: SurfaceKind::ALL.iter().map(|k| k.name()).collect(),
                format: "8-bit grayscale PNG",
                treeline_m: surfaces.treeline_m,
                materials: SurfaceKind::ALL.iter().map(|k| (k.name(), k.material_path())).collect(),
                coverage: &surfaces.coverage,
                block_saturation: BlockSaturationSection {
                    violations: surfaces.blocks.violations,
                    total_blocks: surfaces.blocks.total_blocks,
                    violations_before_repair: surfaces.blocks_before_repair.violations,
                    repairs: surfaces.repairs,
                },
            },
            import: ImportSection {
                heightmap_file: HEIGHTMAP_ASC,
                heightmap_png: HEIGHTMAP_PNG,
                surface_masks: surface_files,
                feature_data: self.local_features.map(|_| FEATURES_LOCAL_JSON),
                recommended_settings: RecommendedSettings {
                    terrain_size,
                    grid_cell_size: self.cell_size_m,
                    height_scale: stats.height_scale,
                    height_offset: stats.height_offset,
                    invert_x_axis: false,
                    invert_z_axis: true,
                },
            },
            coordinate_transform: self.verification,
        }
    }

    /// Write every artefact into `dir`, creating it if needed. Returns the
    /// paths written.
    pub fn write_all(&self, dir: &Path) -> Result<Vec<PathBuf>, ExportError> {
        fs::create_dir_all(dir)?;
        let mut written = Vec::new();

        export_heightmap_png(self.heightmap, &dir.join(HEIGHTMAP_PNG))?;
        export_heightmap_preview(self.heightmap, &dir.join(HEIGHTMAP_PREVIEW_PNG))?;
        export_heightmap_asc(self.heightmap, self.cell_size_m, &dir.join(HEIGHTMAP_ASC))?;
        written.extend([HEIGHTMAP_PNG, HEIGHTMAP_PREVIEW_PNG, HEIGHTMAP_ASC].map(|n| dir.join(n)));

        let surface_files = export_surface_masks(&self.surfaces.masks, dir)?;
        written.extend(surface_files.iter().map(|n| dir.join(n)));
        export_surface_preview(self.surfaces, &dir.join(SURFACE_PREVIEW_PNG))?;
        written.push(dir.join(SURFACE_PREVIEW_PNG));

        if let Some(features) = self.local_features {
            write_json(features, &dir.join(FEATURES_LOCAL_JSON))?;
            written.push(dir.join(FEATURES_LOCAL_JSON));
        }
        if !self.road_points.is_empty() {
            write_json(self.road_points, &dir.join(ROAD_POINTS_JSON))?;
            written.push(dir.join(ROAD_POINTS_JSON));
        }

        write_json(&self.metadata(surface_files), &dir.join(METADATA_JSON))?;
        written.push(dir.join(METADATA_JSON));

        info!("Wrote {} files to {}", written.len(), dir.display());
        Ok(written)
    }
}
