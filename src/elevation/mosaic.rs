//! Disk-backed storage for chunked downloads and the merge into one raster.
//!
//! Tiles are spilled to a temporary directory as raw native-endian f32
//! samples as soon as they arrive, so a large chunked fetch never holds
//! more than one tile plus the output in memory. The directory is removed
//! when the store is dropped, including on failure paths.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;

use log::debug;
use tempfile::TempDir;

use crate::error::AcquisitionError;
use crate::geo::Crs;
use crate::grid::Grid;
use crate::raster::ElevationRaster;

#[derive(Clone, Debug)]
struct StoredTile {
    row: usize,
    col: usize,
    width: usize,
    height: usize,
    origin: (f64, f64),
    pixel_size: (f64, f64),
    nodata: Option<f32>,
}

impl StoredTile {
    fn bounds(&self) -> (f64, f64, f64, f64) {
        let (x0, y1) = self.origin;
        (
            x0,
            y1 - self.pixel_size.1 * self.height as f64,
            x0 + self.pixel_size.0 * self.width as f64,
            y1,
        )
    }
}

pub struct TileStore {
    dir: TempDir,
    crs: Crs,
    tiles: Vec<StoredTile>,
}

impl TileStore {
    pub fn new(crs: Crs) -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("dem_tiles_").tempdir()?;
        debug!("Tile store at {}", dir.path().display());
        Ok(Self {
            dir,
            crs,
            tiles: Vec::new(),
        })
    }

    fn tile_path(&self, row: usize, col: usize) -> PathBuf {
        self.dir.path().join(format!("tile_{}_{}.bin", row, col))
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Write a tile's samples to disk and keep only its georeference.
    pub fn save_tile(&mut self, row: usize, col: usize, raster: &ElevationRaster) -> io::Result<()> {
        let file = File::create(self.tile_path(row, col))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytemuck::cast_slice(raster.data().as_slice()))?;
        writer.flush()?;

        self.tiles.push(StoredTile {
            row,
            col,
            width: raster.width(),
            height: raster.height(),
            origin: raster.origin(),
            pixel_size: raster.pixel_size(),
            nodata: raster.nodata(),
        });
        Ok(())
    }

    fn load_tile(&self, tile: &StoredTile) -> Result<Grid<f32>, AcquisitionError> {
        let path = self.tile_path(tile.row, tile.col);
        let expected = tile.width * tile.height;
        let stored = fs::metadata(&path)?.len() as usize;
        if stored != expected * std::mem::size_of::<f32>() {
            return Err(AcquisitionError::Storage(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("tile {}_{} holds {} bytes, expected {} samples", tile.row, tile.col, stored, expected),
            )));
        }

        let mut samples = vec![0.0f32; expected];
        File::open(&path)?.read_exact(bytemuck::cast_slice_mut(&mut samples))?;
        Grid::from_vec(tile.width, tile.height, samples).ok_or_else(|| {
            AcquisitionError::Storage(io::Error::new(io::ErrorKind::InvalidData, "tile shape mismatch"))
        })
    }

    /// Merge all stored tiles onto the grid of the first tile.
    ///
    /// Output pixels take the value of the tile pixel under their centre;
    /// where tiles overlap, the one stored first wins. Pixels no tile covers
    /// are filled from their nearest neighbour.
    pub fn merge(&self) -> Result<ElevationRaster, AcquisitionError> {
        let first = self
            .tiles
            .first()
            .ok_or_else(|| AcquisitionError::Validation("no tiles to merge".into()))?;
        let (px, py) = first.pixel_size;

        let (mut min_x, mut min_y, mut max_x, mut max_y) = first.bounds();
        for tile in &self.tiles[1..] {
            let (x0, y0, x1, y1) = tile.bounds();
            min_x = min_x.min(x0);
            min_y = min_y.min(y0);
            max_x = max_x.max(x1);
            max_y = max_y.max(y1);
        }

        let width = (((max_x - min_x) / px).round() as usize).max(1);
        let height = (((max_y - min_y) / py).round() as usize).max(1);
        let mut merged = Grid::new_with(width, height, f32::NAN);

        for tile in &self.tiles {
            let data = self.load_tile(tile)?;
            let (tx0, ty0, tx1, ty1) = tile.bounds();
            let col_start = (((tx0 - min_x) / px).floor().max(0.0) as usize).min(width);
            let col_end = (((tx1 - min_x) / px).ceil().max(0.0) as usize).min(width);
            let row_start = (((max_y - ty1) / py).floor().max(0.0) as usize).min(height);
            let row_end = (((max_y - ty0) / py).ceil().max(0.0) as usize).min(height);

            for row in row_start..row_end {
                let cy = max_y - (row as f64 + 0.5) * py;
                let sy = (tile.origin.1 - cy) / tile.pixel_size.1;
                if sy < 0.0 || sy >= tile.height as f64 {
                    continue;
                }
                for col in col_start..col_end {
                    if !merged.get(col, row).is_nan() {
                        continue;
                    }
                    let cx = min_x + (col as f64 + 0.5) * px;
                    let sx = (cx - tile.origin.0) / tile.pixel_size.0;
                    if sx < 0.0 || sx >= tile.width as f64 {
                        continue;
                    }
                    let value = *data.get(sx as usize, sy as usize);
                    if !value.is_nan() && tile.nodata != Some(value) {
                        merged.set(col, row, value);
                    }
                }
            }
        }

        debug!("Merged {} tiles into {}x{}", self.tiles.len(), width, height);
        let raster = ElevationRaster::from_bounds(merged, self.crs, (min_x, min_y, max_x, max_y), None)?;
        Ok(raster.fill_nodata())
    }
}
