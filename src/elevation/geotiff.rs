//! Single-band GeoTIFF reading and writing.
//!
//! Only the GeoTIFF subset elevation services actually return is handled:
//! a north-up raster georeferenced by ModelPixelScale + ModelTiepoint, the
//! CRS from the GeoKey directory and an optional GDAL nodata string.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;
use tiff::ColorType;

use crate::error::RasterError;
use crate::geo::Crs;
use crate::grid::Grid;
use crate::raster::ElevationRaster;

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;

const GT_MODEL_TYPE_KEY: u16 = 1024;
const GT_RASTER_TYPE_KEY: u16 = 1025;
const GEOGRAPHIC_TYPE_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_KEY: u16 = 3072;
const USER_DEFINED: u16 = 32767;

fn tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

/// EPSG code from a GeoKey directory, projected key first.
fn crs_from_geokeys(keys: &[u16]) -> Option<Crs> {
    if keys.len() < 4 {
        return None;
    }
    let count = keys[3] as usize;
    let entries: Vec<&[u16]> = keys[4..].chunks_exact(4).take(count).collect();
    let lookup = |id: u16| {
        entries
            .iter()
            .find(|e| e[0] == id && e[1] == 0)
            .map(|e| e[3])
            .filter(|&code| code != 0 && code != USER_DEFINED)
    };
    lookup(PROJECTED_CS_TYPE_KEY)
        .or_else(|| lookup(GEOGRAPHIC_TYPE_KEY))
        .map(|code| Crs(code as u32))
}

fn samples_to_f32(result: DecodingResult) -> Result<Vec<f32>, RasterError> {
    #[allow(unreachable_patterns)]
    let samples = match result {
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|s| s as f32).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|s| s as f32).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|s| s as f32).collect(),
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|s| s as f32).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|s| s as f32).collect(),
        _ => return Err(RasterError::UnsupportedSampleFormat("unknown sample type".into())),
    };
    Ok(samples)
}

/// Decode a GeoTIFF held in memory. `default_crs` is used when the file has
/// no usable GeoKey directory.
pub fn decode(bytes: &[u8], default_crs: Crs) -> Result<ElevationRaster, RasterError> {
    let mut decoder = Decoder::new(Cursor::new(bytes))?;
    let (width, height) = decoder.dimensions()?;

    match decoder.colortype()? {
        ColorType::Gray(_) => {}
        other => return Err(RasterError::UnsupportedSampleFormat(format!("{other:?}"))),
    }

    let scale = decoder
        .find_tag(tag(MODEL_PIXEL_SCALE))?
        .map(|v| v.into_f64_vec())
        .transpose()?
        .filter(|s| s.len() >= 2)
        .ok_or(RasterError::MissingGeoreference)?;
    let tiepoint = decoder
        .find_tag(tag(MODEL_TIEPOINT))?
        .map(|v| v.into_f64_vec())
        .transpose()?
        .filter(|t| t.len() >= 6)
        .ok_or(RasterError::MissingGeoreference)?;
    let crs = decoder
        .find_tag(tag(GEO_KEY_DIRECTORY))?
        .map(|v| v.into_u16_vec())
        .transpose()?
        .and_then(|keys| crs_from_geokeys(&keys))
        .unwrap_or(default_crs);
    let nodata = decoder
        .find_tag(tag(GDAL_NODATA))?
        .map(|v| v.into_string())
        .transpose()?
        .and_then(|s| s.trim_matches(|c: char| c == '\0' || c.is_whitespace()).parse::<f32>().ok());

    let samples = samples_to_f32(decoder.read_image()?)?;
    let expected = width as usize * height as usize;
    if samples.len() != expected {
        return Err(RasterError::SampleCount {
            got: samples.len(),
            expected,
        });
    }
    let data = Grid::from_vec(width as usize, height as usize, samples).ok_or(RasterError::SampleCount {
        got: 0,
        expected,
    })?;

    let (sx, sy) = (scale[0].abs(), scale[1].abs());
    let (i, j, x, y) = (tiepoint[0], tiepoint[1], tiepoint[3], tiepoint[4]);
    let origin = (x - i * sx, y + j * sy);

    ElevationRaster::new(data, crs, origin, (sx, sy), nodata)
}

pub fn read_geotiff(path: &Path, default_crs: Crs) -> Result<ElevationRaster, RasterError> {
    let bytes = fs::read(path)?;
    decode(&bytes, default_crs)
}

/// Encode as a little-endian float32 GeoTIFF.
pub fn encode(raster: &ElevationRaster) -> Result<Vec<u8>, RasterError> {
    let (sx, sy) = raster.pixel_size();
    let (ox, oy) = raster.origin();
    let crs = raster.crs();
    let code = u16::try_from(crs.epsg()).unwrap_or(USER_DEFINED);
    let (model_type, crs_key) = if crs.is_geographic() {
        (2, GEOGRAPHIC_TYPE_KEY)
    } else {
        (1, PROJECTED_CS_TYPE_KEY)
    };
    #[rustfmt::skip]
    let geokeys: [u16; 16] = [
        1, 1, 0, 3,
        GT_MODEL_TYPE_KEY, 0, 1, model_type,
        GT_RASTER_TYPE_KEY, 0, 1, 1,
        crs_key, 0, 1, code,
    ];

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut encoder = TiffEncoder::new(&mut cursor)?;
        let mut image =
            encoder.new_image::<colortype::Gray32Float>(raster.width() as u32, raster.height() as u32)?;
        image.encoder().write_tag(tag(MODEL_PIXEL_SCALE), &[sx, sy, 0.0][..])?;
        image
            .encoder()
            .write_tag(tag(MODEL_TIEPOINT), &[0.0, 0.0, 0.0, ox, oy, 0.0][..])?;
        image.encoder().write_tag(tag(GEO_KEY_DIRECTORY), &geokeys[..])?;
        if let Some(nodata) = raster.nodata() {
            image.encoder().write_tag(tag(GDAL_NODATA), nodata.to_string().as_str())?;
        }
        image.write_data(raster.data().as_slice())?;
    }
    Ok(cursor.into_inner())
}

pub fn write_geotiff(raster: &ElevationRaster, path: &Path) -> Result<(), RasterError> {
    fs::write(path, encode(raster)?)?;
    Ok(())
}
