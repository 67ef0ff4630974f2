//! Single-band raster tiles decoded from GeoTIFF.
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;

use crate::bounds::Bounds;
use crate::error::{CensusError, Result};
use crate::transform::GeoTransform;

// ── GeoTIFF tags and keys ─────────────────────────────────────────────────────

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;

const GT_MODEL_TYPE_GEO_KEY: u32 = 1024;
const GT_RASTER_TYPE_GEO_KEY: u32 = 1025;
const GEOGRAPHIC_TYPE_GEO_KEY: u32 = 2048;
const PROJECTED_CS_TYPE_GEO_KEY: u32 = 3072;
const MODEL_TYPE_PROJECTED: u32 = 1;
const MODEL_TYPE_GEOGRAPHIC: u32 = 2;
const RASTER_PIXEL_IS_POINT: u32 = 2;
const USER_DEFINED: u32 = 32767;

/// One band of samples with its georeferencing.
///
/// Samples are row-major, row 0 at the top of the image as stored in the
/// file. Integer sample types are widened to f64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RasterTile {
    pub data: Vec<f64>,
    pub width: usize,
    pub height: usize,
    pub transform: GeoTransform,
    /// EPSG code of the native reference, if the file declares one.
    pub epsg: Option<u16>,
    pub nodata: Option<f64>,
}

impl RasterTile {
    pub fn new(
        data: Vec<f64>,
        width: usize,
        height: usize,
        transform: GeoTransform,
        epsg: Option<u16>,
        nodata: Option<f64>,
    ) -> Result<Self> {
        if data.len() != width * height {
            return Err(CensusError::Raster(format!(
                "{} samples do not fill a {width}x{height} grid",
                data.len()
            )));
        }
        Ok(Self { data, width, height, transform, epsg, nodata })
    }

    /// Bounds of the grid in its native reference.
    pub fn native_bounds(&self) -> Bounds {
        self.transform.grid_bounds(self.width, self.height)
    }

    /// Decode band 1 of a GeoTIFF file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Self::decode(BufReader::new(file))
            .map_err(|e| match e {
                CensusError::Raster(msg) => {
                    CensusError::Raster(format!("{}: {msg}", path.display()))
                }
                other => other,
            })
    }

    /// Decode band 1 from any seekable GeoTIFF stream.
    pub fn decode<R: Read + Seek>(reader: R) -> Result<Self> {
        let mut decoder = Decoder::new(reader)?;
        let (w, h) = decoder.dimensions()?;
        let (width, height) = (w as usize, h as usize);
        if width == 0 || height == 0 {
            return Err(CensusError::Raster("zero-sized image".to_string()));
        }

        let transform = read_transform(&mut decoder)?;
        let (epsg, pixel_is_point) = read_geokeys(&mut decoder)?;
        let transform = if pixel_is_point {
            // Tie points refer to pixel centres; shift to the outer corner.
            let (x, y) = transform.forward(-0.5, -0.5);
            GeoTransform { c: x, f: y, ..transform }
        } else {
            transform
        };
        let nodata = read_nodata(&mut decoder)?;
        let planar = decoder
            .find_tag(Tag::PlanarConfiguration)?
            .map(|v| v.into_u32())
            .transpose()?
            .unwrap_or(1);

        let samples = widen(decoder.read_image()?);
        let data = first_band(samples, width * height, planar)?;

        Self::new(data, width, height, transform, epsg, nodata)
    }
}

// ── Decoding helpers ──────────────────────────────────────────────────────────

fn geotiff_tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

fn read_transform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<GeoTransform> {
    if let Some(v) = decoder.find_tag(geotiff_tag(MODEL_TRANSFORMATION))? {
        let m = v.into_f64_vec()?;
        if m.len() >= 8 {
            // Row-major 4×4 matrix; rows one and two carry the 2D affine.
            return Ok(GeoTransform::from_gdal([m[3], m[0], m[1], m[7], m[4], m[5]]));
        }
    }

    let scale = decoder
        .find_tag(geotiff_tag(MODEL_PIXEL_SCALE))?
        .map(|v| v.into_f64_vec())
        .transpose()?;
    let tie = decoder
        .find_tag(geotiff_tag(MODEL_TIEPOINT))?
        .map(|v| v.into_f64_vec())
        .transpose()?;

    match (scale, tie) {
        (Some(s), Some(t)) if s.len() >= 2 && t.len() >= 6 => {
            // Tiepoint (i, j, k, x, y, z) pins raster (i, j) to map (x, y).
            let origin_x = t[3] - t[0] * s[0];
            let origin_y = t[4] + t[1] * s[1];
            Ok(GeoTransform::north_up(origin_x, origin_y, s[0], s[1]))
        }
        _ => Err(CensusError::Raster(
            "no georeferencing (ModelTransformation or PixelScale + Tiepoint)".to_string(),
        )),
    }
}

/// Returns the declared EPSG code (if any) and whether pixels are points.
fn read_geokeys<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<(Option<u16>, bool)> {
    let Some(v) = decoder.find_tag(geotiff_tag(GEO_KEY_DIRECTORY))? else {
        return Ok((None, false));
    };
    let keys = v.into_u32_vec()?;
    Ok(parse_geokeys(&keys))
}

/// Walk a GeoKeyDirectory: a 4-entry header followed by
/// `(key, location, count, value)` quadruples. Only inline values are read.
///
/// GTModelType picks which code applies. A projected model never falls back
/// to its geographic base: a user-defined projection yields no code at all.
pub(crate) fn parse_geokeys(keys: &[u32]) -> (Option<u16>, bool) {
    let mut model = None;
    let mut projected = None;
    let mut geographic = None;
    let mut pixel_is_point = false;

    if keys.len() < 4 {
        return (None, false);
    }
    let n = keys[3] as usize;
    for entry in keys[4..].chunks_exact(4).take(n) {
        let (key, location, value) = (entry[0], entry[1], entry[3]);
        if location != 0 {
            continue;
        }
        match key {
            GT_MODEL_TYPE_GEO_KEY => model = Some(value),
            GT_RASTER_TYPE_GEO_KEY => pixel_is_point = value == RASTER_PIXEL_IS_POINT,
            PROJECTED_CS_TYPE_GEO_KEY => projected = Some(value),
            GEOGRAPHIC_TYPE_GEO_KEY => geographic = Some(value),
            _ => {}
        }
    }

    let code = match model {
        Some(MODEL_TYPE_PROJECTED) => projected,
        Some(MODEL_TYPE_GEOGRAPHIC) => geographic,
        Some(_) => None,
        // No model key: a projected code, even user-defined, still wins.
        None => projected.or(geographic),
    };
    let epsg = code
        .filter(|&c| c != USER_DEFINED)
        .and_then(|c| u16::try_from(c).ok());
    (epsg, pixel_is_point)
}

fn read_nodata<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Option<f64>> {
    let Some(v) = decoder.find_tag(geotiff_tag(GDAL_NODATA))? else {
        return Ok(None);
    };
    let text = v.into_string()?;
    Ok(parse_nodata(&text))
}

pub(crate) fn parse_nodata(text: &str) -> Option<f64> {
    let trimmed = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    match trimmed.to_ascii_lowercase().as_str() {
        "" => None,
        "nan" => Some(f64::NAN),
        other => other.parse::<f64>().ok(),
    }
}

fn widen(result: DecodingResult) -> Vec<f64> {
    match result {
        DecodingResult::U8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f64).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f64).collect(),
        DecodingResult::F32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::F64(v) => v,
    }
}

/// Keep band 1 of a possibly multi-band buffer.
fn first_band(samples: Vec<f64>, pixels: usize, planar: u32) -> Result<Vec<f64>> {
    if samples.len() == pixels {
        return Ok(samples);
    }
    if pixels == 0 || samples.len() % pixels != 0 {
        return Err(CensusError::Raster(format!(
            "{} samples for {pixels} pixels",
            samples.len()
        )));
    }
    let bands = samples.len() / pixels;
    if planar == 2 {
        Ok(samples[..pixels].to_vec())
    } else {
        Ok(samples.into_iter().step_by(bands).collect())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use std::io::Cursor;

    #[test]
    fn decode_u8_geotiff_with_nodata() {
        let layout = GeoTiffLayout {
            width: 4,
            height: 2,
            origin: (10.0, 50.0),
            pixel_size: (0.5, 0.25),
            epsg: 4326,
            nodata: Some("255"),
        };
        let data: Vec<u8> = vec![1, 2, 3, 255, 4, 5, 6, 7];
        let mut buf = Cursor::new(Vec::new());
        write_u8(&mut buf, &layout, &data);
        buf.set_position(0);

        let tile = RasterTile::decode(buf).unwrap();
        assert_eq!((tile.width, tile.height), (4, 2));
        assert_eq!(tile.epsg, Some(4326));
        assert_eq!(tile.nodata, Some(255.0));
        assert_eq!(tile.data[3], 255.0);
        assert_eq!(tile.data[tile.width], 4.0);
        assert_eq!(tile.native_bounds(), Bounds::new(10.0, 49.5, 12.0, 50.0));
    }

    #[test]
    fn decode_f32_projected_geotiff() {
        let layout = GeoTiffLayout {
            width: 3,
            height: 3,
            origin: (500_000.0, 4_000_000.0),
            pixel_size: (30.0, 30.0),
            epsg: 32633,
            nodata: None,
        };
        let data = vec![0.5f32; 9];
        let mut buf = Cursor::new(Vec::new());
        write_f32(&mut buf, &layout, &data);
        buf.set_position(0);

        let tile = RasterTile::decode(buf).unwrap();
        assert_eq!(tile.epsg, Some(32633));
        assert_eq!(tile.nodata, None);
        assert_eq!(tile.transform, GeoTransform::north_up(500_000.0, 4_000_000.0, 30.0, 30.0));
    }

    #[test]
    fn garbage_bytes_are_not_a_tile() {
        let buf = Cursor::new(b"definitely not a tiff".to_vec());
        assert!(RasterTile::decode(buf).is_err());
    }

    #[test]
    fn model_transformation_carries_rotation() {
        use tiff::encoder::colortype::Gray8;
        use tiff::encoder::TiffEncoder;

        // x = 100 + 2i + 0.5j, y = 50 + 0.25i - 3j
        let matrix = [
            2.0f64, 0.5, 0.0, 100.0, //
            0.25, -3.0, 0.0, 50.0, //
            0.0, 0.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ];
        let mut buf = Cursor::new(Vec::new());
        {
            let mut encoder = TiffEncoder::new(&mut buf).unwrap();
            let mut image = encoder.new_image::<Gray8>(2, 2).unwrap();
            let dir = image.encoder();
            dir.write_tag(Tag::Unknown(MODEL_TRANSFORMATION), &matrix[..]).unwrap();
            let keys: [u16; 8] = [1, 1, 0, 1, 1024, 0, 1, 1];
            dir.write_tag(Tag::Unknown(GEO_KEY_DIRECTORY), &keys[..]).unwrap();
            image.write_data(&[1, 2, 3, 4]).unwrap();
        }
        buf.set_position(0);
        let tile = RasterTile::decode(buf).unwrap();
        assert_eq!(tile.transform, GeoTransform { a: 2.0, b: 0.5, c: 100.0, d: 0.25, e: -3.0, f: 50.0 });
        assert_eq!(tile.epsg, None);
    }

    #[test]
    fn new_rejects_mismatched_sample_count() {
        let gt = GeoTransform::north_up(0.0, 0.0, 1.0, 1.0);
        assert!(RasterTile::new(vec![0.0; 5], 2, 2, gt, Some(4326), None).is_err());
    }

    #[test]
    fn geokeys_follow_model_type() {
        let keys = [1, 1, 0, 3, 1024, 0, 1, 2, 1025, 0, 1, 2, 2048, 0, 1, 4326];
        assert_eq!(parse_geokeys(&keys), (Some(4326), true));
        let keys = [1, 1, 0, 3, 1024, 0, 1, 1, 2048, 0, 1, 4326, 3072, 0, 1, 3857];
        assert_eq!(parse_geokeys(&keys), (Some(3857), false));
        // Geographic model ignores a stray projected key.
        let keys = [1, 1, 0, 3, 1024, 0, 1, 2, 2048, 0, 1, 4269, 3072, 0, 1, 3857];
        assert_eq!(parse_geokeys(&keys), (Some(4269), false));
        assert_eq!(parse_geokeys(&[1, 1]), (None, false));
    }

    #[test]
    fn user_defined_projection_has_no_code() {
        // Projected model, custom projection on a WGS84 datum.
        let keys = [1, 1, 0, 4, 1024, 0, 1, 1, 1025, 0, 1, 1, 2048, 0, 1, 4326, 3072, 0, 1, 32767];
        assert_eq!(parse_geokeys(&keys), (None, false));
        // Same without the model key.
        let keys = [1, 1, 0, 2, 2048, 0, 1, 4326, 3072, 0, 1, 32767];
        assert_eq!(parse_geokeys(&keys), (None, false));
        let keys = [1, 1, 0, 2, 1024, 0, 1, 2, 2048, 0, 1, 32767];
        assert_eq!(parse_geokeys(&keys), (None, false));
    }

    #[test]
    fn user_defined_projection_tile_fails_to_normalize() {
        let gt = GeoTransform::north_up(500_000.0, 5_300_000.0, 1000.0, 1000.0);
        let keys = [1, 1, 0, 4, 1024, 0, 1, 1, 1025, 0, 1, 1, 2048, 0, 1, 4326, 3072, 0, 1, 32767];
        let (epsg, _) = parse_geokeys(&keys);
        let tile = RasterTile::new(vec![1.0; 4], 2, 2, gt, epsg, None).unwrap();
        assert!(matches!(
            crate::crs::normalize_bounds(tile.native_bounds(), tile.epsg, 0),
            Err(CensusError::UnsupportedCrs(_))
        ));
    }

    #[test]
    fn nodata_text_parsing() {
        assert_eq!(parse_nodata("-9999\0"), Some(-9999.0));
        assert!(parse_nodata("nan").unwrap().is_nan());
        assert_eq!(parse_nodata("  "), None);
        assert_eq!(parse_nodata("abc"), None);
    }

    #[test]
    fn first_band_of_interleaved_buffer() {
        let interleaved = vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0];
        assert_eq!(first_band(interleaved.clone(), 3, 1).unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(first_band(interleaved, 3, 2).unwrap(), vec![1.0, 10.0, 2.0]);
    }
}
