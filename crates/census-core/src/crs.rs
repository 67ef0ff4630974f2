//! Coordinate reference handling.
//!
//! Everything is reconciled to WGS84 longitude/latitude (EPSG:4326) before
//! comparison. Transforms are pure Rust: proj4 definitions come from the
//! `crs-definitions` EPSG table and are executed by `proj4rs`.
use geo::{coord, MapCoords, MultiPolygon};
use proj4rs::proj::Proj;
use proj4rs::transform::transform;

use crate::bounds::Bounds;
use crate::error::{CensusError, Result};

/// EPSG code of the canonical geographic reference.
pub const WGS84: u16 = 4326;

/// Look up the proj4 definition for an EPSG code.
pub fn proj_string(epsg: u16) -> Option<&'static str> {
    crs_definitions::from_code(epsg).map(|def| def.proj4)
}

/// A reusable transform between two EPSG references.
pub struct CrsTransformer {
    source: Proj,
    target: Proj,
    source_geographic: bool,
    target_geographic: bool,
    label: String,
}

impl CrsTransformer {
    pub fn new(source_epsg: u16, target_epsg: u16) -> Result<Self> {
        let source_str = proj_string(source_epsg).ok_or_else(|| {
            CensusError::UnsupportedCrs(format!("EPSG:{source_epsg} is not in the EPSG table"))
        })?;
        let target_str = proj_string(target_epsg).ok_or_else(|| {
            CensusError::UnsupportedCrs(format!("EPSG:{target_epsg} is not in the EPSG table"))
        })?;

        let source = Proj::from_proj_string(source_str).map_err(|e| {
            CensusError::UnsupportedCrs(format!("EPSG:{source_epsg}: {e:?}"))
        })?;
        let target = Proj::from_proj_string(target_str).map_err(|e| {
            CensusError::UnsupportedCrs(format!("EPSG:{target_epsg}: {e:?}"))
        })?;

        Ok(Self {
            source,
            target,
            source_geographic: source_str.contains("+proj=longlat"),
            target_geographic: target_str.contains("+proj=longlat"),
            label: format!("EPSG:{source_epsg} -> EPSG:{target_epsg}"),
        })
    }

    /// Transform one point. Geographic coordinates are in degrees on both
    /// sides; proj4rs itself works in radians.
    pub fn apply(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        let mut point = if self.source_geographic {
            (x.to_radians(), y.to_radians(), 0.0)
        } else {
            (x, y, 0.0)
        };
        transform(&self.source, &self.target, &mut point).map_err(|e| {
            CensusError::Projection(format!("{} failed at ({x}, {y}): {e:?}", self.label))
        })?;
        let out = if self.target_geographic {
            (point.0.to_degrees(), point.1.to_degrees())
        } else {
            (point.0, point.1)
        };
        if !out.0.is_finite() || !out.1.is_finite() {
            return Err(CensusError::Projection(format!(
                "{} produced a non-finite point for ({x}, {y})",
                self.label
            )));
        }
        Ok(out)
    }
}

/// Carry every vertex of a multipolygon through `tf`.
pub fn reproject_polygons(
    geometry: &MultiPolygon<f64>,
    tf: &CrsTransformer,
) -> Result<MultiPolygon<f64>> {
    geometry.try_map_coords(|c| tf.apply(c.x, c.y).map(|(x, y)| coord! { x: x, y: y }))
}

/// Bring a tile's native bounds into WGS84.
///
/// Identical references pass through untouched. Otherwise the boundary points
/// (corners plus `densify` points per edge) are transformed and the enclosing
/// rectangle is returned. This is a bounding transform, good enough to narrow
/// the candidate search; pixel attribution does not depend on it.
pub fn normalize_bounds(native: Bounds, epsg: Option<u16>, densify: usize) -> Result<Bounds> {
    let epsg = epsg.ok_or_else(|| {
        CensusError::UnsupportedCrs("raster carries no EPSG reference".to_string())
    })?;
    if epsg == WGS84 {
        return Ok(native);
    }

    let tf = CrsTransformer::new(epsg, WGS84)?;
    let projected = native
        .boundary_points(densify)
        .into_iter()
        .map(|(x, y)| tf.apply(x, y))
        .collect::<Result<Vec<_>>>()?;

    Bounds::enclosing(projected).ok_or_else(|| {
        CensusError::Projection(format!("EPSG:{epsg} bounds could not be transformed"))
    })
}
