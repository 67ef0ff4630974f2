//! Country regions and the read-only index queried per tile.
use std::fs;
use std::path::Path;

use geo::{BoundingRect, Coord, Geometry, Intersects, LineString, MultiPolygon, Polygon};
use geojson::{FeatureCollection, GeoJson, JsonObject, JsonValue};
use shapefile::dbase::{FieldValue, Record};
use shapefile::{Point, PointM, PointZ, PolygonRing, Shape};
use tracing::{debug, info, warn};

use crate::bounds::Bounds;
use crate::crs::{reproject_polygons, CrsTransformer, WGS84};
use crate::error::{CensusError, Result};

/// Property names tried, in order, when no label property is configured.
pub const DEFAULT_LABEL_PROPERTIES: [&str; 2] = ["name", "NAME"];

/// A named polygon in WGS84.
#[derive(Debug, Clone)]
pub struct CountryRegion {
    pub name: String,
    pub geometry: MultiPolygon<f64>,
}

impl CountryRegion {
    pub fn new(name: impl Into<String>, geometry: MultiPolygon<f64>) -> Self {
        Self { name: name.into(), geometry }
    }
}

/// Regions in load order plus cached bounding boxes.
///
/// Built once, never mutated afterwards, so it can be shared by reference
/// across worker threads.
#[derive(Debug, Clone, Default)]
pub struct RegionIndex {
    regions: Vec<CountryRegion>,
    envelopes: Vec<Option<Bounds>>,
}

impl RegionIndex {
    pub fn new(regions: Vec<CountryRegion>) -> Self {
        let envelopes = regions
            .iter()
            .map(|r| r.geometry.bounding_rect().map(Bounds::from))
            .collect();
        Self { regions, envelopes }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn regions(&self) -> &[CountryRegion] {
        &self.regions
    }

    /// Every region whose polygon intersects the rectangle, in load order.
    ///
    /// The cached envelope only rejects obvious misses; the decision is made
    /// by a polygon/rectangle intersection test.
    pub fn candidates(&self, bounds: &Bounds) -> Vec<&CountryRegion> {
        let rect = bounds.to_rect().to_polygon();
        self.regions
            .iter()
            .zip(&self.envelopes)
            .filter(|(_, env)| env.is_some_and(|e| e.overlaps(bounds)))
            .filter(|(region, _)| region.geometry.0.iter().any(|p| p.intersects(&rect)))
            .map(|(region, _)| region)
            .collect()
    }

    /// Load country shapes, picking the reader by extension: `.shp` is an
    /// ESRI shapefile, anything else is read as GeoJSON.
    pub fn from_path<P: AsRef<Path>>(path: P, label_property: Option<&str>) -> Result<Self> {
        let path = path.as_ref();
        let is_shapefile = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("shp"));
        if is_shapefile {
            Self::from_shapefile_path(path, label_property)
        } else {
            Self::from_geojson_path(path, label_property)
        }
    }

    /// Load a GeoJSON FeatureCollection.
    pub fn from_geojson_path<P: AsRef<Path>>(path: P, label_property: Option<&str>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading country shapes");
        let text = fs::read_to_string(path)?;
        let index = Self::from_geojson_str(&text, label_property)?;
        info!(count = index.len(), "Loaded countries");
        Ok(index)
    }

    /// Parse a GeoJSON FeatureCollection. A legacy `crs` member naming an
    /// EPSG code other than 4326 reprojects every coordinate once, here.
    pub fn from_geojson_str(text: &str, label_property: Option<&str>) -> Result<Self> {
        let collection = match text.parse::<GeoJson>()? {
            GeoJson::FeatureCollection(fc) => fc,
            GeoJson::Feature(f) => FeatureCollection {
                bbox: None,
                features: vec![f],
                foreign_members: None,
            },
            GeoJson::Geometry(_) => {
                return Err(CensusError::Geometry(
                    "expected a FeatureCollection of countries, found a bare geometry".to_string(),
                ))
            }
        };

        let source_epsg = collection
            .foreign_members
            .as_ref()
            .and_then(declared_epsg)
            .unwrap_or(WGS84);
        let reprojector = if source_epsg == WGS84 {
            None
        } else {
            info!(epsg = source_epsg, "Reprojecting country shapes to EPSG:4326");
            Some(CrsTransformer::new(source_epsg, WGS84)?)
        };

        let mut regions = Vec::with_capacity(collection.features.len());
        for (idx, feature) in collection.features.into_iter().enumerate() {
            let name = feature
                .properties
                .as_ref()
                .and_then(|props| pick_label(label_property, |key| json_text(props.get(key)?)))
                .unwrap_or_else(|| format!("Country_{idx}"));

            let Some(geometry) = feature.geometry else {
                warn!(country = %name, "Feature has no geometry, skipping");
                continue;
            };
            let geometry = match Geometry::<f64>::try_from(geometry) {
                Ok(g) => g,
                Err(e) => {
                    warn!(country = %name, error = %e, "Unreadable geometry, skipping");
                    continue;
                }
            };
            let Some(mut polygons) = polygonal(geometry) else {
                warn!(country = %name, "Geometry is not polygonal, skipping");
                continue;
            };

            if let Some(tf) = &reprojector {
                polygons = reproject_polygons(&polygons, tf)?;
            }

            debug!(country = %name, parts = polygons.0.len(), "Loaded region");
            regions.push(CountryRegion::new(name, polygons));
        }

        Ok(Self::new(regions))
    }

    /// Load an ESRI shapefile and its `.dbf` attribute table.
    ///
    /// Coordinates are read as WGS84 longitude/latitude. A sibling `.prj`
    /// describing a projected system is rejected rather than misread.
    pub fn from_shapefile_path<P: AsRef<Path>>(path: P, label_property: Option<&str>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading country shapes");
        if let Ok(prj) = fs::read_to_string(path.with_extension("prj")) {
            if prj.trim_start().starts_with("PROJCS") {
                return Err(CensusError::UnsupportedCrs(format!(
                    "{} is projected; country shapes must be in EPSG:4326",
                    path.display()
                )));
            }
        }

        let mut reader = shapefile::Reader::from_path(path)?;
        let mut regions = Vec::new();
        for (idx, item) in reader.iter_shapes_and_records().enumerate() {
            let (shape, record) = item?;
            let name = pick_label(label_property, |key| dbf_text(&record, key))
                .unwrap_or_else(|| format!("Country_{idx}"));

            let polygons = match shape {
                Shape::Polygon(p) => from_rings(p.rings(), |pt: &Point| (pt.x, pt.y)),
                Shape::PolygonM(p) => from_rings(p.rings(), |pt: &PointM| (pt.x, pt.y)),
                Shape::PolygonZ(p) => from_rings(p.rings(), |pt: &PointZ| (pt.x, pt.y)),
                Shape::NullShape => {
                    warn!(country = %name, "Record has no shape, skipping");
                    continue;
                }
                _ => None,
            };
            let Some(polygons) = polygons else {
                warn!(country = %name, "Shape is not polygonal, skipping");
                continue;
            };

            debug!(country = %name, parts = polygons.0.len(), "Loaded region");
            regions.push(CountryRegion::new(name, polygons));
        }

        let index = Self::new(regions);
        info!(count = index.len(), "Loaded countries");
        Ok(index)
    }
}

/// Group shapefile rings into polygons: each outer ring opens a polygon and
/// the inner rings after it are its holes.
fn from_rings<P>(rings: &[PolygonRing<P>], xy: impl Fn(&P) -> (f64, f64)) -> Option<MultiPolygon<f64>> {
    let line = |points: &[P]| -> LineString<f64> {
        points
            .iter()
            .map(|p| {
                let (x, y) = xy(p);
                Coord { x, y }
            })
            .collect()
    };

    let mut parts: Vec<(LineString<f64>, Vec<LineString<f64>>)> = Vec::new();
    for ring in rings {
        match ring {
            PolygonRing::Outer(points) => parts.push((line(points), Vec::new())),
            PolygonRing::Inner(points) => match parts.last_mut() {
                Some((_, holes)) => holes.push(line(points)),
                None => warn!("Hole before any outer ring, skipping"),
            },
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(MultiPolygon::new(
        parts
            .into_iter()
            .map(|(exterior, holes)| Polygon::new(exterior, holes))
            .collect(),
    ))
}

/// Collapse a geometry to its polygonal parts.
fn polygonal(geometry: Geometry<f64>) -> Option<MultiPolygon<f64>> {
    let parts: Vec<Polygon<f64>> = match geometry {
        Geometry::Polygon(p) => vec![p],
        Geometry::MultiPolygon(mp) => mp.0,
        Geometry::Rect(r) => vec![r.to_polygon()],
        Geometry::GeometryCollection(gc) => gc
            .0
            .into_iter()
            .filter_map(polygonal)
            .flat_map(|mp| mp.0)
            .collect(),
        _ => return None,
    };
    if parts.is_empty() {
        None
    } else {
        Some(MultiPolygon::new(parts))
    }
}

fn pick_label(label_property: Option<&str>, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    match label_property {
        Some(key) => lookup(key),
        None => DEFAULT_LABEL_PROPERTIES.iter().find_map(|&k| lookup(k)),
    }
}

fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Null => None,
        other => Some(other.to_string()),
    }
}

fn dbf_text(record: &Record, key: &str) -> Option<String> {
    match record.get(key)? {
        FieldValue::Character(Some(s)) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        FieldValue::Numeric(Some(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Read an EPSG code out of a legacy `"crs": {"type": "name", ...}` member.
/// Accepts `EPSG:3857`, `urn:ogc:def:crs:EPSG::3857` and the CRS84 URN.
fn declared_epsg(members: &JsonObject) -> Option<u16> {
    let name = members
        .get("crs")?
        .get("properties")?
        .get("name")?
        .as_str()?;
    if name.ends_with("CRS84") {
        return Some(WGS84);
    }
    name.rsplit(':').next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: x0, y: y0),
            (x: x1, y: y0),
            (x: x1, y: y1),
            (x: x0, y: y1),
            (x: x0, y: y0),
        ]])
    }

    fn triangle() -> MultiPolygon<f64> {
        // Hypotenuse runs from (0, 10) to (10, 0); the box near (9, 9) is
        // inside its envelope but outside the polygon.
        MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0),
            (x: 10.0, y: 0.0),
            (x: 0.0, y: 10.0),
            (x: 0.0, y: 0.0),
        ]])
    }

    #[test]
    fn candidates_keep_load_order() {
        let index = RegionIndex::new(vec![
            CountryRegion::new("Zeta", square(0.0, 0.0, 5.0, 5.0)),
            CountryRegion::new("Alpha", square(4.0, 0.0, 9.0, 5.0)),
            CountryRegion::new("Far", square(50.0, 50.0, 60.0, 60.0)),
        ]);
        let names: Vec<&str> = index
            .candidates(&Bounds::new(3.0, 1.0, 6.0, 2.0))
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(names, vec!["Zeta", "Alpha"]);
    }

    #[test]
    fn candidates_use_true_polygon_not_envelope() {
        let index = RegionIndex::new(vec![CountryRegion::new("Tri", triangle())]);
        assert!(index.candidates(&Bounds::new(8.5, 8.5, 9.5, 9.5)).is_empty());
        assert_eq!(index.candidates(&Bounds::new(1.0, 1.0, 2.0, 2.0)).len(), 1);
    }

    #[test]
    fn loads_feature_collection_with_name_fallbacks() {
        let text = r#"{
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "properties": {"name": "Aland"},
                 "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]}},
                {"type": "Feature", "properties": {"NAME": "Borduria"},
                 "geometry": {"type": "MultiPolygon", "coordinates": [[[[2,0],[3,0],[3,1],[2,0]]], [[[5,5],[6,5],[6,6],[5,5]]]]}},
                {"type": "Feature", "properties": {},
                 "geometry": {"type": "Polygon", "coordinates": [[[7,0],[8,0],[8,1],[7,0]]]}},
                {"type": "Feature", "properties": {"name": "Pointland"},
                 "geometry": {"type": "Point", "coordinates": [1, 1]}},
                {"type": "Feature", "properties": {"name": "Nowhere"}, "geometry": null}
            ]
        }"#;
        let index = RegionIndex::from_geojson_str(text, None).unwrap();
        let names: Vec<&str> = index.regions().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Aland", "Borduria", "Country_2"]);
        assert_eq!(index.regions()[1].geometry.0.len(), 2);
    }

    #[test]
    fn label_property_override_selects_canonical_code() {
        let text = r#"{
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "properties": {"name": "france", "ISO_A3": "FRA"},
                 "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,0]]]}}
            ]
        }"#;
        let index = RegionIndex::from_geojson_str(text, Some("ISO_A3")).unwrap();
        assert_eq!(index.regions()[0].name, "FRA");
    }

    #[test]
    fn legacy_crs_member_reprojects_once_at_load() {
        let m = 111_319.490_793_273_57;
        let text = format!(
            r#"{{
                "type": "FeatureCollection",
                "crs": {{"type": "name", "properties": {{"name": "urn:ogc:def:crs:EPSG::3857"}}}},
                "features": [
                    {{"type": "Feature", "properties": {{"name": "Merc"}},
                     "geometry": {{"type": "Polygon", "coordinates": [[[0,0],[{m},0],[{m},{m}],[0,{m}],[0,0]]]}}}}
                ]
            }}"#
        );
        let index = RegionIndex::from_geojson_str(&text, None).unwrap();
        let env = index.regions()[0].geometry.bounding_rect().unwrap();
        assert!((env.max().x - 1.0).abs() < 1e-6);
        assert!(env.max().y < 1.0 && env.max().y > 0.99);
    }

    fn write_shapefile(path: &Path) {
        use shapefile::dbase::{FieldName, TableWriterBuilder};

        let table = TableWriterBuilder::new()
            .add_character_field(FieldName::try_from("NAME").unwrap(), 32)
            .add_character_field(FieldName::try_from("ISO_A3").unwrap(), 3);
        let mut writer = shapefile::Writer::from_path(path, table).unwrap();

        let square = |x0: f64, y0: f64, x1: f64, y1: f64| {
            vec![
                Point::new(x0, y0),
                Point::new(x0, y1),
                Point::new(x1, y1),
                Point::new(x1, y0),
                Point::new(x0, y0),
            ]
        };
        let rows = [
            ("Aland", "ALA", shapefile::Polygon::new(PolygonRing::Outer(square(0.0, 0.0, 4.0, 4.0)))),
            (
                "Borduria",
                "BOR",
                shapefile::Polygon::with_rings(vec![
                    PolygonRing::Outer(square(10.0, 0.0, 20.0, 10.0)),
                    PolygonRing::Inner(square(12.0, 2.0, 14.0, 4.0)),
                    PolygonRing::Outer(square(30.0, 0.0, 31.0, 1.0)),
                ]),
            ),
            ("", "", shapefile::Polygon::new(PolygonRing::Outer(square(50.0, 0.0, 51.0, 1.0)))),
        ];
        for (name, code, polygon) in rows {
            let mut record = Record::default();
            record.insert("NAME".to_string(), FieldValue::Character(Some(name.to_string())));
            record.insert("ISO_A3".to_string(), FieldValue::Character(Some(code.to_string())));
            writer.write_shape_and_record(&polygon, &record).unwrap();
        }
    }

    #[test]
    fn loads_shapefile_polygons_and_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("countries.shp");
        write_shapefile(&path);

        let index = RegionIndex::from_path(&path, None).unwrap();
        let names: Vec<&str> = index.regions().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Aland", "Borduria", "Country_2"]);

        let borduria = &index.regions()[1].geometry;
        assert_eq!(borduria.0.len(), 2);
        assert_eq!(borduria.0[0].interiors().len(), 1);
        assert_eq!(index.candidates(&Bounds::new(1.0, 1.0, 2.0, 2.0)).len(), 1);
        // Inside Borduria's hole only.
        assert!(index.candidates(&Bounds::new(12.5, 2.5, 13.5, 3.5)).is_empty());

        let coded = RegionIndex::from_path(&path, Some("ISO_A3")).unwrap();
        assert_eq!(coded.regions()[0].name, "ALA");
    }

    #[test]
    fn projected_shapefile_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("countries.shp");
        write_shapefile(&path);
        fs::write(
            path.with_extension("prj"),
            r#"PROJCS["WGS 84 / Pseudo-Mercator",GEOGCS["WGS 84"]]"#,
        )
        .unwrap();
        assert!(matches!(
            RegionIndex::from_path(&path, None),
            Err(CensusError::UnsupportedCrs(_))
        ));
    }

    #[test]
    fn non_shp_extension_is_read_as_geojson() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("countries.json");
        fs::write(
            &path,
            r#"{"type": "Feature", "properties": {"name": "Solo"},
                "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,0]]]}}"#,
        )
        .unwrap();
        assert_eq!(RegionIndex::from_path(&path, None).unwrap().regions()[0].name, "Solo");
    }

    #[test]
    fn bare_geometry_is_rejected() {
        let text = r#"{"type": "Point", "coordinates": [0, 0]}"#;
        assert!(RegionIndex::from_geojson_str(text, None).is_err());
    }
}
