//! Vector feature collections (GeoJSON-compatible).
//!
//! Features arrive from an external extractor as GeoJSON
//! `FeatureCollection`s with flat property maps. The pipeline only reads
//! them: geometries get rasterized or transformed on a copy.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PipelineError;

/// A coordinate tuple: `[x, y, ...]`. Values after the first two (such as
/// elevation) are carried through untouched.
pub type Position = Vec<f64>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Point { coordinates: Position },
    MultiPoint { coordinates: Vec<Position> },
    LineString { coordinates: Vec<Position> },
    MultiLineString { coordinates: Vec<Vec<Position>> },
    Polygon { coordinates: Vec<Vec<Position>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Position>>> },
    GeometryCollection { geometries: Vec<Geometry> },
}

impl Geometry {
    /// Visit every position, recursing into collections.
    pub fn try_for_each_position_mut<E>(
        &mut self,
        f: &mut impl FnMut(&mut Position) -> Result<(), E>,
    ) -> Result<(), E> {
        match self {
            Geometry::Point { coordinates } => f(coordinates),
            Geometry::MultiPoint { coordinates } | Geometry::LineString { coordinates } => {
                coordinates.iter_mut().try_for_each(|p| f(p))
            }
            Geometry::MultiLineString { coordinates } | Geometry::Polygon { coordinates } => coordinates
                .iter_mut()
                .flat_map(|line| line.iter_mut())
                .try_for_each(|p| f(p)),
            Geometry::MultiPolygon { coordinates } => coordinates
                .iter_mut()
                .flat_map(|poly| poly.iter_mut())
                .flat_map(|ring| ring.iter_mut())
                .try_for_each(|p| f(p)),
            Geometry::GeometryCollection { geometries } => {
                geometries.iter_mut().try_for_each(|g| g.try_for_each_position_mut(&mut *f))
            }
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Geometry::Point { .. } => "Point",
            Geometry::MultiPoint { .. } => "MultiPoint",
            Geometry::LineString { .. } => "LineString",
            Geometry::MultiLineString { .. } => "MultiLineString",
            Geometry::Polygon { .. } => "Polygon",
            Geometry::MultiPolygon { .. } => "MultiPolygon",
            Geometry::GeometryCollection { .. } => "GeometryCollection",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureTag {
    #[default]
    Feature,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type", default)]
    pub kind: FeatureTag,
    /// GeoJSON allows `null` geometries; those features are skipped by consumers.
    #[serde(default)]
    pub geometry: Option<Geometry>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub properties: Map<String, Value>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Feature {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            kind: FeatureTag::Feature,
            geometry: Some(geometry),
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    /// A property rendered as a string, if it is a string or a number.
    pub fn property_str(&self, key: &str) -> Option<String> {
        match self.properties.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionTag {
    #[default]
    FeatureCollection,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type", default)]
    pub kind: CollectionTag,
    #[serde(default)]
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            kind: CollectionTag::FeatureCollection,
            features,
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Features whose properties pass the filter, in their original order.
    pub fn filtered<'a>(&'a self, filter: &'a TagFilter) -> impl Iterator<Item = &'a Feature> + 'a {
        self.features.iter().filter(move |f| filter.matches(f))
    }
}

/// Keeps a feature when any listed key holds one of its allowed values.
/// An empty filter keeps everything.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TagFilter {
    rules: Vec<(String, Vec<String>)>,
}

impl TagFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn new(key: &str, values: &[&str]) -> Self {
        Self::any().or(key, values)
    }

    pub fn or(mut self, key: &str, values: &[&str]) -> Self {
        self.rules
            .push((key.to_string(), values.iter().map(|v| v.to_string()).collect()));
        self
    }

    pub fn matches(&self, feature: &Feature) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        self.rules.iter().any(|(key, allowed)| {
            feature
                .property_str(key)
                .map(|v| allowed.iter().any(|a| *a == v))
                .unwrap_or(false)
        })
    }
}

/// The vector layers a job consumes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureLayers {
    /// Road centrelines, classified by the `highway` property.
    #[serde(default)]
    pub roads: FeatureCollection,
    /// Water bodies, classified by `natural` / `water_type`.
    #[serde(default)]
    pub water: FeatureCollection,
    #[serde(default)]
    pub forests: FeatureCollection,
    #[serde(default)]
    pub buildings: FeatureCollection,
    /// Land-use polygons, classified by the `type` property.
    #[serde(default)]
    pub land_use: FeatureCollection,
}

impl FeatureLayers {
    pub fn from_path(path: &Path) -> Result<Self, PipelineError> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|source| PipelineError::Features {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn total(&self) -> usize {
        self.roads.len() + self.water.len() + self.forests.len() + self.buildings.len() + self.land_use.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_feature_collection() {
        let json = r#"{
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature",
                 "geometry": {"type": "LineString", "coordinates": [[10.0, 60.0], [10.1, 60.1, 123.0]]},
                 "properties": {"highway": "primary"}},
                {"type": "Feature", "geometry": null, "properties": null},
                {"type": "Feature",
                 "geometry": {"type": "GeometryCollection", "geometries": [
                    {"type": "Point", "coordinates": [10.05, 60.05]}
                 ]}}
            ]
        }"#;
        let fc: FeatureCollection = serde_json::from_str(json).unwrap();
        assert_eq!(fc.len(), 3);
        assert!(fc.features[1].geometry.is_none());
        match &fc.features[0].geometry {
            Some(Geometry::LineString { coordinates }) => assert_eq!(coordinates[1].len(), 3),
            other => panic!("unexpected geometry {other:?}"),
        }
        assert_eq!(fc.features[2].geometry.as_ref().unwrap().type_name(), "GeometryCollection");
    }

    #[test]
    fn test_tag_filter() {
        let road = Feature::new(Geometry::Point { coordinates: vec![0.0, 0.0] }).with_property("highway", "track");
        let lake = Feature::new(Geometry::Point { coordinates: vec![0.0, 0.0] }).with_property("natural", "water");

        let gravel = TagFilter::new("highway", &["track", "path"]);
        assert!(gravel.matches(&road));
        assert!(!gravel.matches(&lake));

        let water = TagFilter::new("natural", &["water"]).or("water_type", &["lake"]);
        assert!(water.matches(&lake));
        assert!(TagFilter::any().matches(&road));
    }

    #[test]
    fn test_position_visitor_recurses() {
        let mut geom = Geometry::GeometryCollection {
            geometries: vec![
                Geometry::Point { coordinates: vec![1.0, 2.0] },
                Geometry::MultiPolygon {
                    coordinates: vec![vec![vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![1.0, 1.0], vec![0.0, 0.0]]]],
                },
            ],
        };
        let mut count = 0;
        geom.try_for_each_position_mut::<()>(&mut |p| {
            p[0] += 10.0;
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 5);
    }

    #[test]
    fn test_layers_default_when_missing() {
        let layers: FeatureLayers = serde_json::from_str(r#"{"roads": {"type": "FeatureCollection", "features": []}}"#).unwrap();
        assert_eq!(layers.total(), 0);
    }
}
