//! Service, layer and feature models shared by the query and edit paths.

use crate::geometry::EsriGeometry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const WEB_MERCATOR_SRID: i32 = 3857;
pub const DEFAULT_OBJECT_ID_FIELD: &str = "db_id";
pub const DEFAULT_GEOMETRY_FIELD: &str = "dbasin_geom";

/// Column alias used for the geometry text in compiled queries.
pub const GEOMETRY_OUTPUT_COLUMN: &str = "st_astext";
pub const SOURCE_ALIAS: &str = "source";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeometryType {
    #[serde(rename = "esriGeometryPoint")]
    Point,
    #[serde(rename = "esriGeometryPolyline")]
    Polyline,
    #[serde(rename = "esriGeometryPolygon")]
    Polygon,
}

impl GeometryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeometryType::Point => "esriGeometryPoint",
            GeometryType::Polyline => "esriGeometryPolyline",
            GeometryType::Polygon => "esriGeometryPolygon",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpatialReference {
    pub wkid: i32,
}

impl Default for SpatialReference {
    fn default() -> Self {
        Self {
            wkid: WEB_MERCATOR_SRID,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extent {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
    pub spatial_reference: SpatialReference,
}

impl Extent {
    pub fn global() -> Self {
        Self {
            xmin: -20_000_000.0,
            ymin: -7_000_000.0,
            xmax: 20_000_000.0,
            ymax: 18_000_000.0,
            spatial_reference: SpatialReference::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeInfo {
    pub start_time_field: String,
    #[serde(default)]
    pub time_interval: Option<i64>,
    #[serde(default)]
    pub time_interval_units: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    pub related_title: String,
    pub related_index: i32,
    pub source_column: String,
    pub target_column: String,
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Layer {
    pub id: i32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub table: String,
    #[serde(default = "default_object_id_field")]
    pub object_id_field: String,
    #[serde(default = "default_geometry_field")]
    pub geometry_field: String,
    pub geometry_type: GeometryType,
    #[serde(default = "default_srid")]
    pub srid: i32,
    #[serde(default)]
    pub display_field: Option<String>,
    #[serde(default)]
    pub time_info: Option<TimeInfo>,
    #[serde(default)]
    pub drawing_info: Option<Value>,
    #[serde(default)]
    pub relations: Vec<Relation>,
}

impl Layer {
    pub fn time_field(&self) -> Option<&str> {
        self.time_info
            .as_ref()
            .map(|info| info.start_time_field.as_str())
    }

    pub fn relation(&self, title: &str) -> Option<&Relation> {
        self.relations
            .iter()
            .find(|relation| relation.related_title == title)
    }
}

fn default_object_id_field() -> String {
    DEFAULT_OBJECT_ID_FIELD.to_string()
}

fn default_geometry_field() -> String {
    DEFAULT_GEOMETRY_FIELD.to_string()
}

const fn default_srid() -> i32 {
    WEB_MERCATOR_SRID
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub copyright_text: String,
    #[serde(default)]
    pub spatial_reference: SpatialReference,
    #[serde(default = "default_units")]
    pub units: String,
    #[serde(default = "default_allow_geometry_updates")]
    pub allow_geometry_updates: bool,
    #[serde(default = "Extent::global")]
    pub initial_extent: Extent,
    #[serde(default = "Extent::global")]
    pub full_extent: Extent,
    #[serde(default)]
    pub layers: Vec<Layer>,
}

impl Service {
    pub fn layer(&self, id: i32) -> Option<&Layer> {
        self.layers.iter().find(|layer| layer.id == id)
    }
}

fn default_units() -> String {
    "esriMeters".to_string()
}

const fn default_allow_geometry_updates() -> bool {
    true
}

pub type Attributes = Map<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<EsriGeometry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub related: BTreeMap<String, Vec<Attributes>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_defaults_fill_system_columns() {
        let layer: Layer = serde_json::from_value(serde_json::json!({
            "id": 0,
            "name": "Wells",
            "table": "db_wells",
            "geometryType": "esriGeometryPoint"
        }))
        .unwrap();
        assert_eq!(layer.object_id_field, "db_id");
        assert_eq!(layer.geometry_field, "dbasin_geom");
        assert_eq!(layer.srid, 3857);
        assert!(layer.time_field().is_none());
    }

    #[test]
    fn feature_omits_empty_geometry_and_related() {
        let mut feature = Feature::default();
        feature
            .attributes
            .insert("db_id".into(), serde_json::json!(1));
        let value = serde_json::to_value(&feature).unwrap();
        assert_eq!(value, serde_json::json!({"attributes": {"db_id": 1}}));
    }
}
