use super::sql::{qualified, quote_ident, CompiledQuery};
use crate::catalog::{EsriFieldType, Field, LayerCatalog};
use crate::config::AppConfig;
use crate::error::{Result, ServiceError};
use crate::models::{Extent, GeometryType, Layer, Service, SpatialReference, WEB_MERCATOR_SRID};
use diesel::deserialize::QueryableByName;
use diesel::sql_types::{BigInt, Double, Nullable};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

pub const CURRENT_VERSION: f64 = 10.2;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerSummary {
    pub id: i32,
    pub name: String,
    pub min_scale: i32,
    pub max_scale: i32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub current_version: f64,
    pub service_description: String,
    pub description: String,
    pub copyright_text: String,
    pub capabilities: &'static str,
    pub supported_query_formats: &'static str,
    pub supports_advanced_queries: bool,
    pub has_versioned_data: bool,
    pub supports_disconnected_editing: bool,
    pub max_record_count: i64,
    pub units: String,
    pub spatial_reference: SpatialReference,
    pub initial_extent: Extent,
    pub full_extent: Extent,
    pub allow_geometry_updates: bool,
    pub layers: Vec<LayerSummary>,
}

impl ServiceInfo {
    pub fn describe(service: &Service, config: &AppConfig) -> Self {
        let mut layers: Vec<LayerSummary> = service
            .layers
            .iter()
            .map(|layer| LayerSummary {
                id: layer.id,
                name: layer.name.clone(),
                min_scale: 0,
                max_scale: 0,
            })
            .collect();
        layers.sort_by_key(|layer| layer.id);

        Self {
            current_version: CURRENT_VERSION,
            service_description: String::new(),
            description: service.description.clone(),
            copyright_text: service.copyright_text.clone(),
            capabilities: "Query,Editing",
            supported_query_formats: "JSON, CSV",
            supports_advanced_queries: true,
            has_versioned_data: false,
            supports_disconnected_editing: false,
            max_record_count: config.max_limit,
            units: service.units.clone(),
            spatial_reference: service.spatial_reference,
            initial_extent: service.initial_extent,
            full_extent: service.full_extent,
            allow_geometry_updates: service.allow_geometry_updates,
            layers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedFieldInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: EsriFieldType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelatedTableInfo {
    pub name: String,
    pub fields: Vec<RelatedFieldInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerTimeInfo {
    pub start_time_field: String,
    pub time_extent: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_interval: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_interval_units: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerInfo {
    pub current_version: f64,
    pub id: i32,
    pub name: String,
    #[serde(rename = "type")]
    pub layer_type: &'static str,
    pub description: String,
    pub geometry_type: GeometryType,
    pub object_id_field: String,
    pub global_id_field: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_field: Option<String>,
    pub capabilities: &'static str,
    pub supports_advanced_queries: bool,
    pub supported_query_formats: &'static str,
    pub has_attachments: bool,
    pub html_popup_type: &'static str,
    pub max_record_count: i64,
    pub min_scale: i32,
    pub max_scale: i32,
    pub types: Vec<Value>,
    pub templates: Vec<Value>,
    pub fields: Vec<Field>,
    pub related_tables: Vec<RelatedTableInfo>,
    pub extent: Extent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drawing_info: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_info: Option<LayerTimeInfo>,
}

impl LayerInfo {
    pub fn describe(
        layer: &Layer,
        catalog: &LayerCatalog,
        extent: Extent,
        time_extent: Option<[i64; 2]>,
        config: &AppConfig,
    ) -> Self {
        let related_tables = catalog
            .related
            .iter()
            .map(|related| RelatedTableInfo {
                name: related.relation.related_title.clone(),
                fields: related
                    .fields
                    .iter()
                    .map(|field| RelatedFieldInfo {
                        name: field.name.clone(),
                        field_type: field.field_type,
                        relates_to: field.relates_to.clone(),
                    })
                    .collect(),
            })
            .collect();

        let time_info = layer.time_info.as_ref().map(|info| LayerTimeInfo {
            start_time_field: info.start_time_field.clone(),
            time_extent: time_extent.map(Vec::from).unwrap_or_default(),
            time_interval: info.time_interval,
            time_interval_units: info.time_interval_units.clone(),
        });

        Self {
            current_version: CURRENT_VERSION,
            id: layer.id,
            name: layer.name.clone(),
            layer_type: "Feature Layer",
            description: layer.description.clone(),
            geometry_type: layer.geometry_type,
            object_id_field: layer.object_id_field.clone(),
            global_id_field: layer.object_id_field.clone(),
            display_field: layer.display_field.clone(),
            capabilities: "Query,Editing",
            supports_advanced_queries: true,
            supported_query_formats: "JSON, CSV",
            has_attachments: false,
            html_popup_type: "esriServerHTMLPopupTypeNone",
            max_record_count: config.max_limit,
            min_scale: 0,
            max_scale: 0,
            types: Vec::new(),
            templates: Vec::new(),
            fields: catalog.fields.clone(),
            related_tables,
            extent,
            drawing_info: layer.drawing_info.clone(),
            time_info,
        }
    }
}

#[derive(Debug, QueryableByName)]
struct ExtentRow {
    #[diesel(sql_type = Nullable<Double>)]
    xmin: Option<f64>,
    #[diesel(sql_type = Nullable<Double>)]
    ymin: Option<f64>,
    #[diesel(sql_type = Nullable<Double>)]
    xmax: Option<f64>,
    #[diesel(sql_type = Nullable<Double>)]
    ymax: Option<f64>,
}

#[derive(Debug, QueryableByName)]
struct TimeBoundsRow {
    #[diesel(sql_type = Nullable<BigInt>)]
    min_ms: Option<i64>,
    #[diesel(sql_type = Nullable<BigInt>)]
    max_ms: Option<i64>,
}

fn extent_query(layer: &Layer) -> CompiledQuery {
    CompiledQuery {
        sql: format!(
            "SELECT ST_XMin(b) AS xmin, ST_YMin(b) AS ymin, ST_XMax(b) AS xmax, ST_YMax(b) AS ymax \
             FROM (SELECT ST_Expand(CAST(ST_Extent(ST_Transform({}, {WEB_MERCATOR_SRID})) AS box2d), 1000) AS b \
             FROM {}) AS e",
            quote_ident(&layer.geometry_field),
            quote_ident(&layer.table)
        ),
        params: Vec::new(),
    }
}

fn time_bounds_query(layer: &Layer, time_field: &str) -> CompiledQuery {
    let column = qualified(&layer.table, time_field);
    CompiledQuery {
        sql: format!(
            "SELECT (EXTRACT(EPOCH FROM MIN({column})::timestamp) * 1000)::bigint AS min_ms, \
             (EXTRACT(EPOCH FROM MAX({column})::timestamp) * 1000)::bigint AS max_ms FROM {}",
            quote_ident(&layer.table)
        ),
        params: Vec::new(),
    }
}

/// Data extent in Web Mercator padded by a kilometre, or the world when
/// the table is empty or the extent cannot be computed.
pub async fn layer_extent(conn: &mut AsyncPgConnection, layer: &Layer) -> Extent {
    let rows: std::result::Result<Vec<ExtentRow>, _> =
        extent_query(layer).into_boxed().load(conn).await;
    match rows {
        Ok(rows) => match rows.into_iter().next() {
            Some(ExtentRow {
                xmin: Some(xmin),
                ymin: Some(ymin),
                xmax: Some(xmax),
                ymax: Some(ymax),
            }) => Extent {
                xmin,
                ymin,
                xmax,
                ymax,
                spatial_reference: SpatialReference::default(),
            },
            _ => Extent::global(),
        },
        Err(err) => {
            warn!(error = %err, table = %layer.table, "extent query failed; using global extent");
            Extent::global()
        }
    }
}

pub async fn time_extent(conn: &mut AsyncPgConnection, layer: &Layer) -> Result<Option<[i64; 2]>> {
    let Some(time_field) = layer.time_field() else {
        return Ok(None);
    };
    let rows: Vec<TimeBoundsRow> = time_bounds_query(layer, time_field)
        .into_boxed()
        .load(conn)
        .await
        .map_err(ServiceError::from_database)?;
    Ok(rows.into_iter().next().and_then(|row| match (row.min_ms, row.max_ms) {
        (Some(min), Some(max)) => Some([min, max]),
        _ => None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fixtures::{related_wells_catalog, timed_wells_catalog};
    use crate::config::test_config;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn extent_sql_pads_and_projects() {
        let (layer, _) = related_wells_catalog();
        assert_eq!(
            extent_query(&layer).sql,
            "SELECT ST_XMin(b) AS xmin, ST_YMin(b) AS ymin, ST_XMax(b) AS xmax, ST_YMax(b) AS ymax \
             FROM (SELECT ST_Expand(CAST(ST_Extent(ST_Transform(\"dbasin_geom\", 3857)) AS box2d), 1000) AS b \
             FROM \"db_wells\") AS e"
        );
    }

    #[test]
    fn time_bounds_read_epoch_millis() {
        let (layer, _) = timed_wells_catalog();
        let sql = time_bounds_query(&layer, "drilled").sql;
        assert!(sql.contains("MIN(\"db_wells\".\"drilled\")::timestamp) * 1000)::bigint AS min_ms"));
        assert!(sql.ends_with("FROM \"db_wells\""));
    }

    #[test]
    fn layer_info_lists_related_tables_and_time() {
        let (mut layer, catalog) = related_wells_catalog();
        layer.time_info = timed_wells_catalog().0.time_info;
        let info = LayerInfo::describe(
            &layer,
            &catalog,
            Extent::global(),
            Some([1, 2]),
            &test_config(),
        );
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["objectIdField"], json!("db_id"));
        assert_eq!(value["geometryType"], json!("esriGeometryPoint"));
        assert_eq!(value["relatedTables"][0]["name"], json!("samples"));
        assert_eq!(
            value["relatedTables"][0]["fields"][1],
            json!({"name": "samples.site_id", "type": "esriFieldTypeInteger", "relatesTo": "site_id"})
        );
        assert_eq!(value["timeInfo"]["timeExtent"], json!([1, 2]));
        assert_eq!(value["fields"][0]["type"], json!("esriFieldTypeOID"));
    }

    #[test]
    fn service_info_sorts_layers() {
        let (mut first, _) = related_wells_catalog();
        first.id = 2;
        let (second, _) = timed_wells_catalog();
        let service: Service = serde_json::from_value(json!({"id": "svc", "layers": []})).unwrap();
        let service = Service {
            layers: vec![first, second],
            ..service
        };
        let info = ServiceInfo::describe(&service, &test_config());
        let ids: Vec<i32> = info.layers.iter().map(|layer| layer.id).collect();
        assert_eq!(ids, vec![0, 2]);
        assert_eq!(info.full_extent, Extent::global());
    }
}
