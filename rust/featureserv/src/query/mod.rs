mod assembler;
pub mod compiler;
mod export;
pub mod metadata;
pub mod params;
pub mod renderer;
pub mod sql;

pub use assembler::assemble;
pub use compiler::{compile, expand_fields, OrderByField, QueryRequest, SortDirection};
pub use params::QueryParams;

use crate::{
    catalog::{CatalogSession, Field, LayerCatalog},
    config::AppConfig,
    db::{self, PgPool},
    edits::{self, ApplyEditsResponse, EditParams},
    error::{Result, ServiceError},
    geometry::wkt_to_esri,
    models::{Attributes, Feature, GeometryType, Layer, SpatialReference, GEOMETRY_OUTPUT_COLUMN},
    registry::Registry,
};
use diesel::deserialize::QueryableByName;
use diesel::sql_types::Jsonb;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use metadata::{LayerInfo, ServiceInfo};
use renderer::{ClassificationDef, Renderer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sql::{quote_ident, CompiledQuery};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, QueryableByName)]
pub(crate) struct JsonRow {
    #[diesel(sql_type = Jsonb)]
    pub(crate) row: Value,
}

pub(crate) async fn load_json_rows(
    conn: &mut AsyncPgConnection,
    query: CompiledQuery,
) -> Result<Vec<Attributes>> {
    let query = query.as_json_rows();
    let sql = query.sql.clone();
    let rows: Vec<JsonRow> = query
        .into_boxed()
        .load(conn)
        .await
        .map_err(|err| ServiceError::from_statement(err, &sql))?;
    Ok(rows
        .into_iter()
        .filter_map(|row| match row.row {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub data: Vec<Attributes>,
    pub exceeded_limit: bool,
}

impl QueryResult {
    /// Drops the extra row fetched beyond `limit`.
    fn truncated(mut data: Vec<Attributes>, limit: Option<i64>) -> Self {
        let exceeded_limit = match limit {
            Some(limit) if data.len() as i64 > limit => {
                data.truncate(limit as usize);
                true
            }
            _ => false,
        };
        Self {
            data,
            exceeded_limit,
        }
    }
}

pub async fn perform_query(
    conn: &mut AsyncPgConnection,
    layer: &Layer,
    catalog: &LayerCatalog,
    request: &QueryRequest,
) -> Result<QueryResult> {
    let compiled = compile(layer, catalog, request)?;
    debug!(
        layer = %layer.name,
        sql = %compiled.sql,
        params = compiled.params.len(),
        "executing feature query"
    );
    let rows = load_json_rows(conn, compiled).await?;
    Ok(QueryResult::truncated(rows, request.page_limit()))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdsResponse {
    pub count: usize,
    pub exceeded_transfer_limit: bool,
    pub object_id_field_name: String,
    pub object_ids: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureSet {
    pub count: usize,
    pub exceeded_transfer_limit: bool,
    pub fields: Vec<Field>,
    pub geometry_type: GeometryType,
    pub spatial_reference: SpatialReference,
    pub features: Vec<Feature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_fields: Option<BTreeMap<String, Vec<Field>>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum QueryResponse {
    Ids(IdsResponse),
    Count(Attributes),
    Features(FeatureSet),
}

#[derive(Debug, Clone)]
pub enum QueryOutput {
    Json(QueryResponse),
    Csv(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeQueryResponse {
    pub count: usize,
    pub fields: Vec<Field>,
    pub geometry_type: GeometryType,
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RendererParams {
    pub classification_def: Option<String>,
    #[serde(rename = "where")]
    pub where_clause: Option<String>,
}

fn build_query_response(
    layer: &Layer,
    catalog: &LayerCatalog,
    request: &QueryRequest,
    spatial_reference: SpatialReference,
    result: QueryResult,
) -> Result<QueryResponse> {
    if request.ids_only {
        let object_ids: Vec<Value> = result
            .data
            .iter()
            .filter_map(|row| row.get(&layer.object_id_field).cloned())
            .collect();
        return Ok(QueryResponse::Ids(IdsResponse {
            count: object_ids.len(),
            exceeded_transfer_limit: result.exceeded_limit,
            object_id_field_name: layer.object_id_field.clone(),
            object_ids,
        }));
    }

    if request.count_only {
        let row = result.data.into_iter().next().unwrap_or_default();
        return Ok(QueryResponse::Count(row));
    }

    let has_related_columns = result
        .data
        .as_slice()
        .first()
        .is_some_and(|row| row.keys().any(|key| key.contains('.')));
    let related_fields = (request.include_related() && has_related_columns).then(|| {
        catalog
            .related
            .iter()
            .map(|related| (related.relation.related_title.clone(), related.fields.clone()))
            .collect()
    });

    let features = assemble(result.data, layer)?;
    Ok(QueryResponse::Features(FeatureSet {
        count: features.len(),
        exceeded_transfer_limit: result.exceeded_limit,
        fields: catalog.fields.clone(),
        geometry_type: layer.geometry_type,
        spatial_reference,
        features,
        related_fields,
    }))
}

fn time_query_sql(layer: &Layer) -> CompiledQuery {
    let geometry = format!(
        "ST_AsText(ST_Transform({}, {}))",
        quote_ident(&layer.geometry_field),
        crate::models::WEB_MERCATOR_SRID
    );
    CompiledQuery {
        sql: format!(
            "SELECT {geometry} AS {}, COUNT(0) AS \"count\" FROM {} GROUP BY 1",
            quote_ident(GEOMETRY_OUTPUT_COLUMN),
            quote_ident(&layer.table)
        ),
        params: Vec::new(),
    }
}

fn count_features(rows: Vec<Attributes>) -> Result<Vec<Feature>> {
    rows.into_iter()
        .map(|mut row| -> Result<Feature> {
            let geometry = match row.remove(GEOMETRY_OUTPUT_COLUMN) {
                Some(Value::String(text)) => Some(wkt_to_esri(&text)?),
                _ => None,
            };
            Ok(Feature {
                attributes: row,
                geometry,
                related: BTreeMap::new(),
            })
        })
        .collect()
}

#[derive(Clone)]
pub struct QueryEngine {
    pool: PgPool,
    config: Arc<AppConfig>,
    registry: Arc<Registry>,
}

impl QueryEngine {
    pub fn new(pool: PgPool, config: Arc<AppConfig>, registry: Arc<Registry>) -> Self {
        Self {
            pool,
            config,
            registry,
        }
    }

    pub fn service_info(&self, service_id: &str) -> Result<ServiceInfo> {
        let service = self.registry.service(service_id)?;
        Ok(ServiceInfo::describe(service, &self.config))
    }

    pub async fn layer_info(&self, service_id: &str, layer_id: i32) -> Result<LayerInfo> {
        let (_, layer) = self.registry.layer(service_id, layer_id)?;
        let mut conn = db::checkout(&self.pool).await?;
        let catalog = CatalogSession::new().layer_catalog(&mut conn, layer).await?;
        let extent = metadata::layer_extent(&mut conn, layer).await;
        let time_extent = metadata::time_extent(&mut conn, layer).await?;
        Ok(LayerInfo::describe(
            layer,
            &catalog,
            extent,
            time_extent,
            &self.config,
        ))
    }

    pub async fn query(
        &self,
        service_id: &str,
        layer_id: i32,
        params: &QueryParams,
    ) -> Result<QueryOutput> {
        let (service, layer) = self.registry.layer(service_id, layer_id)?;
        let csv = params.wants_csv();
        let mut request = params.to_request(&self.config)?;
        if csv {
            // Only feature rows have a CSV form.
            request.ids_only = false;
            request.count_only = false;
        }

        let mut conn = db::checkout(&self.pool).await?;
        let catalog = CatalogSession::new().layer_catalog(&mut conn, layer).await?;
        let result = perform_query(&mut conn, layer, &catalog, &request).await?;
        debug!(
            service = %service.id,
            layer = layer.id,
            rows = result.data.len(),
            exceeded = result.exceeded_limit,
            "query complete"
        );

        if csv {
            let text = export::rows_to_csv(&result.data, layer.geometry_type, request.offset == 0)?;
            return Ok(QueryOutput::Csv(text));
        }
        let response =
            build_query_response(layer, &catalog, &request, service.spatial_reference, result)?;
        Ok(QueryOutput::Json(response))
    }

    pub async fn time_query(&self, service_id: &str, layer_id: i32) -> Result<TimeQueryResponse> {
        let (_, layer) = self.registry.layer(service_id, layer_id)?;
        if layer.time_field().is_none() {
            return Err(ServiceError::InvalidRequest(format!(
                "layer {} is not time enabled",
                layer.id
            )));
        }

        let mut conn = db::checkout(&self.pool).await?;
        let rows = load_json_rows(&mut conn, time_query_sql(layer)).await?;
        let features = count_features(rows)?;
        let mut count_field = Field::new("count", "integer", false);
        count_field.editable = false;

        Ok(TimeQueryResponse {
            count: features.len(),
            fields: vec![count_field],
            geometry_type: layer.geometry_type,
            features,
        })
    }

    pub async fn apply_edits(
        &self,
        service_id: &str,
        layer_id: i32,
        params: EditParams,
    ) -> Result<ApplyEditsResponse> {
        let (_, layer) = self.registry.layer(service_id, layer_id)?;
        let batch = params.into_batch()?;
        let mut conn = db::checkout(&self.pool).await?;
        let catalog = CatalogSession::new().layer_catalog(&mut conn, layer).await?;
        edits::apply_edits(&mut conn, layer, &catalog, batch).await
    }

    pub async fn generate_renderer(
        &self,
        service_id: &str,
        layer_id: i32,
        params: &RendererParams,
    ) -> Result<Renderer> {
        let (_, layer) = self.registry.layer(service_id, layer_id)?;
        let raw = params
            .classification_def
            .as_deref()
            .ok_or_else(|| ServiceError::InvalidRequest("Missing classificationDef parameter".into()))?;
        let definition = ClassificationDef::parse(raw)?;

        let mut conn = db::checkout(&self.pool).await?;
        let catalog = CatalogSession::new().layer_catalog(&mut conn, layer).await?;
        renderer::generate_renderer(
            &mut conn,
            layer,
            &catalog,
            &definition,
            params.where_clause.as_deref(),
        )
        .await
    }
}
