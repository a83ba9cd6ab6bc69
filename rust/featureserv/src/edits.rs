use crate::catalog::{Field, LayerCatalog};
use crate::error::{Result, ServiceError};
use crate::geometry::{esri_to_ewkt, EsriGeometry};
use crate::models::{Attributes, Feature, Layer};
use crate::query::metadata;
use crate::query::sql::{quote_ident, BindKind, CompiledQuery, SqlBindValue, SqlWriter};
use crate::time::parse_date_value;
use diesel::deserialize::QueryableByName;
use diesel::sql_types::BigInt;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Code ArcGIS clients expect on a failed edit.
pub const EDIT_FAILURE_CODE: i32 = -999_999;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EditParams {
    pub adds: Option<String>,
    pub updates: Option<String>,
    pub deletes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EditBatch {
    pub adds: Vec<Feature>,
    pub updates: Vec<Feature>,
    pub deletes: Vec<i64>,
}

impl EditParams {
    pub fn into_batch(self) -> Result<EditBatch> {
        Ok(EditBatch {
            adds: parse_features("adds", self.adds.as_deref())?,
            updates: parse_features("updates", self.updates.as_deref())?,
            deletes: crate::query::params::parse_object_ids(self.deletes.as_deref())?,
        })
    }
}

fn parse_features(name: &str, raw: Option<&str>) -> Result<Vec<Feature>> {
    match raw.map(str::trim).filter(|raw| !raw.is_empty()) {
        None => Ok(Vec::new()),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|err| ServiceError::InvalidRequest(format!("invalid {name}: {err}"))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EditError {
    pub code: i32,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<i64>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EditError>,
}

impl EditResult {
    fn from_outcome(outcome: Result<i64>) -> Self {
        match outcome {
            Ok(object_id) => Self {
                object_id: Some(object_id),
                success: true,
                error: None,
            },
            Err(err) => Self {
                object_id: None,
                success: false,
                error: Some(EditError {
                    code: EDIT_FAILURE_CODE,
                    description: err.to_string(),
                }),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyEditsResponse {
    pub add_results: Vec<EditResult>,
    pub update_results: Vec<EditResult>,
    pub delete_results: Vec<EditResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_time_extent: Option<[i64; 2]>,
}

#[derive(Debug, QueryableByName)]
struct InsertedRow {
    #[diesel(sql_type = BigInt)]
    object_id: i64,
}

pub fn bind_value(field: &Field, value: &Value) -> Result<SqlBindValue> {
    let kind = bind_kind(&field.native_type);
    if value.is_null() {
        return Ok(SqlBindValue::Null(kind));
    }

    let mismatch = || {
        ServiceError::InvalidRequest(format!(
            "value {value} does not fit column '{}' ({})",
            field.name, field.native_type
        ))
    };

    Ok(match kind {
        BindKind::Int => SqlBindValue::Int(
            integer_value(value)
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(mismatch)?,
        ),
        BindKind::BigInt => SqlBindValue::BigInt(integer_value(value).ok_or_else(mismatch)?),
        BindKind::Float => SqlBindValue::Float(match value {
            Value::Number(number) => number.as_f64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(mismatch)?),
        BindKind::Bool => SqlBindValue::Bool(match value {
            Value::Bool(flag) => Some(*flag),
            Value::Number(number) => number.as_i64().map(|v| v != 0),
            Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
        .ok_or_else(mismatch)?),
        BindKind::Timestamp => SqlBindValue::Timestamp(parse_date_value(value)?),
        BindKind::Text => SqlBindValue::Text(match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }),
    })
}

fn bind_kind(native_type: &str) -> BindKind {
    match native_type {
        "integer" | "smallint" => BindKind::Int,
        "bigint" => BindKind::BigInt,
        "double precision" | "real" | "numeric" => BindKind::Float,
        "boolean" => BindKind::Bool,
        "date" | "timestamp without time zone" | "timestamp with time zone" => {
            BindKind::Timestamp
        }
        _ => BindKind::Text,
    }
}

fn integer_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|v| v.fract() == 0.0).map(|v| v as i64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn insertable_fields<'a>(layer: &Layer, catalog: &'a LayerCatalog) -> Vec<&'a Field> {
    catalog
        .fields
        .iter()
        .filter(|field| field.name != layer.object_id_field && field.name != layer.geometry_field)
        .collect()
}

pub fn insert_statement(
    layer: &Layer,
    catalog: &LayerCatalog,
    attributes: &Attributes,
) -> Result<CompiledQuery> {
    let fields = insertable_fields(layer, catalog);

    let unknown: Vec<String> = attributes
        .keys()
        .filter(|key| !fields.iter().any(|field| &field.name == *key))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        return Err(ServiceError::unknown_attributes(unknown));
    }
    let missing: Vec<String> = fields
        .iter()
        .filter(|field| !attributes.contains_key(&field.name))
        .map(|field| field.name.clone())
        .collect();
    if !missing.is_empty() {
        return Err(ServiceError::missing_attributes(missing));
    }

    let mut sql = SqlWriter::new();
    sql.push("INSERT INTO ").push(&quote_ident(&layer.table));
    if fields.is_empty() {
        sql.push(" DEFAULT VALUES");
    } else {
        let columns: Vec<String> = fields.iter().map(|field| quote_ident(&field.name)).collect();
        let mut placeholders = Vec::with_capacity(fields.len());
        for field in &fields {
            placeholders.push(sql.bind(bind_value(field, &attributes[&field.name])?));
        }
        sql.push(&format!(
            " ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        ));
    }
    sql.push(&format!(
        " RETURNING {}::bigint AS object_id",
        quote_ident(&layer.object_id_field)
    ));
    Ok(sql.finish())
}

pub fn update_statement(
    layer: &Layer,
    catalog: &LayerCatalog,
    attributes: &Attributes,
) -> Result<(i64, Option<CompiledQuery>)> {
    let object_id = attributes
        .get(&layer.object_id_field)
        .filter(|value| !value.is_null())
        .ok_or_else(|| ServiceError::missing_attributes(vec![layer.object_id_field.clone()]))
        .and_then(|value| {
            integer_value(value).ok_or_else(|| {
                ServiceError::InvalidRequest(format!("invalid object id {value}"))
            })
        })?;

    let mut assignments = Vec::new();
    let mut unknown = Vec::new();
    for (key, value) in attributes {
        if key == &layer.object_id_field || key == &layer.geometry_field {
            continue;
        }
        match catalog.field(key) {
            Some(field) => assignments.push((field, value)),
            None => unknown.push(key.clone()),
        }
    }
    if !unknown.is_empty() {
        return Err(ServiceError::unknown_attributes(unknown));
    }
    if assignments.is_empty() {
        return Ok((object_id, None));
    }

    let mut sql = SqlWriter::new();
    sql.push("UPDATE ").push(&quote_ident(&layer.table)).push(" SET ");
    for (index, (field, value)) in assignments.into_iter().enumerate() {
        if index > 0 {
            sql.push(", ");
        }
        let bind = bind_value(field, value)?;
        sql.push(&quote_ident(&field.name)).push(" = ").push_bind(bind);
    }
    sql.push(" WHERE ")
        .push(&quote_ident(&layer.object_id_field))
        .push(" = ")
        .push_bind(SqlBindValue::BigInt(object_id));
    Ok((object_id, Some(sql.finish())))
}

pub fn geometry_statement(
    layer: &Layer,
    geometry: &EsriGeometry,
    object_id: i64,
) -> Result<CompiledQuery> {
    let ewkt = esri_to_ewkt(geometry, layer.geometry_type)?;
    let mut sql = SqlWriter::new();
    sql.push("UPDATE ")
        .push(&quote_ident(&layer.table))
        .push(" SET ")
        .push(&quote_ident(&layer.geometry_field))
        .push(" = ST_Transform(ST_GeomFromEWKT(")
        .push_bind(SqlBindValue::Text(ewkt))
        .push("), ")
        .push_bind(SqlBindValue::Int(layer.srid))
        .push(") WHERE ")
        .push(&quote_ident(&layer.object_id_field))
        .push(" = ")
        .push_bind(SqlBindValue::BigInt(object_id));
    Ok(sql.finish())
}

pub fn delete_statement(layer: &Layer, object_id: i64) -> CompiledQuery {
    let mut sql = SqlWriter::new();
    sql.push("DELETE FROM ")
        .push(&quote_ident(&layer.table))
        .push(" WHERE ")
        .push(&quote_ident(&layer.object_id_field))
        .push(" = ")
        .push_bind(SqlBindValue::BigInt(object_id));
    sql.finish()
}

pub async fn add_feature(
    conn: &mut AsyncPgConnection,
    layer: &Layer,
    catalog: &LayerCatalog,
    feature: &Feature,
) -> Result<i64> {
    let insert = insert_statement(layer, catalog, &feature.attributes)?;
    let geometry = feature.geometry.clone();

    let object_id = conn
        .transaction::<_, ServiceError, _>(|conn| {
            async move {
                let insert_sql = insert.sql.clone();
                let row: InsertedRow = insert
                    .into_boxed()
                    .get_result(conn)
                    .await
                    .map_err(|err| ServiceError::from_statement(err, &insert_sql))?;
                if let Some(geometry) = geometry {
                    let update = geometry_statement(layer, &geometry, row.object_id)?;
                    let update_sql = update.sql.clone();
                    update
                        .into_boxed()
                        .execute(conn)
                        .await
                        .map_err(|err| ServiceError::from_statement(err, &update_sql))?;
                }
                Ok(row.object_id)
            }
            .scope_boxed()
        })
        .await?;

    debug!(table = %layer.table, object_id, "feature added");
    Ok(object_id)
}

pub async fn update_feature(
    conn: &mut AsyncPgConnection,
    layer: &Layer,
    catalog: &LayerCatalog,
    feature: &Feature,
) -> Result<i64> {
    let (object_id, update) = update_statement(layer, catalog, &feature.attributes)?;
    let geometry = feature
        .geometry
        .as_ref()
        .map(|geometry| geometry_statement(layer, geometry, object_id))
        .transpose()?;

    conn.transaction::<_, ServiceError, _>(|conn| {
        async move {
            for statement in update.into_iter().chain(geometry) {
                let sql = statement.sql.clone();
                statement
                    .into_boxed()
                    .execute(conn)
                    .await
                    .map_err(|err| ServiceError::from_statement(err, &sql))?;
            }
            Ok(())
        }
        .scope_boxed()
    })
    .await?;

    debug!(table = %layer.table, object_id, "feature updated");
    Ok(object_id)
}

pub async fn delete_feature(
    conn: &mut AsyncPgConnection,
    layer: &Layer,
    object_id: i64,
) -> Result<i64> {
    let affected = delete_statement(layer, object_id)
        .into_boxed()
        .execute(conn)
        .await?;
    if affected == 0 {
        return Err(ServiceError::NotFound(format!(
            "feature {object_id} in '{}'",
            layer.name
        )));
    }
    debug!(table = %layer.table, object_id, "feature deleted");
    Ok(object_id)
}

/// Runs every item on its own; one failure never stops the rest.
pub async fn apply_edits(
    conn: &mut AsyncPgConnection,
    layer: &Layer,
    catalog: &LayerCatalog,
    batch: EditBatch,
) -> Result<ApplyEditsResponse> {
    let time_before = metadata::time_extent(conn, layer).await?;

    let mut add_results = Vec::with_capacity(batch.adds.len());
    for feature in &batch.adds {
        add_results.push(EditResult::from_outcome(
            add_feature(conn, layer, catalog, feature).await,
        ));
    }
    let mut update_results = Vec::with_capacity(batch.updates.len());
    for feature in &batch.updates {
        update_results.push(EditResult::from_outcome(
            update_feature(conn, layer, catalog, feature).await,
        ));
    }
    let mut delete_results = Vec::with_capacity(batch.deletes.len());
    for object_id in &batch.deletes {
        delete_results.push(EditResult::from_outcome(
            delete_feature(conn, layer, *object_id).await,
        ));
    }

    let failures = add_results
        .iter()
        .chain(&update_results)
        .chain(&delete_results)
        .filter(|result| !result.success)
        .count();
    if failures > 0 {
        warn!(layer = %layer.name, failures, "some edits failed");
    }

    let time_after = metadata::time_extent(conn, layer).await?;
    Ok(ApplyEditsResponse {
        add_results,
        update_results,
        delete_results,
        new_time_extent: changed_extent(time_before, time_after),
    })
}

fn changed_extent(before: Option<[i64; 2]>, after: Option<[i64; 2]>) -> Option<[i64; 2]> {
    match after {
        Some(extent) if before != after => Some(extent),
        _ => None,
    }
}
