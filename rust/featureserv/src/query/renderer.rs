use super::sql::{qualified, quote_ident, CompiledQuery, SqlWriter};
use super::load_json_rows;
use crate::catalog::{EsriFieldType, LayerCatalog};
use crate::classify;
use crate::error::{Result, ServiceError};
use crate::models::{Layer, SOURCE_ALIAS};
use crate::where_clause;
use diesel_async::AsyncPgConnection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassificationMethod {
    #[serde(rename = "esriClassifyEqualInterval")]
    EqualInterval,
    #[serde(rename = "esriClassifyQuantile")]
    Quantile,
    #[serde(rename = "esriClassifyNaturalBreaks")]
    NaturalBreaks,
}

const fn default_break_count() -> usize {
    5
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ClassificationDef {
    #[serde(rename = "uniqueValueDef", rename_all = "camelCase")]
    UniqueValue { unique_value_fields: Vec<String> },
    #[serde(rename = "classBreaksDef", rename_all = "camelCase")]
    ClassBreaks {
        classification_field: String,
        #[serde(default = "default_method")]
        classification_method: ClassificationMethod,
        #[serde(default = "default_break_count")]
        break_count: usize,
    },
}

const fn default_method() -> ClassificationMethod {
    ClassificationMethod::EqualInterval
}

impl ClassificationDef {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|err| ServiceError::InvalidRequest(format!("invalid classificationDef: {err}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UniqueValueInfo {
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassBreakInfo {
    pub class_min_value: f64,
    pub class_max_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Renderer {
    #[serde(rename = "uniqueValue", rename_all = "camelCase")]
    UniqueValue {
        field1: String,
        unique_value_infos: Vec<UniqueValueInfo>,
    },
    #[serde(rename = "classBreaks", rename_all = "camelCase")]
    ClassBreaks {
        field: String,
        classification_method: ClassificationMethod,
        min_value: f64,
        class_break_infos: Vec<ClassBreakInfo>,
    },
}

pub async fn generate_renderer(
    conn: &mut AsyncPgConnection,
    layer: &Layer,
    catalog: &LayerCatalog,
    definition: &ClassificationDef,
    where_raw: Option<&str>,
) -> Result<Renderer> {
    match definition {
        ClassificationDef::UniqueValue {
            unique_value_fields,
        } => {
            let field = unique_value_fields
                .first()
                .ok_or_else(|| {
                    ServiceError::InvalidRequest("uniqueValueFields must not be empty".into())
                })?
                .clone();
            let query = values_query(layer, catalog, &field, where_raw, true)?;
            let values = load_values(conn, query).await?;
            Ok(Renderer::UniqueValue {
                field1: field,
                unique_value_infos: values
                    .into_iter()
                    .map(|value| UniqueValueInfo { value })
                    .collect(),
            })
        }
        ClassificationDef::ClassBreaks {
            classification_field,
            classification_method,
            break_count,
        } => {
            match catalog.field(classification_field).map(|field| field.field_type) {
                Some(EsriFieldType::Integer | EsriFieldType::SmallInteger | EsriFieldType::Double) => {}
                Some(_) => {
                    return Err(ServiceError::InvalidRequest(format!(
                        "field '{classification_field}' is not numeric"
                    )))
                }
                None => return Err(ServiceError::invalid_fields([classification_field.clone()])),
            }

            let query = values_query(layer, catalog, classification_field, where_raw, false)?;
            let values: Vec<f64> = load_values(conn, query)
                .await?
                .iter()
                .filter_map(Value::as_f64)
                .collect();
            debug!(field = %classification_field, values = values.len(), "classifying");

            let breaks = compute_breaks(&values, *classification_method, *break_count);
            Ok(class_breaks_renderer(
                classification_field,
                *classification_method,
                &breaks,
            ))
        }
    }
}

pub fn compute_breaks(sorted: &[f64], method: ClassificationMethod, count: usize) -> Vec<f64> {
    match (method, sorted.first(), sorted.last()) {
        (_, None, _) | (_, _, None) => Vec::new(),
        (ClassificationMethod::EqualInterval, Some(min), Some(max)) => {
            classify::equal_interval(*min, *max, count)
        }
        (ClassificationMethod::Quantile, _, _) => classify::quantile(sorted, count),
        (ClassificationMethod::NaturalBreaks, _, _) => {
            let sample = classify::sample_evenly(sorted, classify::MAX_JENKS_SAMPLE);
            classify::natural_breaks(&sample, count)
        }
    }
}

pub fn class_breaks_renderer(field: &str, method: ClassificationMethod, breaks: &[f64]) -> Renderer {
    Renderer::ClassBreaks {
        field: field.to_string(),
        classification_method: method,
        min_value: breaks.first().copied().unwrap_or_default(),
        class_break_infos: breaks
            .windows(2)
            .map(|pair| ClassBreakInfo {
                class_min_value: pair[0],
                class_max_value: pair[1],
            })
            .collect(),
    }
}

fn values_query(
    layer: &Layer,
    catalog: &LayerCatalog,
    field: &str,
    where_raw: Option<&str>,
    distinct: bool,
) -> Result<CompiledQuery> {
    catalog.validate_fields([field], false)?;
    if field == "*" || field == layer.geometry_field {
        return Err(ServiceError::invalid_fields([field.to_string()]));
    }
    let parsed = match where_raw {
        Some(raw) => where_clause::validate(raw, catalog, false)?,
        None => None,
    };

    let column = qualified(SOURCE_ALIAS, field);
    let mut sql = SqlWriter::new();
    sql.push("SELECT ");
    if distinct {
        sql.push("DISTINCT ");
    }
    sql.push(&format!(
        "{column} AS value FROM {} AS {} WHERE {column} IS NOT NULL",
        quote_ident(&layer.table),
        quote_ident(SOURCE_ALIAS)
    ));
    if let Some(parsed) = parsed {
        sql.push(" AND (").push(&parsed.rewritten).push(")");
    }
    sql.push(&format!(" ORDER BY {column}"));
    Ok(sql.finish())
}

async fn load_values(conn: &mut AsyncPgConnection, query: CompiledQuery) -> Result<Vec<Value>> {
    Ok(load_json_rows(conn, query)
        .await?
        .into_iter()
        .filter_map(|mut row| row.remove("value"))
        .collect())
}
