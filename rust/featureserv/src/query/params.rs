use super::compiler::{normalize_field, OrderByField, QueryRequest};
use crate::config::AppConfig;
use crate::error::{Result, ServiceError};
use crate::geometry::rings::CrossingNumber;
use crate::geometry::{esri_to_wkt, EsriGeometry, Envelope};
use crate::models::{SpatialReference, WEB_MERCATOR_SRID};
use crate::time::parse_time_param;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    #[serde(rename = "where")]
    pub where_clause: Option<String>,
    pub object_ids: Option<String>,
    pub geometry_type: Option<String>,
    pub geometry: Option<String>,
    pub time: Option<String>,
    pub out_fields: Option<String>,
    pub order_by_fields: Option<String>,
    pub return_ids_only: Option<String>,
    pub return_count_only: Option<String>,
    pub return_geometry: Option<String>,
    #[serde(rename = "outSR")]
    pub out_sr: Option<String>,
    #[serde(alias = "resultRecordCount")]
    pub limit: Option<String>,
    #[serde(alias = "resultOffset")]
    pub offset: Option<String>,
    /// Response format; `json` unless `csv`.
    pub f: Option<String>,
}

impl QueryParams {
    pub fn wants_csv(&self) -> bool {
        self.f
            .as_deref()
            .is_some_and(|format| format.trim().eq_ignore_ascii_case("csv"))
    }

    pub fn to_request(&self, config: &AppConfig) -> Result<QueryRequest> {
        let ids_only = parse_flag(self.return_ids_only.as_deref(), false);
        let count_only = parse_flag(self.return_count_only.as_deref(), false);
        let object_ids = parse_object_ids(self.object_ids.as_deref())?;

        let (limit, offset) = if ids_only || !object_ids.is_empty() {
            (0, 0)
        } else {
            let limit = parse_integer(self.limit.as_deref(), "limit")?;
            let offset = parse_integer(self.offset.as_deref(), "offset")?.unwrap_or(0);
            (config.effective_limit(limit), offset.max(0))
        };

        Ok(QueryRequest {
            return_fields: split_list(self.out_fields.as_deref())
                .map(normalize_field)
                .collect(),
            where_clause: non_blank(self.where_clause.as_deref()),
            order_by: split_list(self.order_by_fields.as_deref())
                .filter_map(OrderByField::parse)
                .collect(),
            object_ids,
            extent_wkt: parse_filter_geometry(
                self.geometry_type.as_deref(),
                self.geometry.as_deref(),
            )?,
            time: match self.time.as_deref() {
                Some(raw) => parse_time_param(raw)?,
                None => None,
            },
            out_srid: parse_out_sr(self.out_sr.as_deref())?,
            limit,
            offset,
            ids_only,
            count_only,
            return_geometry: parse_flag(self.return_geometry.as_deref(), true),
        })
    }
}

fn non_blank(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn split_list(raw: Option<&str>) -> impl Iterator<Item = &str> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
}

pub fn parse_flag(raw: Option<&str>, default: bool) -> bool {
    match raw.map(|value| value.trim().to_ascii_lowercase()) {
        Some(value) if value == "true" || value == "1" => true,
        Some(value) if value == "false" || value == "0" => false,
        _ => default,
    }
}

fn parse_integer(raw: Option<&str>, name: &str) -> Result<Option<i64>> {
    match non_blank(raw) {
        None => Ok(None),
        Some(value) => value.parse::<i64>().map(Some).map_err(|_| {
            ServiceError::InvalidRequest(format!("{name} must be an integer, got '{value}'"))
        }),
    }
}

pub fn parse_object_ids(raw: Option<&str>) -> Result<Vec<i64>> {
    split_list(raw)
        .map(|id| {
            id.parse::<i64>()
                .map_err(|_| ServiceError::InvalidRequest(format!("invalid object id '{id}'")))
        })
        .collect()
}

/// `outSR` may be a bare wkid or a spatial reference object.
fn parse_out_sr(raw: Option<&str>) -> Result<i32> {
    let Some(value) = non_blank(raw) else {
        return Ok(WEB_MERCATOR_SRID);
    };
    if let Ok(wkid) = value.parse::<i32>() {
        return Ok(wkid);
    }
    serde_json::from_str::<SpatialReference>(&value)
        .map(|sr| sr.wkid)
        .map_err(|_| ServiceError::InvalidRequest(format!("invalid outSR '{value}'")))
}

fn parse_filter_geometry(kind: Option<&str>, raw: Option<&str>) -> Result<Option<String>> {
    let Some(raw) = non_blank(raw) else {
        return Ok(None);
    };

    match kind.map(str::trim).unwrap_or("esriGeometryEnvelope") {
        "esriGeometryEnvelope" => parse_envelope(&raw).map(|envelope| Some(envelope.to_wkt())),
        "esriGeometryPolygon" => {
            let geometry: EsriGeometry = serde_json::from_str(&raw).map_err(|err| {
                ServiceError::GeometryFormat(format!("invalid polygon filter: {err}"))
            })?;
            match geometry {
                EsriGeometry::Polygon { .. } => Ok(Some(esri_to_wkt(&geometry, &CrossingNumber)?)),
                _ => Err(ServiceError::GeometryFormat(
                    "geometry is not a polygon".to_string(),
                )),
            }
        }
        other => Err(ServiceError::InvalidRequest(format!(
            "unsupported geometryType '{other}'"
        ))),
    }
}

fn parse_envelope(raw: &str) -> Result<Envelope> {
    if raw.starts_with('{') {
        return serde_json::from_str(raw)
            .map_err(|err| ServiceError::GeometryFormat(format!("invalid envelope: {err}")));
    }

    let coords = raw
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| ServiceError::GeometryFormat(format!("invalid envelope '{raw}'")))?;
    match coords.as_slice() {
        [xmin, ymin, xmax, ymax] => Ok(Envelope {
            xmin: *xmin,
            ymin: *ymin,
            xmax: *xmax,
            ymax: *ymax,
        }),
        _ => Err(ServiceError::GeometryFormat(format!(
            "envelope needs four coordinates, got '{raw}'"
        ))),
    }
}
