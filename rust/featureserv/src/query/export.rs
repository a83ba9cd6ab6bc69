use crate::error::{Result, ServiceError};
use crate::geometry::{wkt_to_esri, EsriGeometry};
use crate::models::{Attributes, GeometryType, GEOMETRY_OUTPUT_COLUMN};
use anyhow::Context;
use serde_json::Value;

const X_COLUMN: &str = "geometry_x_location";
const Y_COLUMN: &str = "geometry_y_location";

/// Writes rows with the columns of the first row. Point geometries are split
/// into x/y columns; other geometries stay as WKT.
pub fn rows_to_csv(
    rows: &[Attributes],
    geometry_type: GeometryType,
    include_header: bool,
) -> Result<String> {
    let Some(first) = rows.first() else {
        return Ok(String::new());
    };

    let split_points = geometry_type == GeometryType::Point && first.contains_key(GEOMETRY_OUTPUT_COLUMN);
    let mut columns: Vec<&str> = first
        .keys()
        .map(String::as_str)
        .filter(|key| !(split_points && *key == GEOMETRY_OUTPUT_COLUMN))
        .collect();
    if split_points {
        columns.extend([X_COLUMN, Y_COLUMN]);
    }

    let mut writer = csv::Writer::from_writer(Vec::new());
    if include_header {
        writer
            .write_record(&columns)
            .context("failed to write CSV header")?;
    }

    for row in rows {
        let point = if split_points {
            match row.get(GEOMETRY_OUTPUT_COLUMN) {
                Some(Value::String(text)) => match wkt_to_esri(text)? {
                    EsriGeometry::Point { x, y, .. } => Some((x, y)),
                    _ => None,
                },
                _ => None,
            }
        } else {
            None
        };

        let record: Vec<String> = columns
            .iter()
            .map(|column| match *column {
                X_COLUMN if split_points => point.map(|(x, _)| x.to_string()).unwrap_or_default(),
                Y_COLUMN if split_points => point.map(|(_, y)| y.to_string()).unwrap_or_default(),
                name => cell(row.get(name)),
            })
            .collect();
        writer.write_record(&record).context("failed to write CSV row")?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|err| ServiceError::Internal(anyhow::anyhow!("failed to flush CSV: {err}")))?;
    String::from_utf8(bytes)
        .context("CSV output was not UTF-8")
        .map_err(ServiceError::from)
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}
