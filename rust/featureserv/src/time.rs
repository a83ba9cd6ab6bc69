//! Epoch-millisecond conversions used by the `time` query parameter and date edits.

use crate::error::{Result, ServiceError};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeRange {
    pub fn is_instant(&self) -> bool {
        self.start == self.end
    }
}

/// Parses the ArcGIS `time` parameter. A single value is an instant.
pub fn parse_time_param(raw: &str) -> Result<Option<TimeRange>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    let (start_raw, end_raw) = raw.split_once(',').unwrap_or((raw, raw));
    let start = parse_millis(start_raw)?;
    let end = parse_millis(end_raw)?;
    if start > end {
        return Err(ServiceError::InvalidRequest(
            "time range start must be before end".to_string(),
        ));
    }
    Ok(Some(TimeRange { start, end }))
}

fn parse_millis(raw: &str) -> Result<NaiveDateTime> {
    let invalid = || ServiceError::InvalidRequest(format!("invalid time value '{raw}'"));
    let text = raw.trim();
    let millis = match text.parse::<i64>() {
        Ok(millis) => millis,
        Err(_) => {
            let value = text.parse::<f64>().map_err(|_| invalid())?;
            if !value.is_finite() || value.abs() >= i64::MAX as f64 {
                return Err(invalid());
            }
            value.trunc() as i64
        }
    };
    from_epoch_millis(millis)
}

pub fn from_epoch_millis(millis: i64) -> Result<NaiveDateTime> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| ServiceError::InvalidRequest(format!("time value {millis} out of range")))
}

pub fn to_epoch_millis(value: NaiveDateTime) -> i64 {
    value.and_utc().timestamp_millis()
}

pub fn parse_date_value(value: &Value) -> Result<NaiveDateTime> {
    match value {
        Value::Number(number) => {
            let millis = number
                .as_i64()
                .or_else(|| number.as_f64().map(|v| v as i64))
                .ok_or_else(|| invalid_date(value))?;
            from_epoch_millis(millis)
        }
        Value::String(text) => parse_date_text(text).ok_or_else(|| invalid_date(value)),
        _ => Err(invalid_date(value)),
    }
}

fn parse_date_text(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc).naive_utc());
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

fn invalid_date(value: &Value) -> ServiceError {
    ServiceError::InvalidRequest(format!("invalid date value {value}"))
}
