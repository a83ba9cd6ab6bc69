use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::geometry::GeometryFormatError;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed")]
    Auth,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("Invalid where clause: {0}")]
    InvalidSql(String),

    #[error("Invalid fields: {}", .fields.join(", "))]
    InvalidFields { fields: Vec<String> },

    #[error("Related fields not allowed: {}", .fields.join(", "))]
    RelatedFields { fields: Vec<String> },

    #[error("invalid geometry: {0}")]
    GeometryFormat(String),

    #[error("{message}")]
    AttributeMismatch {
        message: String,
        fields: Vec<String>,
    },

    #[error("query failed: {}", .0.underlying)]
    QueryExecution(DatabaseErrorInfo),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn invalid_fields<I>(fields: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut fields: Vec<String> = fields.into_iter().collect();
        fields.sort();
        ServiceError::InvalidFields { fields }
    }

    pub fn related_fields<I>(fields: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut fields: Vec<String> = fields.into_iter().collect();
        fields.sort();
        ServiceError::RelatedFields { fields }
    }

    pub fn missing_attributes(fields: Vec<String>) -> Self {
        ServiceError::AttributeMismatch {
            message: format!("Missing attributes {}", fields.join(",")),
            fields,
        }
    }

    pub fn unknown_attributes(fields: Vec<String>) -> Self {
        ServiceError::AttributeMismatch {
            message: format!("attributes do not match: {}", fields.join(",")),
            fields,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Config(_) => "CONFIG",
            ServiceError::Auth => "AUTH",
            ServiceError::InvalidRequest(_) => "INVALID_REQUEST",
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::InvalidSql(_) => "INVALID_SQL",
            ServiceError::InvalidFields { .. } => "INVALID_FIELDS",
            ServiceError::RelatedFields { .. } => "RELATED_FIELDS",
            ServiceError::GeometryFormat(_) => "GEOMETRY_FORMAT",
            ServiceError::AttributeMismatch { .. } => "ATTRIBUTE_MISMATCH",
            ServiceError::QueryExecution(info) => info.error_code.as_str(),
            ServiceError::Internal(_) => "INTERNAL",
        }
    }

    pub fn from_database(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::DatabaseError(_, ref info) => {
                ServiceError::QueryExecution(classify_database_error(info.message()))
            }
            diesel::result::Error::NotFound => {
                ServiceError::NotFound("no matching feature".to_string())
            }
            other => ServiceError::Internal(other.into()),
        }
    }

    /// Like [`ServiceError::from_database`], resolving the driver's statement
    /// position against `sql` to report the failing line.
    pub fn from_statement(err: diesel::result::Error, sql: &str) -> Self {
        match err {
            diesel::result::Error::DatabaseError(_, ref info) => {
                let mut classified = classify_database_error(info.message());
                if classified.error_line.is_none() {
                    classified.error_line = info
                        .statement_position()
                        .and_then(|position| statement_line(sql, position));
                }
                ServiceError::QueryExecution(classified)
            }
            other => ServiceError::from_database(other),
        }
    }
}

fn statement_line(sql: &str, position: i32) -> Option<u32> {
    let offset = usize::try_from(position).ok()?.checked_sub(1)?;
    if offset > sql.chars().count() {
        return None;
    }
    let breaks = sql.chars().take(offset).filter(|c| *c == '\n').count();
    u32::try_from(breaks + 1).ok()
}

impl From<diesel::result::Error> for ServiceError {
    fn from(err: diesel::result::Error) -> Self {
        ServiceError::from_database(err)
    }
}

impl From<GeometryFormatError> for ServiceError {
    fn from(err: GeometryFormatError) -> Self {
        ServiceError::GeometryFormat(err.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DatabaseErrorCode {
    Transform,
    DuplicateColumn,
    BadData,
    UnknownError,
}

impl DatabaseErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseErrorCode::Transform => "TRANSFORM",
            DatabaseErrorCode::DuplicateColumn => "DUPLICATE_COLUMN",
            DatabaseErrorCode::BadData => "BAD_DATA",
            DatabaseErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseErrorInfo {
    pub error_code: DatabaseErrorCode,
    pub underlying: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_line: Option<u32>,
}

pub fn classify_database_error(message: &str) -> DatabaseErrorInfo {
    let lowered = message.to_lowercase();
    let error_code = if lowered.contains("transform") {
        DatabaseErrorCode::Transform
    } else if lowered.contains("specified more than once") {
        DatabaseErrorCode::DuplicateColumn
    } else if lowered.contains("invalid input syntax") {
        DatabaseErrorCode::BadData
    } else {
        DatabaseErrorCode::UnknownError
    };

    let error_line = message.lines().find_map(|line| {
        let rest = line.trim_start().strip_prefix("LINE ")?;
        let (number, _) = rest.split_once(':')?;
        number.trim().parse().ok()
    });

    let field_info = if error_code == DatabaseErrorCode::DuplicateColumn {
        quoted_name(message)
    } else {
        None
    };

    DatabaseErrorInfo {
        error_code,
        underlying: message.lines().next().unwrap_or_default().trim().to_string(),
        field_info,
        file_info: None,
        error_line,
    }
}

fn quoted_name(message: &str) -> Option<String> {
    let start = message.find('"')? + 1;
    let len = message[start..].find('"')?;
    Some(message[start..start + len].to_string())
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: String,
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a DatabaseErrorInfo>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::Config(_) | ServiceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ServiceError::Auth => StatusCode::UNAUTHORIZED,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        };

        if status.is_server_error() {
            error!(error = ?self, "request failed");
        }

        let fields = match &self {
            ServiceError::InvalidFields { fields }
            | ServiceError::RelatedFields { fields }
            | ServiceError::AttributeMismatch { fields, .. } => Some(fields.as_slice()),
            _ => None,
        };
        let details = match &self {
            ServiceError::QueryExecution(info) => Some(info),
            _ => None,
        };

        let body = ErrorBody {
            error: self.to_string(),
            code: self.code(),
            fields,
            details,
        };
        (status, Json(body)).into_response()
    }
}
