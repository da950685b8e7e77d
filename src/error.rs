// src/error.rs

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Error taxonomy shared by every component of the core.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Validation failed on write.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// De-dup hit or concurrent modification. Carries the surviving report when there is one.
    #[error("conflict: {message}")]
    Conflict {
        message: String,
        existing_report_id: Option<i64>,
    },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("{entity} not found (id={id})")]
    NotFound { entity: &'static str, id: String },

    /// Dual-accumulator disagreement beyond tolerance; never auto-resolved.
    #[error("inconsistency on work-order {workorder_id}: Q_proc={q_proc}, Q_fill={q_fill}")]
    InconsistencyAlert {
        workorder_id: i64,
        q_proc: i64,
        q_fill: i64,
    },

    /// Database unavailable or a statement failed for reasons outside the caller's control.
    #[error("store error: {0}")]
    TransientStore(sqlx::Error),

    /// Schema drift or a corrupt audit chain.
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
            existing_report_id: None,
        }
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Conflict { .. } | Self::InconsistencyAlert { .. } => StatusCode::CONFLICT,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::TransientStore(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Postgres SQLSTATE codes that mean "someone else got there first".
const UNIQUE_VIOLATION: &str = "23505";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNDEFINED_TABLE: &str = "42P01";
const UNDEFINED_COLUMN: &str = "42703";

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            match db.code().as_deref() {
                Some(UNIQUE_VIOLATION) => {
                    return Self::conflict(format!("duplicate row: {}", db.message()))
                }
                Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) => {
                    return Self::conflict(format!("concurrent modification: {}", db.message()))
                }
                Some(UNDEFINED_TABLE) | Some(UNDEFINED_COLUMN) => {
                    return Self::Fatal(format!("schema drift: {}", db.message()))
                }
                _ => {}
            }
        }
        Self::TransientStore(err)
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Fatal(format!("migration failed: {err}"))
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = match &self {
            Self::Conflict {
                existing_report_id: Some(id),
                ..
            } => json!({ "error": self.to_string(), "report_id": id, "replayed": true }),
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
