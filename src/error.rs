//! Application error type and its HTTP mapping.
//!
//! Handlers return `Result<_, AppError>`; the `IntoResponse` impl is the one
//! place status codes are assigned. Database failures keep their taxonomy all
//! the way out: capacity problems are 503, a lost connection is 502, a blown
//! deadline is 504, and rejected statements map to the 4xx the client can act
//! on. Anything unclassified is logged with full detail server-side and
//! leaves the process as a generic 500.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::db::{DbError, QueryErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("Not found")]
    NotFound,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Status and client-facing message. Messages are deliberately generic
    /// for server faults; the detail goes to the log, not the wire.
    fn status_and_message(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Db(DbError::PoolExhausted) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Connection pool exhausted, try again shortly",
            ),
            AppError::Db(DbError::ConnectionLost(_)) => {
                (StatusCode::BAD_GATEWAY, "Database connection lost")
            }
            AppError::Db(DbError::QueryTimeout { .. }) => {
                (StatusCode::GATEWAY_TIMEOUT, "Database operation timed out")
            }
            AppError::Db(DbError::Query { kind, .. }) => match kind {
                QueryErrorKind::Constraint => {
                    (StatusCode::CONFLICT, "Conflicts with existing data")
                }
                QueryErrorKind::InvalidData => {
                    (StatusCode::BAD_REQUEST, "Invalid request data")
                }
                QueryErrorKind::Other => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
                }
            },
            AppError::Db(DbError::Shutdown) => {
                (StatusCode::SERVICE_UNAVAILABLE, "Service is shutting down")
            }
            AppError::NotFound => (StatusCode::NOT_FOUND, "Not found"),
            AppError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        (status, Json(json!({ "error": message }))).into_response()
    }
}
