//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use saga::{SagaError, StoreError};
use thiserror::Error;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Saga operation error.
    Saga(SagaError),
    /// A dependency is temporarily unavailable; the client may retry.
    Unavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Saga(err) => saga_error_to_response(err),
            ApiError::Unavailable(msg) => {
                tracing::warn!(reason = %msg, "request deferred");
                (StatusCode::SERVICE_UNAVAILABLE, msg)
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    match &err {
        SagaError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        SagaError::InvalidOrder(_) | SagaError::InvalidWebhook(_) | SagaError::Protocol(_) => {
            (StatusCode::BAD_REQUEST, err.to_string())
        }
        SagaError::InvalidState { .. } | SagaError::InvalidTransition { .. } => {
            (StatusCode::CONFLICT, err.to_string())
        }
        SagaError::Store(StoreError::ConcurrencyConflict { .. }) => {
            (StatusCode::CONFLICT, "saga is busy, retry the request".to_string())
        }
        _ => {
            // Store and serialization detail stays in the logs.
            tracing::error!(error = %err, "internal server error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".to_string(),
            )
        }
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

/// Failures while bringing the server up.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("saga store setup failed: {0}")]
    Store(#[from] StoreError),

    #[error("idempotency store migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("metrics recorder setup failed: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
