use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use pulse_core::error::EngineError;

/// Seconds a client should wait before retrying after a storage outage.
pub const STORAGE_RETRY_AFTER_SECONDS: u64 = 1;

/// Application-level errors that map directly to HTTP responses.
///
/// Every variant implements [`IntoResponse`] so Axum handlers can use
/// `Result<impl IntoResponse, AppError>` as their return type.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No query slot freed up before the queue wait ran out.
    #[error("too many concurrent queries")]
    Overloaded,

    #[error(transparent)]
    Query(#[from] EngineError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut field = None;
        let mut retry_after_seconds = None;
        let (status, code, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::Overloaded => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Too many concurrent queries, retry later".to_string(),
            ),
            AppError::Query(err) => {
                let status = match err {
                    e if e.is_validation() => StatusCode::BAD_REQUEST,
                    EngineError::NotFound(_) => StatusCode::NOT_FOUND,
                    EngineError::Cancelled => StatusCode::REQUEST_TIMEOUT,
                    EngineError::StorageUnavailable(_) => {
                        retry_after_seconds = Some(STORAGE_RETRY_AFTER_SECONDS);
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if let EngineError::TypeMismatch { field: name, .. } = err {
                    field = Some(name.clone());
                }
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    tracing::error!("Internal error: {err}");
                    (status, "internal_error", "Internal server error".to_string())
                } else {
                    (status, err.kind(), err.to_string())
                }
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error".to_string(),
                )
            }
        };

        let mut response = (
            status,
            Json(json!({
                "error": {
                    "code": code,
                    "message": message,
                    "field": field
                }
            })),
        )
            .into_response();

        if let Some(retry_after_seconds) = retry_after_seconds {
            if let Ok(value) = retry_after_seconds.to_string().parse() {
                response
                    .headers_mut()
                    .insert(axum::http::header::RETRY_AFTER, value);
            }
        }

        response
    }
}
