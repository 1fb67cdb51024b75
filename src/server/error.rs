//! HTTP error handling and response formatting.

use crate::runtime::error::BridgeError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// JSON error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable error message.
    pub error: String,
    /// Machine-readable error code.
    pub code: String,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            error: error.into(),
        }
    }
}

/// Application error type that converts to HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),
    /// A write named a collection the engine does not accept writes for.
    #[error("{0}")]
    UnknownCollection(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Classifies a failed write. Only an unknown collection is the client's
    /// fault.
    pub fn write(err: BridgeError) -> Self {
        match err {
            BridgeError::UnknownCollection(_) => AppError::UnknownCollection(err.to_string()),
            BridgeError::BadRequest(message) => AppError::BadRequest(message),
            other => AppError::Internal(other.to_string()),
        }
    }

    /// Classifies a failed read; every engine failure is a server error.
    pub fn read(err: BridgeError) -> Self {
        match err {
            BridgeError::BadRequest(message) => AppError::BadRequest(message),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", message),
            AppError::UnknownCollection(message) => {
                tracing::debug!("write to unknown collection: {}", message);
                (StatusCode::BAD_REQUEST, "UNKNOWN_COLLECTION", message)
            }
            AppError::Internal(message) => {
                tracing::error!("Internal error: {}", message);
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
            }
        };

        (status, Json(ErrorResponse::new(code, message))).into_response()
    }
}
