//! Application error type mapping to HTTP status codes and envelope format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use stepflow_types::error::{EngineError, RepositoryError};

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Engine errors from the services.
    Engine(EngineError),
    /// Authentication failure.
    Unauthorized(String),
    /// Malformed request (bad query parameter, unreadable body).
    BadRequest(String),
    /// Generic internal error.
    Internal(String),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        AppError::Engine(e)
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String, Option<serde_json::Value>) {
        match self {
            AppError::Engine(EngineError::Validation(issues)) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                self.engine_message(),
                serde_json::to_value(issues).ok(),
            ),
            AppError::Engine(EngineError::NotFound(what)) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", format!("{what} not found"), None)
            }
            AppError::Engine(EngineError::Repository(RepositoryError::NotFound)) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                "entity not found".to_string(),
                None,
            ),
            AppError::Engine(EngineError::Conflict(msg)) => {
                (StatusCode::CONFLICT, "CONFLICT", msg.clone(), None)
            }
            AppError::Engine(EngineError::Repository(RepositoryError::Conflict(msg))) => {
                (StatusCode::CONFLICT, "CONFLICT", msg.clone(), None)
            }
            AppError::Engine(EngineError::Forbidden(msg)) => {
                (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone(), None)
            }
            AppError::Engine(EngineError::Timeout(msg)) => {
                (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", msg.clone(), None)
            }
            AppError::Engine(EngineError::Evaluation(_)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "EVALUATION_ERROR",
                self.engine_message(),
                None,
            ),
            AppError::Engine(EngineError::Operation { .. }) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "OPERATION_ERROR",
                self.engine_message(),
                None,
            ),
            AppError::Engine(EngineError::Repository(_)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORAGE_ERROR",
                self.engine_message(),
                None,
            ),
            AppError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone(), None)
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone(), None),
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone(), None)
            }
        }
    }

    fn engine_message(&self) -> String {
        match self {
            AppError::Engine(e) => e.to_string(),
            other => format!("{other:?}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = self.parts();

        if status.is_server_error() {
            tracing::error!(code, error = message.as_str(), "request failed");
        } else {
            tracing::debug!(code, status = status.as_u16(), error = message.as_str(), "request rejected");
        }

        let body = ApiResponse::error(code, &message, details, uuid::Uuid::now_v7().to_string());
        (status, Json(body)).into_response()
    }
}
