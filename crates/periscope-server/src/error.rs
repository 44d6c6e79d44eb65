//! API error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use periscope_core::session::SessionError;
use periscope_proxy::{ProxyError, ValidationError};

/// API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Protocol version not accepted.
    #[error("unsupported version: {0:?}")]
    UnsupportedVersion(String),

    /// Command name not recognized.
    #[error("unknown command: {0:?}")]
    UnknownCommand(String),

    /// Command recognized but not available.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Malformed or incomplete command.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No session to operate on.
    #[error("not found: {0}")]
    NotFound(String),

    /// The decoded stream already has a consumer.
    #[error("stream already attached")]
    StreamAttached,

    /// Start-request validation failure.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Session registry failure.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Listener failure while starting.
    #[error("listen error: {0}")]
    Listen(String),
}

impl From<ProxyError> for ApiError {
    fn from(error: ProxyError) -> Self {
        match error {
            ProxyError::Validation(inner) => Self::Validation(inner),
            ProxyError::Session(inner) => Self::Session(inner),
            listen @ ProxyError::Listen { .. } => Self::Listen(listen.to_string()),
        }
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::UnsupportedVersion(_) => (StatusCode::BAD_REQUEST, "unsupported_version"),
            ApiError::UnknownCommand(_) => (StatusCode::BAD_REQUEST, "unknown_command"),
            ApiError::NotImplemented(_) => (StatusCode::NOT_IMPLEMENTED, "not_implemented"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::StreamAttached => (StatusCode::CONFLICT, "stream_attached"),
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_failed"),
            ApiError::Session(SessionError::AlreadyExists(_)) => {
                (StatusCode::CONFLICT, "session_exists")
            }
            ApiError::Session(_) => (StatusCode::NOT_FOUND, "session_error"),
            ApiError::Listen(_) => (StatusCode::INTERNAL_SERVER_ERROR, "listen_error"),
        };

        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Result type for API operations.
pub type Result<T> = std::result::Result<T, ApiError>;
