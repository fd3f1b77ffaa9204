//! Error handling for the StickGuard server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or out-of-range input; lists every failing field
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        fields: Vec<String>,
    },

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Forbidden (authorization decided by the identity collaborator)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Conflict (e.g. resolving an already-resolved incident)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Transport not connected
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Dependent service unavailable
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Broker connection could not be established
    #[error("Connection error: {0}")]
    Connection(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Validation error with a field list
    pub fn validation(message: impl Into<String>, fields: Vec<String>) -> Self {
        Error::Validation {
            message: message.into(),
            fields,
        }
    }
}

/// Body-shape failures (missing field, malformed JSON) surface as
/// validation errors, same envelope as range checks
impl From<axum::extract::rejection::JsonRejection> for Error {
    fn from(rejection: axum::extract::rejection::JsonRejection) -> Self {
        Error::Validation {
            message: rejection.body_text(),
            fields: Vec::new(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code, message, fields) = match &self {
            Error::Validation { message, fields } => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                message.clone(),
                Some(fields.clone()),
            ),
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone(), None),
            Error::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone(), None),
            Error::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone(), None),
            Error::NotConnected(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "NOT_CONNECTED",
                msg.clone(),
                None,
            ),
            Error::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                msg.clone(),
                None,
            ),
            Error::Connection(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "CONNECTION_ERROR",
                msg.clone(),
                None,
            ),
            Error::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SERIALIZATION_ERROR",
                e.to_string(),
                None,
            ),
            Error::Http(e) => (StatusCode::BAD_GATEWAY, "HTTP_ERROR", e.to_string(), None),
            Error::Io(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "IO_ERROR",
                e.to_string(),
                None,
            ),
            Error::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg.clone(),
                None,
            ),
        };

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %message,
            "Request error"
        );

        let body = match fields {
            Some(fields) => Json(json!({
                "error_code": error_code,
                "message": message,
                "fields": fields,
            })),
            None => Json(json!({
                "error_code": error_code,
                "message": message,
            })),
        };

        (status, body).into_response()
    }
}
