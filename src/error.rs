//! Error types for fedipost
//!
//! Every fallible operation in the crate returns `AppError`. It implements
//! `IntoResponse`, rendering the `{code, reason, message}` envelope used by
//! the federation endpoints.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
///
/// Variants are grouped by how they surface at the HTTP boundary. Job
/// handlers never match on these generically; they classify failures into
/// [`crate::jobs::JobError`] at the call site instead.
#[derive(Debug, Error)]
pub enum AppError {
    /// Generic resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// No activity with the given (user, activity ID) pair (404)
    #[error("activity not found")]
    ActivityNotFound,

    /// No note with the given record ID (404)
    #[error("note not found")]
    NoteNotFound,

    /// Identity lookup failed (404)
    #[error("user not found")]
    UserNotFound,

    /// No signing key of the requested kind for the user (404)
    #[error("signing key not found")]
    SigningKeyNotFound,

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Bearer token did not match a stored API key (401)
    #[error("invalid API key")]
    InvalidApiKey,

    /// HTTP signature could not be verified (401)
    #[error("invalid signature: {0}")]
    SignatureInvalid(String),

    /// Access denied (403)
    #[error("Access denied")]
    Forbidden,

    /// Malformed request (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Well-formed but unsupported request (422)
    #[error("Unprocessable entity: {0}")]
    Unprocessable(String),

    /// Outbox activity is not a `Create` (422)
    #[error("invalid activity type: {0}")]
    InvalidActivityType(String),

    /// Outbox `Create` does not wrap a `Note` (422)
    #[error("invalid object type: {0}")]
    InvalidObjectType(String),

    /// Unique key already present (409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// PEM could not be decoded into an RSA key (500)
    #[error("key decode error: {0}")]
    KeyDecode(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error (500)
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Remote federation peer misbehaved (502)
    #[error("Federation error: {0}")]
    Federation(String),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Validation(format!("invalid JSON: {}", err))
    }
}

impl AppError {
    /// HTTP status and metric label for this error
    pub fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::NotFound
            | AppError::ActivityNotFound
            | AppError::NoteNotFound
            | AppError::UserNotFound
            | AppError::SigningKeyNotFound => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Unauthorized | AppError::InvalidApiKey => {
                (StatusCode::UNAUTHORIZED, "unauthorized")
            }
            AppError::SignatureInvalid(_) => (StatusCode::UNAUTHORIZED, "invalid_signature"),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            AppError::Unprocessable(_)
            | AppError::InvalidActivityType(_)
            | AppError::InvalidObjectType(_) => (StatusCode::UNPROCESSABLE_ENTITY, "unprocessable"),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            AppError::Federation(_) => (StatusCode::BAD_GATEWAY, "federation"),
            AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, "http_client"),
            AppError::Database(_) | AppError::Migration(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "database")
            }
            AppError::KeyDecode(_) => (StatusCode::INTERNAL_SERVER_ERROR, "key_decode"),
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }

    /// Whether the underlying database error is a UNIQUE constraint violation
    pub fn is_unique_violation(&self) -> bool {
        match self {
            AppError::Database(sqlx::Error::Database(db_error)) => db_error.is_unique_violation(),
            AppError::Conflict(_) => true,
            _ => false,
        }
    }
}

/// JSON error envelope returned by every endpoint
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ErrorEnvelope {
    pub code: u16,
    pub reason: String,
    pub message: String,
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Server-side failures are logged in full and rendered with the
    /// canonical reason phrase only, so internals never reach the client.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_type) = self.status_and_kind();
        let reason = status.canonical_reason().unwrap_or("Unknown").to_string();

        let message = if status.is_server_error() {
            tracing::error!(error = %self, kind = error_type, "request failed");
            reason.clone()
        } else {
            self.to_string()
        };

        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[error_type]).inc();

        let body = Json(ErrorEnvelope {
            code: status.as_u16(),
            reason,
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
