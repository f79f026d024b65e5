//! Error handling module for the Nodo backend.
//!
//! Provides the API error taxonomy with mapping to HTTP status codes and the response envelope.

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::blob::BlobError;
use crate::db::{Retryable, StoreError};

/// Boxed underlying cause carried by internal errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error codes as constants to avoid stringly-typed errors.
pub mod codes {
    pub const INVALID_INPUT: &str = "INVALID_INPUT";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const CONFLICT: &str = "CONFLICT";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const INTERNAL_SERVER_ERROR: &str = "INTERNAL_SERVER_ERROR";
}

/// Application error type.
#[derive(Debug)]
pub enum AppError {
    /// Bad input, rejected before any side effect
    Validation(String),
    /// Resource not found
    NotFound(String),
    /// State conflict (duplicate store, already decided approval)
    Conflict(String),
    /// Authentication required
    Unauthorized(String),
    /// Authenticated but not allowed
    Forbidden(String),
    /// The request did not finish within the write timeout
    Timeout(String),
    /// Anything else; the cause is logged, never rendered
    Internal {
        message: String,
        source: Option<BoxError>,
    },
}

impl AppError {
    pub fn internal(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        AppError::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            AppError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => codes::INVALID_INPUT,
            AppError::NotFound(_) => codes::NOT_FOUND,
            AppError::Conflict(_) => codes::CONFLICT,
            AppError::Unauthorized(_) => codes::UNAUTHORIZED,
            AppError::Forbidden(_) => codes::FORBIDDEN,
            AppError::Timeout(_) => codes::TIMEOUT,
            AppError::Internal { .. } => codes::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error message.
    pub fn message(&self) -> String {
        match self {
            AppError::Validation(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg)
            | AppError::Unauthorized(msg)
            | AppError::Forbidden(msg)
            | AppError::Timeout(msg) => msg.clone(),
            AppError::Internal { message, .. } => message.clone(),
        }
    }

    /// True when the failure came from a store conflict that a fresh attempt may clear.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Internal {
                source: Some(source),
                ..
            } => source
                .downcast_ref::<StoreError>()
                .is_some_and(StoreError::is_retryable),
            _ => false,
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_code(), self.message())?;
        if let AppError::Internal {
            source: Some(source),
            ..
        } = self
        {
            write!(f, " ({})", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Internal {
                source: Some(source),
                ..
            } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { collection, id } => {
                AppError::NotFound(format!("{} {} not found", singular(&collection), id))
            }
            other => AppError::internal("Storage operation failed", other),
        }
    }
}

impl From<BlobError> for AppError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound(path) => AppError::NotFound(format!("Object {} not found", path)),
            BlobError::InvalidPath(path) => {
                AppError::Validation(format!("Invalid object path: {}", path))
            }
            other => AppError::internal("Blob storage operation failed", other),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

/// Render failures raised by tower middleware (the request timeout) in the envelope.
pub async fn handle_middleware_error(err: BoxError) -> AppError {
    if err.is::<tower::timeout::error::Elapsed>() {
        AppError::Timeout("Request timed out".to_string())
    } else {
        AppError::internal("Unhandled middleware error", err)
    }
}

fn singular(collection: &str) -> String {
    let last = collection.rsplit('/').next().unwrap_or(collection);
    let name = last.strip_suffix('s').unwrap_or(last);
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::from("Document"),
    }
}

/// Error details in the response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
}

/// Error response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorDetails,
}

impl ErrorResponse {
    pub fn new(error: &AppError) -> Self {
        Self {
            success: false,
            error: ErrorDetails {
                code: error.error_code().to_string(),
                message: error.message(),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Internal { .. } = self {
            tracing::error!(error = %self, "request failed");
        }
        let status = self.status_code();
        (status, Json(ErrorResponse::new(&self))).into_response()
    }
}
