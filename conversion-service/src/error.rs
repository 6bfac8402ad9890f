use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::jobs::TransitionError;

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Unsupported file type: {extension}. Allowed: {allowed}")]
    UnsupportedFormat { extension: String, allowed: String },

    #[error("File too large: {size_mb:.1}MB. Max: {max_mb}MB")]
    FileTooLarge { size_mb: f64, max_mb: u64 },

    #[error("Upload exceeds the {max_mb}MB limit")]
    UploadTooLarge { max_mb: u64 },

    #[error("Database error")]
    Database(#[from] DatabaseError),

    #[error("Invalid job state transition")]
    Transition(#[from] TransitionError),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Database errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed")]
    Connection(#[source] rusqlite::Error),

    #[error("Query failed")]
    Query(#[source] rusqlite::Error),

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Serialization failed")]
    Serialization(#[source] serde_json::Error),

    #[error("Corrupt job record {job_id}: {message}")]
    CorruptRecord { job_id: String, message: String },
}

/// API error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::JobNotFound { .. } => StatusCode::NOT_FOUND,
            ServiceError::InvalidRequest { .. } | ServiceError::UnsupportedFormat { .. } => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::FileTooLarge { .. } | ServiceError::UploadTooLarge { .. } => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ServiceError::JobNotFound { .. } => "job_not_found",
            ServiceError::InvalidRequest { .. } => "invalid_request",
            ServiceError::UnsupportedFormat { .. } => "unsupported_format",
            ServiceError::FileTooLarge { .. } | ServiceError::UploadTooLarge { .. } => {
                "file_too_large"
            }
            ServiceError::Database(_) => "database_error",
            ServiceError::Transition(_) => "invalid_transition",
            ServiceError::Config { .. } => "config_error",
            ServiceError::Internal { .. } => "internal_error",
        }
    }

    /// Whether the message is safe to show without debug mode
    fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Build the JSON error response, hiding internal detail unless `debug` is set
    pub fn to_response(&self, debug: bool) -> Response {
        let status = self.status_code();
        let message = if self.is_client_error() {
            self.to_string()
        } else {
            "An unexpected error occurred".to_string()
        };
        let details = (debug && !self.is_client_error())
            .then(|| serde_json::Value::String(format_error_chain(self)));

        let response = ErrorResponse {
            message,
            code: Some(self.error_code().to_string()),
            details,
        };

        (status, Json(response)).into_response()
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        self.to_response(false)
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Error wrapper carrying the debug flag for API responses
pub struct ApiError {
    pub error: ServiceError,
    pub debug: bool,
}

impl ApiError {
    pub fn new(error: ServiceError, debug: bool) -> Self {
        Self { error, debug }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if !self.error.is_client_error() {
            tracing::error!(error = %format_error_chain(&self.error), "Request failed");
        }
        self.error.to_response(self.debug)
    }
}

impl<E: Into<ServiceError>> From<E> for ApiError {
    fn from(error: E) -> Self {
        Self {
            error: error.into(),
            debug: false,
        }
    }
}

/// Render an error and all of its sources as a single line
pub fn format_error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ServiceError::JobNotFound {
                job_id: "x".to_string()
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::FileTooLarge {
                size_mb: 120.0,
                max_mb: 100
            }
            .status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ServiceError::UnsupportedFormat {
                extension: ".exe".to_string(),
                allowed: ".pdf".to_string()
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::Internal {
                message: "boom".to_string()
            }
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_format_error_chain_includes_sources() {
        let error = ServiceError::Database(DatabaseError::Query(
            rusqlite::Error::InvalidQuery,
        ));
        let rendered = format_error_chain(&error);
        assert!(rendered.starts_with("Database error: Query failed"));
    }
}
