//! Error types for nexus-api

use thiserror::Error;

/// Result type alias using nexus-api Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to the DataNexus backend
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Server answered with a non-success status
    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Response carried no readable body
    #[error("Response has no readable body")]
    MissingBody,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create a status error from a code and response body
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self::Status {
            status,
            body: body.into(),
        }
    }

    /// Check if this error is worth retrying before any frame was delivered
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::Status { status, .. } => *status == 429 || (500..=599).contains(status),
            _ => false,
        }
    }

    /// Check if the server rejected our credentials
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::Status { status: 401 | 403, .. })
    }
}

/// Pull the human-readable part out of an error response body.
///
/// The backend answers failures with `{"detail": "..."}`; anything else is
/// passed through as-is.
pub(crate) fn error_detail(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::Object(map)) => match map.get("detail") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => body.to_string(),
        },
        _ => body.to_string(),
    }
}
