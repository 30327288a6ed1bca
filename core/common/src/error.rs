//! Common error types for offsync.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Entity identity plus both sides of a detected divergence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictDetails {
    /// Logical entity type (table name).
    pub entity_type: String,
    /// Entity identifier.
    pub entity_id: String,
    /// What the client wanted to write.
    pub client_data: Value,
    /// What the server currently holds.
    pub server_data: Value,
}

/// Top-level error type for offsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Durable storage could not be opened or initialized.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Storage operation failed after the store was opened.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Requested cache key is absent or expired.
    #[error("No cached data available: {0}")]
    CacheMiss(String),

    /// Transport-level failure talking to the backend.
    #[error("Network error: {0}")]
    Network(String),

    /// A remote call exceeded its time budget.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Backend answered with a non-success status.
    #[error("Remote error ({status}): {message}")]
    Remote { status: u16, message: String },

    /// Resource not found on the backend.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Client and server state diverged.
    #[error("Conflict detected for {}/{}", .0.entity_type, .0.entity_id)]
    Conflict(Box<ConflictDetails>),

    /// Caller requested an action that cannot be performed in the current state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a conflict error from its parts.
    pub fn conflict(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        client_data: Value,
        server_data: Value,
    ) -> Self {
        Self::Conflict(Box::new(ConflictDetails {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            client_data,
            server_data,
        }))
    }

    /// Whether a later attempt may succeed without caller intervention.
    ///
    /// Transport failures, timeouts, 5xx responses, 408 and 429 are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) | Self::Io(_) => true,
            Self::Remote { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(Error::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(Error::Remote { status: 503, message: String::new() }.is_retryable());
        assert!(Error::Remote { status: 429, message: String::new() }.is_retryable());

        assert!(!Error::Remote { status: 400, message: String::new() }.is_retryable());
        assert!(!Error::NotFound("x".into()).is_retryable());
        assert!(!Error::InvalidOperation("x".into()).is_retryable());
    }

    #[test]
    fn test_conflict_display() {
        let err = Error::conflict("products", "42", json!({"a": 1}), json!({"a": 2}));
        assert_eq!(err.to_string(), "Conflict detected for products/42");
        assert!(!err.is_retryable());
    }
}
