//! Common error types for ledgerkeep.

use std::time::Duration;
use thiserror::Error;

use crate::types::EntityType;

/// Top-level error type for ledgerkeep operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The remote authority could not be reached or answered with a
    /// server-side failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A remote call exceeded its time budget.
    #[error("Remote call timed out after {0:?}")]
    Timeout(Duration),

    /// A remote payload did not match the schema of its entity type.
    #[error("Malformed {entity_type} payload for record {record_id}: {reason}")]
    MalformedPayload {
        entity_type: EntityType,
        record_id: String,
        reason: String,
    },

    /// The durable local store rejected a write or read.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation requires a record state it is not in.
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl Error {
    /// Whether the failure is transient and the operation may be retried.
    ///
    /// Only transport-level failures qualify; data errors never do.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(Error::Transport("connection refused".into()).is_retryable());
        assert!(Error::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(!Error::Storage("disk full".into()).is_retryable());
        assert!(!Error::NotFound("inventory_items/abc".into()).is_retryable());
        assert!(!Error::MalformedPayload {
            entity_type: EntityType::Inventory,
            record_id: "abc".into(),
            reason: "missing field `stock`".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_malformed_display() {
        let err = Error::MalformedPayload {
            entity_type: EntityType::Receivable,
            record_id: "r-1".into(),
            reason: "unknown field `colour`".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("receivables"));
        assert!(msg.contains("r-1"));
    }
}
