//! Recovery engine error types.
//!
//! Only setup and the trace store can fail. Validation, summarization,
//! compression and reconstruction never return errors.

use thiserror::Error;

/// Errors that can occur in recovery operations.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Database operation failed.
    #[error("database error: {reason}")]
    DatabaseError { reason: String },

    /// The trace store was used after `close()`.
    #[error("trace store is closed")]
    StoreClosed,

    /// Serialization of a persisted record failed.
    #[error("serialization error: {reason}")]
    SerializationError { reason: String },

    /// The chat client for compression could not be built.
    #[error("chat client setup failed: {reason}")]
    ClientInit { reason: String },

    /// A blocking store task panicked or was cancelled.
    #[error("store task failed: {reason}")]
    TaskFailed { reason: String },
}

impl From<rusqlite::Error> for RecoveryError {
    fn from(e: rusqlite::Error) -> Self {
        RecoveryError::DatabaseError {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for RecoveryError {
    fn from(e: serde_json::Error) -> Self {
        RecoveryError::SerializationError {
            reason: e.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for RecoveryError {
    fn from(e: tokio::task::JoinError) -> Self {
        RecoveryError::TaskFailed {
            reason: e.to_string(),
        }
    }
}
