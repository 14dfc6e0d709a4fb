//! Error types for the mutation queue.

use pantry_core::MutationId;
use thiserror::Error;

/// Errors that can occur in queue operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The backing store could not be read or written.
    #[error("Queue persistence unavailable: {0}")]
    Persistence(String),

    #[error("Persisted queue is corrupt: {0}")]
    Corrupt(String),

    #[error("Unsupported queue format version: {0}")]
    UnsupportedVersion(u32),

    #[error("Queued mutation not found: {0}")]
    NotFound(MutationId),
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        QueueError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Corrupt(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
