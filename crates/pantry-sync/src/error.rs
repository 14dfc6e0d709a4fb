//! Error types for the sync engine.

use pantry_queue::QueueError;
use thiserror::Error;

/// How the sync engine reacts to a failed replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Network down or server overloaded: retry later, keep order.
    Transient,
    /// The target resource is gone: drop the mutation and refresh quietly.
    NotFound,
    /// Malformed or forbidden request: drop the mutation and tell the user.
    Permanent,
}

/// Error returned by a transport call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Network unavailable: {0}")]
    Network(String),

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Map an HTTP-like status code onto a transport error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 | 410 => TransportError::NotFound(message),
            408 | 429 | 500..=599 => TransportError::Server { status, message },
            _ => TransportError::Rejected(format!("{} ({})", message, status)),
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            TransportError::Network(_) => FailureClass::Transient,
            TransportError::Server { status, .. } => match status {
                408 | 429 | 500..=599 => FailureClass::Transient,
                404 | 410 => FailureClass::NotFound,
                _ => FailureClass::Permanent,
            },
            TransportError::NotFound(_) => FailureClass::NotFound,
            TransportError::Rejected(_) => FailureClass::Permanent,
        }
    }
}

/// Error type for sync operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(TransportError::from_status(503, "busy").class(), FailureClass::Transient);
        assert_eq!(TransportError::from_status(429, "slow down").class(), FailureClass::Transient);
        assert_eq!(TransportError::from_status(404, "gone").class(), FailureClass::NotFound);
        assert_eq!(TransportError::from_status(410, "gone").class(), FailureClass::NotFound);
        assert_eq!(TransportError::from_status(422, "bad name").class(), FailureClass::Permanent);
        assert_eq!(TransportError::Network("offline".into()).class(), FailureClass::Transient);
    }

    #[test]
    fn test_server_variant_with_client_status_is_permanent() {
        let err = TransportError::Server {
            status: 400,
            message: "bad".into(),
        };
        assert_eq!(err.class(), FailureClass::Permanent);
    }
}
