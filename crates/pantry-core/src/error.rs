//! Error types for the core crate.

use thiserror::Error;

/// Errors raised by core operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Invalid payload for {operation}: {reason}")]
    InvalidPayload { operation: String, reason: String },
}

pub type Result<T> = std::result::Result<T, CoreError>;
