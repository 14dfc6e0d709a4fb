//! The durable record of one pending mutation.

use crate::error::CoreError;
use crate::ids::MutationId;
use crate::mutation::{Mutation, MutationMethod};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A mutation waiting in the client queue for replay.
///
/// Serializes to exactly `id, method, operation, payload, timestamp,
/// retryCount, lastError`; the payload is the variant's own fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "QueuedRecord", into = "QueuedRecord")]
pub struct QueuedMutation {
    pub id: MutationId,
    pub mutation: Mutation,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl QueuedMutation {
    /// Wrap a mutation with a fresh id and the current time.
    pub fn new(mutation: Mutation) -> Self {
        Self::with_timestamp(mutation, Utc::now())
    }

    pub fn with_timestamp(mutation: Mutation, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: MutationId::new(),
            mutation,
            timestamp,
            retry_count: 0,
            last_error: None,
        }
    }

    pub fn method(&self) -> MutationMethod {
        self.mutation.method()
    }

    pub fn operation(&self) -> &'static str {
        self.mutation.operation()
    }

    pub fn label(&self) -> String {
        self.mutation.label()
    }

    /// Record a failed replay attempt.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.retry_count += 1;
        self.last_error = Some(error.into());
    }

    /// Age of the entry relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.timestamp
    }
}

/// Flat serialized form of a [`QueuedMutation`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueuedRecord {
    id: MutationId,
    method: MutationMethod,
    operation: String,
    payload: serde_json::Value,
    timestamp: DateTime<Utc>,
    retry_count: u32,
    last_error: Option<String>,
}

impl TryFrom<QueuedRecord> for QueuedMutation {
    type Error = CoreError;

    fn try_from(record: QueuedRecord) -> Result<Self, Self::Error> {
        let mutation = Mutation::from_parts(&record.operation, record.payload)?;
        if mutation.method() != record.method {
            return Err(CoreError::InvalidPayload {
                operation: record.operation,
                reason: format!("method {} does not match operation", record.method),
            });
        }
        Ok(Self {
            id: record.id,
            mutation,
            timestamp: record.timestamp,
            retry_count: record.retry_count,
            last_error: record.last_error,
        })
    }
}

impl From<QueuedMutation> for QueuedRecord {
    fn from(entry: QueuedMutation) -> Self {
        let method = entry.mutation.method();
        // Variant fields are plain data; splitting them cannot fail.
        let (operation, payload) = entry
            .mutation
            .to_parts()
            .unwrap_or_else(|_| (entry.mutation.operation().to_string(), serde_json::Value::Null));
        Self {
            id: entry.id,
            method,
            operation,
            payload,
            timestamp: entry.timestamp,
            retry_count: entry.retry_count,
            last_error: entry.last_error,
        }
    }
}
