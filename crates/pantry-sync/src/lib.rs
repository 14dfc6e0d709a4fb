//! Pantry sync - offline-tolerant synchronization for shared lists
//!
//! Lets a client keep editing while disconnected: every change is applied
//! to the local cache at once, queued durably when it cannot be sent, and
//! replayed in order once the network is back.
//!
//! # Quick Start
//!
//! ```rust
//! use pantry_core::{Actor, ItemId, ListId, ListItem};
//! use pantry_sync::{CacheKey, ClientConfigBuilder, SyncClient};
//!
//! # tokio_test::block_on(async {
//! let config = ClientConfigBuilder::new()
//!     .actor(Actor::new("alice", "Alice"))
//!     .build();
//! let client = SyncClient::new_in_memory(config).unwrap();
//! client.transport().seed(ListItem::new(ItemId::new("milk"), ListId::new("weekly"), "Milk"));
//!
//! // Edit while offline
//! client.set_online(false);
//! client
//!     .toggle_checked(ListId::new("weekly"), ItemId::new("milk"), true)
//!     .await
//!     .unwrap();
//! assert_eq!(client.status().queue_size, 1);
//!
//! // Reconnect and replay
//! client.set_online(true);
//! client.drain().await.unwrap();
//!
//! let item = client.read(&CacheKey::Item(ItemId::new("milk"))).await.unwrap();
//! assert!(item.unwrap().as_item().unwrap().checked);
//! # });
//! ```
//!
//! # Architecture
//!
//! - [`network`] - Online/offline observer
//! - [`bus`] - Queue status and sync event notifications
//! - [`transport`] - Backend abstraction and an in-memory server
//! - [`cache`] - Reactive cache with cancellable reads
//! - [`projection`] - Expected effect of a mutation on cached state
//! - [`optimistic`] - Optimistic patch, rollback and settlement
//! - [`backoff`] - Retry delays
//! - [`processor`] - FIFO replay of the mutation queue
//! - [`client`] - Composition root
//! - [`error`] - Error types

pub mod backoff;
pub mod bus;
pub mod cache;
pub mod client;
pub mod error;
pub mod network;
pub mod optimistic;
pub mod processor;
pub mod projection;
pub mod transport;

// Re-exports for convenience
pub use backoff::RetryPolicy;
pub use bus::{DiscardReason, Escalation, NotificationBus, QueueStatus, SyncEvent};
pub use cache::{CacheKey, CacheSnapshot, CacheValue, FetchTicket, ReactiveCache};
pub use client::{ClientConfig, ClientConfigBuilder, PendingChange, SubmitOutcome, SyncClient};
pub use error::{FailureClass, Result, SyncError, TransportError};
pub use network::NetworkMonitor;
pub use optimistic::{MutationPhase, OptimisticCoordinator, OptimisticUpdate, Settlement};
pub use processor::{
    DrainReport, StopReason, SyncConfig, SyncConfigBuilder, SyncHandle, SyncProcessor,
};
pub use transport::{MemoryServer, SyncTransport, TransportOutcome};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cache::{CacheKey, CacheValue};
    pub use crate::client::{ClientConfig, SubmitOutcome, SyncClient};
    pub use crate::error::{SyncError, TransportError};
    pub use crate::network::NetworkMonitor;
    pub use crate::processor::{SyncConfig, SyncHandle};
    pub use crate::transport::{MemoryServer, SyncTransport};
    pub use pantry_core::{Actor, ItemId, ListId, ListItem, Mutation, MutationId};
}
