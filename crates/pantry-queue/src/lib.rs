//! # pantry-queue
//!
//! Durable FIFO queue of pending mutations for the Pantry sync engine.
//!
//! This crate provides:
//! - `MutationQueue`: ordered, persisted list of pending mutations with
//!   enqueue/list/remove/clear and synchronous change subscriptions
//! - `QueueBackend`: the persistence seam, with `MemoryBackend` and an
//!   atomically-writing `FileBackend`
//!
//! Every write reaches the backend before the in-memory view changes and
//! before any subscriber is told about it. If the backend refuses a write,
//! the operation fails and nothing changes.
//!
//! ## Example
//!
//! ```rust
//! use pantry_core::{ItemId, ListId, Mutation};
//! use pantry_queue::{MemoryBackend, MutationQueue};
//!
//! let queue = MutationQueue::open(MemoryBackend::new()).unwrap();
//! let id = queue
//!     .enqueue(Mutation::DeleteItem {
//!         list_id: ListId::new("weekly"),
//!         item_id: ItemId::new("milk"),
//!     })
//!     .unwrap();
//!
//! assert_eq!(queue.peek().unwrap().id, id);
//! assert!(queue.remove(&id).unwrap());
//! assert!(queue.is_empty());
//! ```

mod backend;
mod error;
mod store;

pub use backend::{FileBackend, MemoryBackend, QueueBackend, QUEUE_FORMAT_VERSION};
pub use error::{QueueError, Result};
pub use store::{MutationQueue, QueueChange, Subscription};
