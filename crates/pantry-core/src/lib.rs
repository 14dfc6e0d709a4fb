//! # pantry-core
//!
//! Core types for the Pantry offline sync engine.
//!
//! This crate provides:
//! - Identifiers for lists, items, actors and queued mutations
//! - The `Mutation` tagged union, one strongly-typed variant per operation
//! - `QueuedMutation`, the durable record of one pending state change
//! - The server-authoritative check/uncheck conflict detector
//!
//! ## Example
//!
//! ```rust
//! use pantry_core::{Actor, CheckLedger, ItemId, ListId, ListItem};
//!
//! let mut ledger = CheckLedger::new();
//! let list = ListId::new("weekly");
//! ledger.insert(ListItem::new(ItemId::new("milk"), list, "Milk"));
//!
//! let alice = Actor::new("alice", "Alice");
//! let bob = Actor::new("bob", "Bob");
//!
//! assert!(!ledger.check(&ItemId::new("milk"), &alice).unwrap().conflict);
//!
//! let lost = ledger.check(&ItemId::new("milk"), &bob).unwrap();
//! assert!(lost.conflict);
//! assert_eq!(lost.conflict_user.unwrap().id.as_str(), "alice");
//! ```

pub mod conflict;
pub mod error;
pub mod ids;
pub mod item;
pub mod mutation;
pub mod queued;

pub use conflict::{CheckConflictResult, CheckLedger, CheckState};
pub use error::{CoreError, Result};
pub use ids::{ActorId, ItemId, ListId, MutationId};
pub use item::{Actor, ListItem};
pub use mutation::{FieldFamily, Mutation, MutationMethod, MutationTarget};
pub use queued::QueuedMutation;
