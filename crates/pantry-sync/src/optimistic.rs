//! Optimistic cache coordinator.
//!
//! Every mutation is wrapped in an explicit state machine:
//!
//! ```text
//! Pending -> Applied -> Confirmed
//!                    -> RolledBack
//!                    -> ConflictNoted
//!                    -> Deferred (handed to the queue; settled at replay)
//! ```

use crate::cache::{CacheKey, CacheSnapshot, CacheValue, ReactiveCache};
use crate::projection;
use chrono::Utc;
use pantry_core::{CheckConflictResult, ListItem, Mutation, QueuedMutation};
use std::sync::Arc;
use tracing::debug;

/// Where a mutation is in its optimistic lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MutationPhase {
    Pending,
    Applied,
    /// Waiting in the queue. The patch stays, the snapshot is gone.
    Deferred,
    Confirmed,
    RolledBack,
    /// The server kept someone else's check. The local patch is kept until
    /// the next refetch.
    ConflictNoted,
}

impl MutationPhase {
    pub fn is_settled(&self) -> bool {
        !matches!(self, MutationPhase::Pending | MutationPhase::Applied)
    }
}

/// How a mutation ended up, as far as the cache is concerned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settlement {
    Confirmed(Option<ListItem>),
    Conflict(CheckConflictResult),
    Failed { reason: String },
    Deferred,
}

/// Applies optimistic patches to the shared cache.
#[derive(Clone)]
pub struct OptimisticCoordinator {
    cache: Arc<ReactiveCache>,
}

impl OptimisticCoordinator {
    pub fn new(cache: Arc<ReactiveCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<ReactiveCache> {
        &self.cache
    }

    /// Patch the cache with the expected effect of `mutation`.
    ///
    /// Reads of the affected regions that are still in flight are
    /// cancelled first, so they cannot land on top of the patch.
    #[must_use = "an applied patch must be settled"]
    pub fn begin(&self, mutation: &Mutation) -> OptimisticUpdate {
        let mut update = OptimisticUpdate {
            cache: Arc::clone(&self.cache),
            keys: projection::affected_keys(mutation),
            snapshots: Vec::new(),
            phase: MutationPhase::Pending,
        };

        for key in &update.keys {
            self.cache.cancel_fetches(key);
        }
        update.snapshots = update.keys.iter().map(|k| self.cache.snapshot(k)).collect();

        let now = Utc::now();
        for key in &update.keys {
            let current = self.cache.get(key);
            let patched = projection::project(mutation, key, current.as_ref(), now);
            if patched != current {
                self.cache.write(key.clone(), patched);
            }
        }

        update.phase = MutationPhase::Applied;
        debug!(operation = mutation.operation(), "applied optimistic patch");
        update
    }

    /// Write a server-confirmed item into the cache, re-applying any
    /// still-pending mutations of the same item on top.
    pub fn absorb_confirmed(&self, item: &ListItem, pending: &[QueuedMutation]) {
        write_confirmed(&self.cache, item, pending);
    }

    /// Mark every region `mutation` touches as stale.
    pub fn invalidate(&self, mutation: &Mutation) {
        for key in projection::affected_keys(mutation) {
            self.cache.invalidate(&key);
        }
    }
}

/// An applied optimistic patch awaiting its outcome.
#[derive(Debug)]
pub struct OptimisticUpdate {
    cache: Arc<ReactiveCache>,
    keys: Vec<CacheKey>,
    snapshots: Vec<CacheSnapshot>,
    phase: MutationPhase,
}

impl OptimisticUpdate {
    pub fn phase(&self) -> MutationPhase {
        self.phase
    }

    pub fn keys(&self) -> &[CacheKey] {
        &self.keys
    }

    pub fn snapshots(&self) -> &[CacheSnapshot] {
        &self.snapshots
    }

    /// Resolve the patch. The snapshots are dropped either way.
    pub fn settle(mut self, settlement: &Settlement) -> MutationPhase {
        self.phase = match settlement {
            Settlement::Confirmed(item) => {
                if let Some(item) = item {
                    write_confirmed(&self.cache, item, &[]);
                }
                self.invalidate();
                MutationPhase::Confirmed
            }
            Settlement::Conflict(result) => {
                debug!(item_id = %result.item_id, "keeping optimistic patch after conflict");
                self.invalidate();
                MutationPhase::ConflictNoted
            }
            Settlement::Failed { reason } => {
                debug!(reason = %reason, "rolling back optimistic patch");
                for snapshot in self.snapshots.drain(..) {
                    self.cache.restore(snapshot);
                }
                self.invalidate();
                MutationPhase::RolledBack
            }
            Settlement::Deferred => MutationPhase::Deferred,
        };
        self.phase
    }

    fn invalidate(&self) {
        for key in &self.keys {
            self.cache.invalidate(key);
        }
    }
}

fn write_confirmed(cache: &ReactiveCache, item: &ListItem, pending: &[QueuedMutation]) {
    let now = Utc::now();
    let same_item = move || pending.iter().filter(move |e| e.mutation.item_id() == &item.id);

    let item_key = CacheKey::Item(item.id.clone());
    let value = projection::rebase(&item_key, Some(CacheValue::Item(item.clone())), same_item(), now);
    cache.write(item_key, value);

    let list_key = CacheKey::ListItems(item.list_id.clone());
    if let Some(CacheValue::Items(mut items)) = cache.get(&list_key) {
        match items.iter_mut().find(|i| i.id == item.id) {
            Some(slot) => *slot = item.clone(),
            None => items.push(item.clone()),
        }
        let value = projection::rebase(&list_key, Some(CacheValue::Items(items)), same_item(), now);
        cache.write(list_key, value);
    }
}
