//! The mutation queue store.

use crate::backend::QueueBackend;
use crate::error::{QueueError, Result};
use pantry_core::{Mutation, MutationId, QueuedMutation};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info};

/// A change to the queue, delivered to subscribers after it is durable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueChange {
    /// A mutation was appended. `superseded` lists older entries it replaced.
    Enqueued {
        id: MutationId,
        superseded: Vec<MutationId>,
        size: usize,
    },
    /// An entry was removed (replayed, settled or discarded).
    Removed { id: MutationId, size: usize },
    /// An entry's retry bookkeeping changed.
    Updated { id: MutationId, size: usize },
    /// The whole queue was cleared.
    Cleared { removed: usize },
}

impl QueueChange {
    /// Queue size right after this change.
    pub fn size(&self) -> usize {
        match self {
            QueueChange::Enqueued { size, .. }
            | QueueChange::Removed { size, .. }
            | QueueChange::Updated { size, .. } => *size,
            QueueChange::Cleared { .. } => 0,
        }
    }
}

type Listener = Arc<dyn Fn(&QueueChange) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Listener)>>,
}

impl Listeners {
    fn add(&self, listener: Listener) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, listener));
        id
    }

    fn remove(&self, id: u64) {
        self.entries.lock().retain(|(lid, _)| *lid != id);
    }

    fn notify(&self, change: &QueueChange) {
        // Snapshot so listeners may subscribe, unsubscribe or read the queue.
        let listeners: Vec<Listener> = self
            .entries
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(change);
        }
    }
}

/// Handle returned by [`MutationQueue::subscribe`].
///
/// The listener stays registered until [`Subscription::unsubscribe`] is
/// called or the handle is dropped.
pub struct Subscription {
    id: u64,
    listeners: Weak<Listeners>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.remove(self.id);
        }
    }
}

#[derive(Default)]
struct QueueState {
    entries: Vec<QueuedMutation>,
    in_flight: Option<MutationId>,
    epoch: u64,
}

/// Ordered, persisted list of pending mutations.
///
/// Entries are kept oldest first and are never reordered. The queue is
/// owned by one client instance; share it with `Arc`.
pub struct MutationQueue {
    backend: Box<dyn QueueBackend>,
    state: Mutex<QueueState>,
    listeners: Arc<Listeners>,
}

impl MutationQueue {
    /// Open a queue, restoring whatever the backend has persisted.
    pub fn open(backend: impl QueueBackend + 'static) -> Result<Self> {
        let entries = backend.load()?;
        if !entries.is_empty() {
            info!(pending = entries.len(), "restored pending mutations");
        }
        Ok(Self {
            backend: Box::new(backend),
            state: Mutex::new(QueueState {
                entries,
                ..QueueState::default()
            }),
            listeners: Arc::new(Listeners::default()),
        })
    }

    /// Append a mutation. Returns only once the entry is durable.
    ///
    /// Older entries the new mutation supersedes are dropped in the same
    /// write, unless they are currently being replayed.
    pub fn enqueue(&self, mutation: Mutation) -> Result<MutationId> {
        self.enqueue_entry(QueuedMutation::new(mutation))
    }

    /// Append a prepared entry (id and timestamp already assigned).
    pub fn enqueue_entry(&self, entry: QueuedMutation) -> Result<MutationId> {
        let id = entry.id;
        let change = {
            let mut state = self.state.lock();
            let in_flight = state.in_flight;

            let mut superseded = Vec::new();
            let mut next: Vec<QueuedMutation> = Vec::with_capacity(state.entries.len() + 1);
            for existing in &state.entries {
                if Some(existing.id) != in_flight && entry.mutation.supersedes(&existing.mutation) {
                    superseded.push(existing.id);
                } else {
                    next.push(existing.clone());
                }
            }
            next.push(entry);

            self.persist(&next)?;
            state.entries = next;

            QueueChange::Enqueued {
                id,
                superseded,
                size: state.entries.len(),
            }
        };

        if let QueueChange::Enqueued { superseded, size, .. } = &change {
            debug!(mutation_id = %id, superseded = superseded.len(), size, "enqueued mutation");
        }
        self.listeners.notify(&change);
        Ok(id)
    }

    /// All pending entries, oldest first.
    pub fn list(&self) -> Vec<QueuedMutation> {
        self.state.lock().entries.clone()
    }

    /// The oldest pending entry.
    pub fn peek(&self) -> Option<QueuedMutation> {
        self.state.lock().entries.first().cloned()
    }

    pub fn get(&self, id: &MutationId) -> Option<QueuedMutation> {
        self.state.lock().entries.iter().find(|e| &e.id == id).cloned()
    }

    pub fn contains(&self, id: &MutationId) -> bool {
        self.state.lock().entries.iter().any(|e| &e.id == id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Remove an entry. Returns `false` if it was not queued.
    pub fn remove(&self, id: &MutationId) -> Result<bool> {
        let change = {
            let mut state = self.state.lock();
            let Some(pos) = state.entries.iter().position(|e| &e.id == id) else {
                return Ok(false);
            };

            let mut next = state.entries.clone();
            next.remove(pos);
            self.persist(&next)?;
            state.entries = next;

            QueueChange::Removed {
                id: *id,
                size: state.entries.len(),
            }
        };

        self.listeners.notify(&change);
        Ok(true)
    }

    /// Drop every pending entry and cancel any processing run in progress.
    pub fn clear(&self) -> Result<()> {
        let removed = {
            let mut state = self.state.lock();
            self.persist(&[])?;
            let removed = state.entries.len();
            state.entries.clear();
            state.in_flight = None;
            state.epoch += 1;
            removed
        };

        info!(removed, "cleared mutation queue");
        self.listeners.notify(&QueueChange::Cleared { removed });
        Ok(())
    }

    /// Record a failed replay of `id`; returns the new retry count.
    pub fn record_failure(&self, id: &MutationId, error: impl Into<String>) -> Result<u32> {
        let error = error.into();
        let (retry_count, change) = {
            let mut state = self.state.lock();
            let pos = state
                .entries
                .iter()
                .position(|e| &e.id == id)
                .ok_or(QueueError::NotFound(*id))?;

            let mut next = state.entries.clone();
            next[pos].record_failure(error);
            let retry_count = next[pos].retry_count;
            self.persist(&next)?;
            state.entries = next;

            (
                retry_count,
                QueueChange::Updated {
                    id: *id,
                    size: state.entries.len(),
                },
            )
        };

        self.listeners.notify(&change);
        Ok(retry_count)
    }

    /// Mark `id` as handed to the transport. It can no longer be superseded.
    pub fn mark_in_flight(&self, id: &MutationId) {
        self.state.lock().in_flight = Some(*id);
    }

    pub fn clear_in_flight(&self) {
        self.state.lock().in_flight = None;
    }

    pub fn in_flight(&self) -> Option<MutationId> {
        self.state.lock().in_flight
    }

    /// Counter bumped by every [`clear`](Self::clear).
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Register a listener called synchronously after every durable change.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&QueueChange) + Send + Sync + 'static,
    {
        let id = self.listeners.add(Arc::new(listener));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    fn persist(&self, entries: &[QueuedMutation]) -> Result<()> {
        self.backend.save(entries).map_err(|e| {
            error!(error = %e, "failed to persist mutation queue");
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use pantry_core::{Actor, ItemId, ListId};

    fn rename(item: &str, name: &str) -> Mutation {
        Mutation::RenameItem {
            list_id: ListId::new("weekly"),
            item_id: ItemId::new(item),
            name: name.to_string(),
        }
    }

    fn toggle(item: &str, checked: bool) -> Mutation {
        Mutation::ToggleItemChecked {
            list_id: ListId::new("weekly"),
            item_id: ItemId::new(item),
            checked,
            actor: Actor::new("alice", "Alice"),
        }
    }

    #[test]
    fn test_entries_stay_in_enqueue_order() {
        let queue = MutationQueue::open(MemoryBackend::new()).unwrap();
        let a = queue.enqueue(toggle("milk", true)).unwrap();
        let b = queue.enqueue(rename("eggs", "Eggs")).unwrap();
        let c = queue.enqueue(toggle("milk", false)).unwrap();

        let ids: Vec<_> = queue.list().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a, b, c]);
        assert_eq!(queue.peek().unwrap().id, a);
    }

    #[test]
    fn test_newer_rename_supersedes_older() {
        let queue = MutationQueue::open(MemoryBackend::new()).unwrap();
        let old = queue.enqueue(rename("milk", "Milk 2%")).unwrap();
        let other = queue.enqueue(toggle("milk", true)).unwrap();
        let new = queue.enqueue(rename("milk", "Oat milk")).unwrap();

        let ids: Vec<_> = queue.list().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![other, new]);
        assert!(!queue.contains(&old));
    }

    #[test]
    fn test_in_flight_entry_is_not_superseded() {
        let queue = MutationQueue::open(MemoryBackend::new()).unwrap();
        let old = queue.enqueue(rename("milk", "Milk 2%")).unwrap();
        queue.mark_in_flight(&old);
        let new = queue.enqueue(rename("milk", "Oat milk")).unwrap();

        let ids: Vec<_> = queue.list().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![old, new]);
    }

    #[test]
    fn test_failed_persistence_leaves_queue_untouched() {
        let backend = MemoryBackend::new();
        let queue = MutationQueue::open(backend.clone()).unwrap();
        let kept = queue.enqueue(toggle("milk", true)).unwrap();

        backend.set_available(false);
        let err = queue.enqueue(toggle("bread", true)).unwrap_err();
        assert!(matches!(err, QueueError::Persistence(_)));
        assert!(queue.remove(&kept).is_err());
        assert!(queue.clear().is_err());

        assert_eq!(queue.len(), 1);
        assert!(queue.contains(&kept));
    }

    #[test]
    fn test_subscribers_see_durable_size() {
        let backend = MemoryBackend::new();
        let queue = Arc::new(MutationQueue::open(backend.clone()).unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sub = {
            let seen = seen.clone();
            let backend = backend.clone();
            queue.subscribe(move |change| {
                let durable = backend.load().unwrap().len();
                seen.lock().push((change.size(), durable));
            })
        };

        let id = queue.enqueue(toggle("milk", true)).unwrap();
        queue.enqueue(toggle("eggs", true)).unwrap();
        queue.remove(&id).unwrap();
        queue.clear().unwrap();

        assert_eq!(*seen.lock(), vec![(1, 1), (2, 2), (1, 1), (0, 0)]);

        sub.unsubscribe();
        queue.enqueue(toggle("milk", true)).unwrap();
        assert_eq!(seen.lock().len(), 4);
    }

    #[test]
    fn test_listener_may_read_queue() {
        let queue = Arc::new(MutationQueue::open(MemoryBackend::new()).unwrap());
        let sizes = Arc::new(Mutex::new(Vec::new()));

        let _sub = {
            let weak = Arc::downgrade(&queue);
            let sizes = sizes.clone();
            queue.subscribe(move |_| {
                if let Some(q) = weak.upgrade() {
                    sizes.lock().push(q.len());
                }
            })
        };

        queue.enqueue(toggle("milk", true)).unwrap();
        assert_eq!(*sizes.lock(), vec![1]);
    }

    #[test]
    fn test_record_failure_is_durable() {
        let backend = MemoryBackend::new();
        let queue = MutationQueue::open(backend.clone()).unwrap();
        let id = queue.enqueue(toggle("milk", true)).unwrap();

        assert_eq!(queue.record_failure(&id, "timeout").unwrap(), 1);
        assert_eq!(queue.record_failure(&id, "503").unwrap(), 2);

        let restored = MutationQueue::open(backend).unwrap();
        let entry = restored.get(&id).unwrap();
        assert_eq!(entry.retry_count, 2);
        assert_eq!(entry.last_error.as_deref(), Some("503"));
    }

    #[test]
    fn test_record_failure_on_missing_entry() {
        let queue = MutationQueue::open(MemoryBackend::new()).unwrap();
        let ghost = MutationId::new();
        assert_eq!(
            queue.record_failure(&ghost, "x").unwrap_err(),
            QueueError::NotFound(ghost)
        );
    }

    #[test]
    fn test_clear_bumps_epoch_and_drops_in_flight() {
        let queue = MutationQueue::open(MemoryBackend::new()).unwrap();
        let id = queue.enqueue(toggle("milk", true)).unwrap();
        queue.mark_in_flight(&id);

        let epoch = queue.epoch();
        queue.clear().unwrap();
        assert_eq!(queue.epoch(), epoch + 1);
        assert!(queue.in_flight().is_none());
        assert!(!queue.remove(&id).unwrap());
    }
}
