//! Reactive client cache of server state.
//!
//! Entries carry a staleness flag and a fetch generation. A read that was
//! started before [`ReactiveCache::cancel_fetches`] carries an outdated
//! generation and its result is dropped, so it can never overwrite an
//! optimistic patch applied in the meantime.

use crate::error::TransportError;
use crate::projection;
use crate::transport::SyncTransport;
use chrono::Utc;
use pantry_core::{ItemId, ListId, ListItem, QueuedMutation};
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::debug;

/// A cacheable region of server state.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// All items of one list.
    ListItems(ListId),
    /// A single item.
    Item(ItemId),
}

/// Cached value of a [`CacheKey`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheValue {
    Items(Vec<ListItem>),
    Item(ListItem),
}

impl CacheValue {
    pub fn as_items(&self) -> Option<&[ListItem]> {
        match self {
            CacheValue::Items(items) => Some(items),
            CacheValue::Item(_) => None,
        }
    }

    pub fn as_item(&self) -> Option<&ListItem> {
        match self {
            CacheValue::Item(item) => Some(item),
            CacheValue::Items(_) => None,
        }
    }
}

/// Proof that a read was started at a given fetch generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchTicket {
    key: CacheKey,
    generation: u64,
}

impl FetchTicket {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

/// Prior state of one cache entry, captured before an optimistic patch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheSnapshot {
    key: CacheKey,
    value: Option<CacheValue>,
    stale: bool,
}

impl CacheSnapshot {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn value(&self) -> Option<&CacheValue> {
        self.value.as_ref()
    }
}

#[derive(Clone, Debug, Default)]
struct CacheEntry {
    value: Option<CacheValue>,
    stale: bool,
    generation: u64,
}

/// Keyed cache shared by readers, the optimistic coordinator and the sync
/// processor.
pub struct ReactiveCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    changes: broadcast::Sender<CacheKey>,
}

impl ReactiveCache {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            entries: RwLock::new(HashMap::new()),
            changes,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheValue> {
        self.entries.read().get(key).and_then(|e| e.value.clone())
    }

    /// Missing entries count as stale.
    pub fn is_stale(&self, key: &CacheKey) -> bool {
        self.entries.read().get(key).map(|e| e.stale).unwrap_or(true)
    }

    /// Store a fresh value.
    pub fn set(&self, key: CacheKey, value: CacheValue) {
        self.write(key, Some(value));
    }

    pub fn remove(&self, key: &CacheKey) {
        self.write(key.clone(), None);
    }

    /// Replace the value of `key`; `None` leaves the key without a value.
    pub fn write(&self, key: CacheKey, value: Option<CacheValue>) {
        {
            let mut entries = self.entries.write();
            let entry = entries.entry(key.clone()).or_default();
            entry.value = value;
            entry.stale = false;
        }
        let _ = self.changes.send(key);
    }

    /// Mark `key` stale so the next read refetches it.
    pub fn invalidate(&self, key: &CacheKey) {
        let changed = match self.entries.write().get_mut(key) {
            Some(entry) if !entry.stale => {
                entry.stale = true;
                true
            }
            _ => false,
        };
        if changed {
            let _ = self.changes.send(key.clone());
        }
    }

    /// Start a read of `key` from the server.
    pub fn begin_fetch(&self, key: CacheKey) -> FetchTicket {
        let generation = self
            .entries
            .write()
            .entry(key.clone())
            .or_insert_with(|| CacheEntry {
                stale: true,
                ..CacheEntry::default()
            })
            .generation;
        FetchTicket { key, generation }
    }

    /// Finish a read. Returns `false` if it was cancelled in the meantime.
    pub fn complete_fetch(&self, ticket: FetchTicket, value: Option<CacheValue>) -> bool {
        let applied = {
            let mut entries = self.entries.write();
            match entries.get_mut(&ticket.key) {
                Some(entry) if entry.generation == ticket.generation => {
                    entry.value = value;
                    entry.stale = false;
                    true
                }
                _ => false,
            }
        };
        if applied {
            let _ = self.changes.send(ticket.key);
        } else {
            debug!(key = ?ticket.key, "dropped result of cancelled read");
        }
        applied
    }

    /// Capture the current value and staleness of `key`.
    pub fn snapshot(&self, key: &CacheKey) -> CacheSnapshot {
        let entries = self.entries.read();
        let (value, stale) = match entries.get(key) {
            Some(entry) => (entry.value.clone(), entry.stale),
            None => (None, true),
        };
        CacheSnapshot {
            key: key.clone(),
            value,
            stale,
        }
    }

    /// Put a snapshot back exactly. The fetch generation is left alone so
    /// reads cancelled since the snapshot stay cancelled.
    pub fn restore(&self, snapshot: CacheSnapshot) {
        {
            let mut entries = self.entries.write();
            let entry = entries.entry(snapshot.key.clone()).or_default();
            entry.value = snapshot.value;
            entry.stale = snapshot.stale;
        }
        let _ = self.changes.send(snapshot.key);
    }

    /// Invalidate every read of `key` currently in flight.
    pub fn cancel_fetches(&self, key: &CacheKey) {
        if let Some(entry) = self.entries.write().get_mut(key) {
            entry.generation += 1;
        }
    }

    /// Refetch `keys` from the server and lay the projections of still
    /// pending mutations back on top, so queued intent is not hidden by
    /// server state that predates it.
    pub async fn reconcile<T>(
        &self,
        transport: &T,
        keys: &[CacheKey],
        pending: &[QueuedMutation],
    ) -> Result<(), TransportError>
    where
        T: SyncTransport + ?Sized,
    {
        for key in keys {
            let ticket = self.begin_fetch(key.clone());
            let server = transport.fetch(key).await?;

            let rebased = projection::rebase(key, server, pending, Utc::now());
            self.complete_fetch(ticket, rebased);
        }
        Ok(())
    }

    /// Receive the key of every changed entry.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheKey> {
        self.changes.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entries.read().values().filter(|e| e.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ReactiveCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveCache").field("len", &self.len()).finish()
    }
}

impl Default for ReactiveCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn milk() -> ListItem {
        ListItem::new(ItemId::new("milk"), ListId::new("weekly"), "Milk")
    }

    #[test]
    fn test_cancelled_fetch_is_dropped() {
        let cache = ReactiveCache::new();
        let key = CacheKey::Item(ItemId::new("milk"));

        let ticket = cache.begin_fetch(key.clone());
        cache.cancel_fetches(&key);
        let mut patched = milk();
        patched.checked = true;
        cache.set(key.clone(), CacheValue::Item(patched.clone()));

        assert!(!cache.complete_fetch(ticket, Some(CacheValue::Item(milk()))));
        assert_eq!(cache.get(&key), Some(CacheValue::Item(patched)));
    }

    #[test]
    fn test_fetch_fills_and_freshens() {
        let cache = ReactiveCache::new();
        let key = CacheKey::Item(ItemId::new("milk"));
        assert!(cache.is_stale(&key));

        let ticket = cache.begin_fetch(key.clone());
        assert!(cache.complete_fetch(ticket, Some(CacheValue::Item(milk()))));
        assert!(!cache.is_stale(&key));

        cache.invalidate(&key);
        assert!(cache.is_stale(&key));
        // Invalidation keeps the value readable.
        assert!(cache.get(&key).is_some());
    }

    #[test]
    fn test_restore_puts_back_value_and_staleness() {
        let cache = ReactiveCache::new();
        let key = CacheKey::Item(ItemId::new("milk"));
        let missing = cache.snapshot(&key);

        cache.set(key.clone(), CacheValue::Item(milk()));
        cache.restore(missing);
        assert_eq!(cache.get(&key), None);
        assert!(cache.is_stale(&key));

        cache.set(key.clone(), CacheValue::Item(milk()));
        let fresh = cache.snapshot(&key);
        cache.remove(&key);
        cache.restore(fresh);
        assert_eq!(cache.get(&key), Some(CacheValue::Item(milk())));
        assert!(!cache.is_stale(&key));
    }

    #[test]
    fn test_subscribers_hear_changes() {
        let cache = ReactiveCache::new();
        let mut rx = cache.subscribe();
        let key = CacheKey::ListItems(ListId::new("weekly"));

        cache.set(key.clone(), CacheValue::Items(vec![milk()]));
        cache.invalidate(&key);
        cache.invalidate(&key);

        assert_eq!(rx.try_recv().unwrap(), key);
        assert_eq!(rx.try_recv().unwrap(), key);
        assert!(rx.try_recv().is_err());
    }
}
