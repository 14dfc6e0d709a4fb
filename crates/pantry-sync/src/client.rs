//! Composition root: owns every sync component for one client instance.

use crate::bus::{DiscardReason, NotificationBus, QueueStatus, SyncEvent};
use crate::cache::{CacheKey, CacheValue, ReactiveCache};
use crate::error::{FailureClass, Result};
use crate::network::NetworkMonitor;
use crate::optimistic::{OptimisticCoordinator, OptimisticUpdate, Settlement};
use crate::processor::{DrainReport, SyncConfig, SyncHandle, SyncProcessor};
use crate::transport::{MemoryServer, SyncTransport, TransportOutcome};
use chrono::{DateTime, Utc};
use pantry_core::{
    Actor, CheckConflictResult, ItemId, ListId, ListItem, Mutation, MutationId, QueuedMutation,
};
use pantry_queue::{MemoryBackend, MutationQueue, Subscription};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, warn};

/// Configuration for a sync client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// The user this client acts as.
    pub actor: Actor,
    pub sync: SyncConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            actor: Actor::new("anonymous", "Anonymous"),
            sync: SyncConfig::default(),
        }
    }
}

/// Builder for client configuration.
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn actor(mut self, actor: Actor) -> Self {
        self.config.actor = actor;
        self
    }

    pub fn sync(mut self, sync: SyncConfig) -> Self {
        self.config.sync = sync;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// What happened to a submitted mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Applied by the server right away.
    Confirmed(Option<ListItem>),
    /// Stored in the queue for later replay.
    Queued(MutationId),
    /// Someone else holds the check; the local patch is kept until refetch.
    Conflict(CheckConflictResult),
    /// The target no longer exists. The cache was refreshed.
    NotFound,
    /// The server refused the mutation.
    Rejected(String),
}

/// One row of the pending-changes review screen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingChange {
    pub id: MutationId,
    pub label: String,
    pub operation: &'static str,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Currently being replayed; discarding it drops the server's answer.
    pub in_flight: bool,
}

impl PendingChange {
    fn from_entry(entry: &QueuedMutation, in_flight: Option<MutationId>) -> Self {
        Self {
            id: entry.id,
            label: entry.label(),
            operation: entry.operation(),
            timestamp: entry.timestamp,
            retry_count: entry.retry_count,
            last_error: entry.last_error.clone(),
            in_flight: in_flight == Some(entry.id),
        }
    }
}

/// Offline-tolerant client for shared lists.
///
/// # Example
///
/// ```rust
/// use pantry_core::{ItemId, ListId, ListItem};
/// use pantry_sync::{ClientConfig, SubmitOutcome, SyncClient};
///
/// # tokio_test::block_on(async {
/// let client = SyncClient::new_in_memory(ClientConfig::default()).unwrap();
/// client.transport().seed(ListItem::new(ItemId::new("milk"), ListId::new("weekly"), "Milk"));
///
/// client.set_online(false);
/// let outcome = client
///     .toggle_checked(ListId::new("weekly"), ItemId::new("milk"), true)
///     .await
///     .unwrap();
/// assert!(matches!(outcome, SubmitOutcome::Queued(_)));
///
/// client.set_online(true);
/// let report = client.drain().await.unwrap();
/// assert_eq!(report.replayed, 1);
/// # });
/// ```
pub struct SyncClient<T: SyncTransport> {
    config: ClientConfig,
    queue: Arc<MutationQueue>,
    transport: Arc<T>,
    network: Arc<NetworkMonitor>,
    cache: Arc<ReactiveCache>,
    bus: Arc<NotificationBus>,
    coordinator: OptimisticCoordinator,
    processor: Arc<SyncProcessor<T>>,
    _queue_subscription: Subscription,
}

impl SyncClient<MemoryServer> {
    /// Create a client backed by an in-memory queue and server (for testing).
    pub fn new_in_memory(config: ClientConfig) -> Result<Self> {
        let queue = MutationQueue::open(MemoryBackend::new())?;
        Ok(Self::new(
            config,
            queue,
            Arc::new(MemoryServer::new()),
            Arc::new(NetworkMonitor::default()),
        ))
    }
}

impl<T: SyncTransport> SyncClient<T> {
    pub fn new(
        config: ClientConfig,
        queue: MutationQueue,
        transport: Arc<T>,
        network: Arc<NetworkMonitor>,
    ) -> Self {
        let queue = Arc::new(queue);
        let cache = Arc::new(ReactiveCache::new());
        let bus = Arc::new(NotificationBus::new(QueueStatus {
            queue_size: queue.len(),
            is_online: network.is_online(),
            ..QueueStatus::default()
        }));
        let coordinator = OptimisticCoordinator::new(Arc::clone(&cache));

        let listener_bus = Arc::clone(&bus);
        let subscription = queue.subscribe(move |change| listener_bus.set_queue_size(change.size()));

        let processor = Arc::new(SyncProcessor::new(
            Arc::clone(&queue),
            Arc::clone(&transport),
            Arc::clone(&network),
            coordinator.clone(),
            Arc::clone(&bus),
            config.sync.clone(),
        ));

        Self {
            config,
            queue,
            transport,
            network,
            cache,
            bus,
            coordinator,
            processor,
            _queue_subscription: subscription,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn actor(&self) -> &Actor {
        &self.config.actor
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn cache(&self) -> &Arc<ReactiveCache> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    /// Record a connectivity change and reflect it in the status surface.
    pub fn set_online(&self, online: bool) {
        self.network.set_online(online);
        self.bus.set_online(online);
    }

    /// Apply `mutation` optimistically, then execute it now or queue it.
    ///
    /// It runs inline only when online with nothing queued or in flight
    /// ahead of it. A transient failure on the inline path falls back to
    /// the queue.
    pub async fn submit(&self, mutation: Mutation) -> Result<SubmitOutcome> {
        let update = self.coordinator.begin(&mutation);

        let flight = match self.processor.try_claim_flight() {
            Some(flight) if self.network.is_online() && self.queue.is_empty() => flight,
            _ => return self.defer(mutation, update),
        };
        let outcome = self.execute_inline(mutation, update).await;
        drop(flight);
        if self.network.is_online() && !self.queue.is_empty() {
            self.processor.sync_now();
        }
        outcome
    }

    async fn execute_inline(
        &self,
        mutation: Mutation,
        update: OptimisticUpdate,
    ) -> Result<SubmitOutcome> {
        match self.transport.execute(&mutation).await {
            Ok(TransportOutcome::Confirmed(item)) => {
                update.settle(&Settlement::Confirmed(item.clone()));
                Ok(SubmitOutcome::Confirmed(item))
            }
            Ok(TransportOutcome::Conflict(result)) => {
                warn!(item_id = %result.item_id, "check conflict");
                update.settle(&Settlement::Conflict(result.clone()));
                self.bus.publish(SyncEvent::Conflict {
                    id: None,
                    result: result.clone(),
                });
                Ok(SubmitOutcome::Conflict(result))
            }
            Err(err) => match err.class() {
                FailureClass::Transient => {
                    debug!(error = %err, operation = mutation.operation(), "inline execution failed, queueing");
                    self.defer(mutation, update)
                }
                FailureClass::NotFound => {
                    update.settle(&Settlement::Failed {
                        reason: err.to_string(),
                    });
                    self.bus.publish(SyncEvent::Discarded {
                        id: None,
                        label: mutation.label(),
                        reason: DiscardReason::NotFound,
                    });
                    self.processor.refresh(&mutation).await;
                    Ok(SubmitOutcome::NotFound)
                }
                FailureClass::Permanent => {
                    update.settle(&Settlement::Failed {
                        reason: err.to_string(),
                    });
                    self.bus.publish(SyncEvent::Discarded {
                        id: None,
                        label: mutation.label(),
                        reason: DiscardReason::Rejected(err.to_string()),
                    });
                    Ok(SubmitOutcome::Rejected(err.to_string()))
                }
            },
        }
    }

    fn defer(
        &self,
        mutation: Mutation,
        update: OptimisticUpdate,
    ) -> Result<SubmitOutcome> {
        match self.queue.enqueue(mutation) {
            Ok(id) => {
                update.settle(&Settlement::Deferred);
                if self.network.is_online() {
                    self.processor.sync_now();
                }
                Ok(SubmitOutcome::Queued(id))
            }
            Err(e) => {
                error!(error = %e, "could not persist mutation, rolling back");
                update.settle(&Settlement::Failed {
                    reason: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// Check or uncheck an item as this client's actor.
    pub async fn toggle_checked(
        &self,
        list_id: ListId,
        item_id: ItemId,
        checked: bool,
    ) -> Result<SubmitOutcome> {
        self.submit(Mutation::ToggleItemChecked {
            list_id,
            item_id,
            checked,
            actor: self.config.actor.clone(),
        })
        .await
    }

    /// Read a cache region, refetching it first if stale and online.
    pub async fn read(&self, key: &CacheKey) -> Result<Option<CacheValue>> {
        if self.cache.is_stale(key) && self.network.is_online() {
            let pending = self.queue.list();
            if let Err(e) = self
                .cache
                .reconcile(self.transport.as_ref(), std::slice::from_ref(key), &pending)
                .await
            {
                if e.class() != FailureClass::Transient {
                    return Err(e.into());
                }
                debug!(error = %e, "refetch failed, serving cached value");
            }
        }
        Ok(self.cache.get(key))
    }

    /// Entries awaiting replay, oldest first.
    pub fn pending(&self) -> Vec<PendingChange> {
        let in_flight = self.queue.in_flight();
        self.queue
            .list()
            .iter()
            .map(|entry| PendingChange::from_entry(entry, in_flight))
            .collect()
    }

    /// Drop one pending change and reconcile what it had patched.
    pub async fn discard(&self, id: &MutationId) -> Result<bool> {
        let Some(entry) = self.queue.get(id) else {
            return Ok(false);
        };
        if !self.queue.remove(id)? {
            return Ok(false);
        }
        self.bus.publish(SyncEvent::Discarded {
            id: Some(entry.id),
            label: entry.label(),
            reason: DiscardReason::ByUser,
        });
        self.reconcile(std::slice::from_ref(&entry.mutation)).await;
        Ok(true)
    }

    /// Drop every pending change, cancelling a replay run in progress.
    pub async fn clear_all(&self) -> Result<usize> {
        let entries = self.queue.list();
        self.queue.clear()?;
        let mutations: Vec<Mutation> = entries.into_iter().map(|e| e.mutation).collect();
        self.reconcile(&mutations).await;
        Ok(mutations.len())
    }

    async fn reconcile(&self, mutations: &[Mutation]) {
        let mut seen = HashSet::new();
        let keys: Vec<CacheKey> = mutations
            .iter()
            .flat_map(crate::projection::affected_keys)
            .filter(|key| seen.insert(key.clone()))
            .collect();

        if self.network.is_online() {
            let pending = self.queue.list();
            match self
                .cache
                .reconcile(self.transport.as_ref(), &keys, &pending)
                .await
            {
                Ok(()) => return,
                Err(e) => debug!(error = %e, "reconcile failed, marking regions stale"),
            }
        }
        for key in &keys {
            self.cache.invalidate(key);
        }
    }

    /// Replay the queue now, in this task.
    pub async fn drain(&self) -> Result<DrainReport> {
        self.processor.drain().await
    }

    /// Ask the background loop to drain now.
    pub fn sync_now(&self) {
        self.processor.sync_now();
    }

    /// Start the background replay loop.
    pub fn start(&self) -> SyncHandle {
        self.processor.spawn()
    }

    pub fn status(&self) -> QueueStatus {
        self.bus.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<QueueStatus> {
        self.bus.watch_status()
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::SyncConfigBuilder;

    fn weekly() -> ListId {
        ListId::new("weekly")
    }

    fn client() -> SyncClient<MemoryServer> {
        let config = ClientConfigBuilder::new()
            .actor(Actor::new("alice", "Alice"))
            .sync(SyncConfigBuilder::new().jitter(false).build())
            .build();
        let client = SyncClient::new_in_memory(config).unwrap();
        client
            .transport()
            .seed(ListItem::new(ItemId::new("milk"), weekly(), "Milk"));
        client
    }

    #[test]
    fn test_client_config_builder() {
        let config = ClientConfigBuilder::new()
            .actor(Actor::new("bob", "Bob"))
            .build();
        assert_eq!(config.actor.display_name, "Bob");
        assert_eq!(config.sync, SyncConfig::default());
    }

    #[tokio::test]
    async fn test_online_submit_confirms_inline() {
        let client = client();
        let outcome = client
            .toggle_checked(weekly(), ItemId::new("milk"), true)
            .await
            .unwrap();

        match outcome {
            SubmitOutcome::Confirmed(Some(item)) => assert!(item.checked),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(client.pending().is_empty());
        assert!(client.transport().item(&ItemId::new("milk")).unwrap().checked);
    }

    #[tokio::test]
    async fn test_offline_submit_queues_and_updates_status() {
        let client = client();
        client.set_online(false);

        let outcome = client
            .submit(Mutation::RenameItem {
                list_id: weekly(),
                item_id: ItemId::new("milk"),
                name: "Oat milk".into(),
            })
            .await
            .unwrap();

        assert!(matches!(outcome, SubmitOutcome::Queued(_)));
        let status = client.status();
        assert_eq!(status.queue_size, 1);
        assert!(!status.is_online);
        assert_eq!(client.pending()[0].label, "Rename milk to \"Oat milk\"");
        assert_eq!(client.transport().item(&ItemId::new("milk")).unwrap().name, "Milk");
    }

    #[tokio::test]
    async fn test_submit_behind_queue_keeps_order() {
        let client = client();
        client.set_online(false);
        client
            .toggle_checked(weekly(), ItemId::new("milk"), true)
            .await
            .unwrap();
        client.set_online(true);

        // Queue is not empty, so this must line up behind the check.
        let outcome = client
            .toggle_checked(weekly(), ItemId::new("milk"), false)
            .await
            .unwrap();
        assert!(matches!(outcome, SubmitOutcome::Queued(_)));

        client.drain().await.unwrap();
        let applied = client.transport().applied();
        assert_eq!(applied.len(), 2);
        assert!(matches!(applied[0], Mutation::ToggleItemChecked { checked: true, .. }));
        assert!(!client.transport().item(&ItemId::new("milk")).unwrap().checked);
    }

    #[tokio::test]
    async fn test_discard_reconciles_cache() {
        let client = client();
        let key = CacheKey::Item(ItemId::new("milk"));
        client.read(&key).await.unwrap();

        client.set_online(false);
        let Ok(SubmitOutcome::Queued(id)) = client
            .toggle_checked(weekly(), ItemId::new("milk"), true)
            .await
        else {
            panic!("expected queued");
        };
        assert!(client.cache().get(&key).unwrap().as_item().unwrap().checked);

        client.set_online(true);
        assert!(client.discard(&id).await.unwrap());
        assert!(!client.discard(&id).await.unwrap());
        assert!(!client.cache().get(&key).unwrap().as_item().unwrap().checked);
        assert_eq!(client.status().queue_size, 0);
    }
}
