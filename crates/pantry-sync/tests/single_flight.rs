//! At most one mutation reaches the server at a time, inline or replayed.

use async_trait::async_trait;
use pantry_core::{Actor, ItemId, ListId, ListItem, Mutation};
use pantry_queue::{MemoryBackend, MutationQueue};
use pantry_sync::{
    CacheKey, CacheValue, ClientConfigBuilder, MemoryServer, NetworkMonitor, StopReason,
    SubmitOutcome, SyncClient, SyncTransport, TransportError, TransportOutcome,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Slow on the first call, fast afterwards; records peak concurrency.
struct UnevenLatency {
    server: MemoryServer,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl UnevenLatency {
    fn new() -> Self {
        let server = MemoryServer::new();
        server.seed(ListItem::new(milk(), weekly(), "Milk"));
        Self {
            server,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn checked_order(&self) -> Vec<bool> {
        self.server
            .applied()
            .into_iter()
            .filter_map(|m| match m {
                Mutation::ToggleItemChecked { checked, .. } => Some(checked),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl SyncTransport for UnevenLatency {
    async fn execute(&self, mutation: &Mutation) -> Result<TransportOutcome, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let latency = if call == 0 { 100 } else { 5 };
        tokio::time::sleep(Duration::from_millis(latency)).await;
        let result = self.server.execute(mutation).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn fetch(&self, key: &CacheKey) -> Result<Option<CacheValue>, TransportError> {
        self.server.fetch(key).await
    }
}

fn weekly() -> ListId {
    ListId::new("weekly")
}

fn milk() -> ItemId {
    ItemId::new("milk")
}

fn client(transport: &Arc<UnevenLatency>) -> SyncClient<UnevenLatency> {
    SyncClient::new(
        ClientConfigBuilder::new()
            .actor(Actor::new("alice", "Alice"))
            .build(),
        MutationQueue::open(MemoryBackend::new()).unwrap(),
        Arc::clone(transport),
        Arc::new(NetworkMonitor::default()),
    )
}

#[tokio::test]
async fn test_submit_during_inline_call_queues_behind_it() {
    let transport = Arc::new(UnevenLatency::new());
    let client = client(&transport);

    let (first, second) = tokio::join!(
        client.toggle_checked(weekly(), milk(), true),
        client.toggle_checked(weekly(), milk(), false),
    );
    assert!(matches!(first.unwrap(), SubmitOutcome::Confirmed(_)));
    assert!(matches!(second.unwrap(), SubmitOutcome::Queued(_)));

    let report = client.drain().await.unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(report.stopped, StopReason::Drained);

    assert_eq!(transport.peak(), 1);
    assert_eq!(transport.checked_order(), vec![true, false]);
    assert!(!transport.server.item(&milk()).unwrap().checked);
}

#[tokio::test]
async fn test_drain_waits_for_inline_call() {
    let transport = Arc::new(UnevenLatency::new());
    let client = client(&transport);

    let (inline, report) = tokio::join!(client.toggle_checked(weekly(), milk(), true), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let queued = client.toggle_checked(weekly(), milk(), false).await.unwrap();
        assert!(matches!(queued, SubmitOutcome::Queued(_)));
        client.drain().await.unwrap()
    });

    assert!(matches!(inline.unwrap(), SubmitOutcome::Confirmed(_)));
    assert_eq!(report.replayed, 1);
    assert_eq!(transport.peak(), 1);
    assert_eq!(transport.checked_order(), vec![true, false]);
    assert!(client.queue().is_empty());
}
