//! Offline editing, restart and ordered replay.

use pantry_core::{Actor, ItemId, ListId, ListItem, Mutation};
use pantry_queue::{FileBackend, MutationQueue};
use pantry_sync::{
    CacheKey, ClientConfig, ClientConfigBuilder, MemoryServer, NetworkMonitor, StopReason,
    SubmitOutcome, SyncClient, SyncConfigBuilder, SyncEvent, TransportError,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn weekly() -> ListId {
    ListId::new("weekly")
}

fn milk() -> ItemId {
    ItemId::new("milk")
}

fn config(actor: Actor) -> ClientConfig {
    ClientConfigBuilder::new()
        .actor(actor)
        .sync(
            SyncConfigBuilder::new()
                .base_backoff(10)
                .max_backoff(50)
                .jitter(false)
                .build(),
        )
        .build()
}

fn seeded_server() -> Arc<MemoryServer> {
    let server = Arc::new(MemoryServer::new());
    server.seed(ListItem::new(milk(), weekly(), "Milk"));
    server.seed(ListItem::new(ItemId::new("eggs"), weekly(), "Eggs"));
    server
}

fn client_on(server: &Arc<MemoryServer>, queue: MutationQueue, actor: Actor) -> SyncClient<MemoryServer> {
    SyncClient::new(
        config(actor),
        queue,
        Arc::clone(server),
        Arc::new(NetworkMonitor::default()),
    )
}

fn rename(item: &str, name: &str) -> Mutation {
    Mutation::RenameItem {
        list_id: weekly(),
        item_id: ItemId::new(item),
        name: name.to_string(),
    }
}

#[tokio::test]
async fn test_offline_edits_replay_in_order() {
    let server = seeded_server();
    let client = client_on(
        &server,
        MutationQueue::open(pantry_queue::MemoryBackend::new()).unwrap(),
        Actor::new("alice", "Alice"),
    );
    let list = CacheKey::ListItems(weekly());
    client.read(&list).await.unwrap();

    client.set_online(false);
    client
        .submit(Mutation::CreateItem {
            list_id: weekly(),
            item_id: ItemId::new("tea"),
            name: "Tea".into(),
            quantity: Some("1 box".into()),
        })
        .await
        .unwrap();
    client.toggle_checked(weekly(), milk(), true).await.unwrap();
    client.submit(rename("eggs", "Free-range eggs")).await.unwrap();

    // Optimistic state is visible before anything reached the server.
    let cached = client.cache().get(&list).unwrap();
    let items = cached.as_items().unwrap();
    assert_eq!(items.len(), 3);
    assert!(items.iter().any(|i| i.id == milk() && i.checked));
    assert!(server.applied().is_empty());
    assert_eq!(client.status().queue_size, 3);

    let mut events = client.events();
    client.set_online(true);
    let report = client.drain().await.unwrap();

    assert_eq!(report.replayed, 3);
    assert_eq!(report.stopped, StopReason::Drained);
    assert_eq!(report.remaining, 0);
    let operations: Vec<_> = server.applied().iter().map(|m| m.operation()).collect();
    assert_eq!(operations, vec!["create-item", "toggle-item-checked", "rename-item"]);
    assert_eq!(server.item(&ItemId::new("tea")).unwrap().quantity.as_deref(), Some("1 box"));

    let mut replayed = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SyncEvent::Replayed { .. }) {
            replayed += 1;
        }
    }
    assert_eq!(replayed, 3);

    let fresh = client.read(&list).await.unwrap().unwrap();
    assert_eq!(
        fresh.as_items().unwrap().iter().find(|i| i.id == ItemId::new("eggs")).unwrap().name,
        "Free-range eggs"
    );
}

#[tokio::test]
async fn test_stacked_renames_replay_once() {
    let server = seeded_server();
    let client = client_on(
        &server,
        MutationQueue::open(pantry_queue::MemoryBackend::new()).unwrap(),
        Actor::new("alice", "Alice"),
    );

    client.set_online(false);
    client.submit(rename("milk", "Whole milk")).await.unwrap();
    client.submit(rename("milk", "Oat milk")).await.unwrap();
    assert_eq!(client.pending().len(), 1);

    client.set_online(true);
    client.drain().await.unwrap();
    assert_eq!(server.applied(), vec![rename("milk", "Oat milk")]);
}

#[tokio::test]
async fn test_transient_failure_halts_and_keeps_order() {
    let server = seeded_server();
    let client = client_on(
        &server,
        MutationQueue::open(pantry_queue::MemoryBackend::new()).unwrap(),
        Actor::new("alice", "Alice"),
    );

    client.set_online(false);
    client.toggle_checked(weekly(), milk(), true).await.unwrap();
    client.toggle_checked(weekly(), milk(), false).await.unwrap();
    client.set_online(true);

    server.fail_next(TransportError::from_status(503, "maintenance"));
    let report = client.drain().await.unwrap();
    assert_eq!(report.replayed, 0);
    assert!(matches!(
        report.stopped,
        StopReason::TransientFailure { retry_at: Some(_) }
    ));

    let pending = client.pending();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].retry_count, 1);
    assert!(pending[0].last_error.as_deref().unwrap().contains("503"));
    assert_eq!(client.status().last_error.as_deref(), Some("Server error 503: maintenance"));

    let report = client.drain().await.unwrap();
    assert_eq!(report.replayed, 2);
    assert!(!server.item(&milk()).unwrap().checked);
    assert_eq!(client.status().last_error, None);
}

#[tokio::test]
async fn test_offline_drain_does_nothing() {
    let server = seeded_server();
    let client = client_on(
        &server,
        MutationQueue::open(pantry_queue::MemoryBackend::new()).unwrap(),
        Actor::new("alice", "Alice"),
    );
    client.set_online(false);
    client.toggle_checked(weekly(), milk(), true).await.unwrap();

    let report = client.drain().await.unwrap();
    assert_eq!(report.stopped, StopReason::Offline);
    assert_eq!(report.remaining, 1);
    assert!(server.applied().is_empty());
}

#[tokio::test]
async fn test_queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.json");
    let server = seeded_server();

    let before = {
        let client = client_on(
            &server,
            MutationQueue::open(FileBackend::new(path.clone())).unwrap(),
            Actor::new("alice", "Alice"),
        );
        client.set_online(false);
        client.toggle_checked(weekly(), milk(), true).await.unwrap();
        client.submit(rename("eggs", "Brown eggs")).await.unwrap();
        client.queue().list()
    };

    // Simulated restart: new queue, new client, same file.
    let queue = MutationQueue::open(FileBackend::new(path.clone())).unwrap();
    assert_eq!(queue.list(), before);

    let client = client_on(&server, queue, Actor::new("alice", "Alice"));
    assert_eq!(client.status().queue_size, 2);
    let report = client.drain().await.unwrap();
    assert_eq!(report.replayed, 2);
    assert!(server.item(&milk()).unwrap().checked);
    assert!(MutationQueue::open(FileBackend::new(path.clone())).unwrap().is_empty());
}

#[tokio::test]
async fn test_background_loop_drains_on_reconnect() {
    let server = seeded_server();
    let client = client_on(
        &server,
        MutationQueue::open(pantry_queue::MemoryBackend::new()).unwrap(),
        Actor::new("alice", "Alice"),
    );
    let handle = client.start();

    client.set_online(false);
    let outcome = client.submit(rename("milk", "Skimmed milk")).await.unwrap();
    assert!(matches!(outcome, SubmitOutcome::Queued(_)));

    client.set_online(true);
    let mut status = client.watch_status();
    tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| s.queue_size == 0 && !s.is_processing),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(server.item(&milk()).unwrap().name, "Skimmed milk");
    handle.shutdown().await;
}

#[tokio::test]
async fn test_background_loop_retries_after_backoff() {
    let server = seeded_server();
    let client = client_on(
        &server,
        MutationQueue::open(pantry_queue::MemoryBackend::new()).unwrap(),
        Actor::new("alice", "Alice"),
    );
    let handle = client.start();

    // One failure for the inline attempt, one for the first replay.
    server.fail_next(TransportError::Network("reset".into()));
    server.fail_next(TransportError::Network("reset".into()));
    let outcome = client.submit(rename("milk", "Goat milk")).await.unwrap();
    assert!(matches!(outcome, SubmitOutcome::Queued(_)));

    let mut status = client.watch_status();
    tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| s.queue_size == 0 && !s.is_processing),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(server.item(&milk()).unwrap().name, "Goat milk");
    handle.shutdown().await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn replay_order_matches_enqueue_order(
        toggles in prop::collection::vec(any::<bool>(), 1..12),
        failures in prop::collection::vec(any::<bool>(), 0..24),
    ) {
        tokio_test::block_on(async {
            let server = seeded_server();
            let client = client_on(
                &server,
                MutationQueue::open(pantry_queue::MemoryBackend::new()).unwrap(),
                Actor::new("alice", "Alice"),
            );

            client.set_online(false);
            let mut expected = Vec::new();
            for checked in &toggles {
                let mutation = Mutation::ToggleItemChecked {
                    list_id: weekly(),
                    item_id: milk(),
                    checked: *checked,
                    actor: client.actor().clone(),
                };
                client.submit(mutation.clone()).await.unwrap();
                expected.push(mutation);
            }
            client.set_online(true);

            let mut failures = failures.into_iter();
            while !client.queue().is_empty() {
                if failures.next().unwrap_or(false) {
                    server.fail_next(TransportError::from_status(502, "bad gateway"));
                }
                client.drain().await.unwrap();
            }

            assert_eq!(server.applied(), expected);
            assert_eq!(server.item(&milk()).unwrap().checked, *toggles.last().unwrap());
        });
    }
}
