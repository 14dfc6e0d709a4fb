use anyhow::{ensure, Context, Result};
use async_stream::stream;
use futures::stream::{Stream, StreamExt};
use pantry_core::{Actor, ItemId, ListId, ListItem, Mutation};
use pantry_queue::{MemoryBackend, MutationQueue};
use pantry_sync::{
    CacheKey, ClientConfigBuilder, MemoryServer, NetworkMonitor, SubmitOutcome, SyncClient,
    SyncConfigBuilder, SyncEvent, SyncTransport,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

/// Statistics collected during a simulation run
#[derive(Clone, Debug, Default)]
pub struct SimulationStats {
    pub devices: usize,
    pub edits_per_device: usize,
    pub confirmed_inline: usize,
    pub queued: usize,
    pub replayed: usize,
    pub conflicts: usize,
    pub discarded: usize,
    pub network_flips: usize,
    pub total_time: Duration,
    pub converged: bool,
}

impl SimulationStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Simulation Statistics                         ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Devices:                   {:>30} ║", self.devices);
        println!("║  Edits per Device:          {:>30} ║", self.edits_per_device);
        println!("║  Confirmed Inline:          {:>30} ║", self.confirmed_inline);
        println!("║  Queued Offline:            {:>30} ║", self.queued);
        println!("║  Replayed from Queue:       {:>30} ║", self.replayed);
        println!("║  Check Conflicts:           {:>30} ║", self.conflicts);
        println!("║  Discarded (gone/rejected): {:>30} ║", self.discarded);
        println!("║  Network Transitions:       {:>30} ║", self.network_flips);
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Converged:                 {:>30} ║", if self.converged { "yes" } else { "NO" });
        println!("╚════════════════════════════════════════════════════════════╝");
    }

    fn absorb(&mut self, events: &mut broadcast::Receiver<SyncEvent>) {
        loop {
            match events.try_recv() {
                Ok(SyncEvent::Replayed { .. }) => self.replayed += 1,
                Ok(SyncEvent::Conflict { .. }) => self.conflicts += 1,
                Ok(SyncEvent::Discarded { .. }) => self.discarded += 1,
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }
}

/// One thing a device does during the simulation
#[derive(Clone, Debug)]
enum Step {
    Edit { device: usize, mutation: Mutation },
    SetOnline { device: usize, online: bool },
}

fn item_id(n: usize) -> ItemId {
    ItemId::new(format!("item-{}", n))
}

/// Generator that yields a random schedule of edits and connectivity changes
fn schedule(
    devices: usize,
    edits_per_device: usize,
    items: usize,
    seed: u64,
) -> impl Stream<Item = Step> {
    stream! {
        let mut rng = StdRng::seed_from_u64(seed);
        let list = ListId::new("household");
        for round in 0..edits_per_device {
            for device in 0..devices {
                if rng.gen_bool(0.15) {
                    yield Step::SetOnline { device, online: rng.gen_bool(0.5) };
                }

                let item = item_id(rng.gen_range(0..items));
                let mutation = match rng.gen_range(0..100) {
                    0..=49 => Mutation::ToggleItemChecked {
                        list_id: list.clone(),
                        item_id: item,
                        checked: rng.gen_bool(0.6),
                        actor: Actor::new(format!("device-{}", device), format!("Device {}", device)),
                    },
                    50..=69 => Mutation::RenameItem {
                        list_id: list.clone(),
                        item_id: item,
                        name: format!("Item r{}d{}", round, device),
                    },
                    70..=84 => Mutation::SetItemQuantity {
                        list_id: list.clone(),
                        item_id: item,
                        quantity: Some(format!("{}", rng.gen_range(1..10))),
                    },
                    85..=92 => Mutation::CreateItem {
                        list_id: list.clone(),
                        item_id: item.clone(),
                        name: format!("Restocked {}", item),
                        quantity: None,
                    },
                    _ => Mutation::DeleteItem {
                        list_id: list.clone(),
                        item_id: item,
                    },
                };
                yield Step::Edit { device, mutation };
            }
        }
    }
}

/// Several devices edit one shared list while dropping on and off the
/// network, then reconnect and must all agree with the server.
pub async fn simulate_household(
    devices: usize,
    edits_per_device: usize,
    items: usize,
    seed: u64,
) -> Result<SimulationStats> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Shared List Simulation                              ║");
    println!(
        "║  Devices: {} | Edits/Device: {} | Items: {} | Seed: {}",
        devices, edits_per_device, items, seed
    );
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let mut stats = SimulationStats {
        devices,
        edits_per_device,
        ..SimulationStats::default()
    };

    let list = ListId::new("household");
    let server = Arc::new(MemoryServer::new());
    server.set_latency(Some(Duration::from_micros(200)));
    for n in 0..items {
        server.seed(ListItem::new(item_id(n), list.clone(), format!("Item {}", n)));
    }

    println!("\n[Phase 1/3] Starting devices...");
    let mut clients = Vec::with_capacity(devices);
    let mut handles = Vec::with_capacity(devices);
    let mut events = Vec::with_capacity(devices);
    for device in 0..devices {
        let config = ClientConfigBuilder::new()
            .actor(Actor::new(format!("device-{}", device), format!("Device {}", device)))
            .sync(
                SyncConfigBuilder::new()
                    .base_backoff(5)
                    .max_backoff(100)
                    .build(),
            )
            .build();
        let queue = MutationQueue::open(MemoryBackend::new())
            .with_context(|| format!("opening queue for device {}", device))?;
        let client = SyncClient::new(
            config,
            queue,
            Arc::clone(&server),
            Arc::new(NetworkMonitor::default()),
        );
        client.read(&CacheKey::ListItems(list.clone())).await?;
        events.push(client.events());
        handles.push(client.start());
        clients.push(client);
    }

    println!("[Phase 2/3] Editing with flaky connectivity...");
    let steps = schedule(devices, edits_per_device, items, seed);
    futures::pin_mut!(steps);
    let mut performed = 0usize;
    while let Some(step) = steps.next().await {
        match step {
            Step::SetOnline { device, online } => {
                if clients[device].network().is_online() != online {
                    stats.network_flips += 1;
                }
                clients[device].set_online(online);
            }
            Step::Edit { device, mutation } => {
                match clients[device].submit(mutation).await? {
                    SubmitOutcome::Confirmed(_) => stats.confirmed_inline += 1,
                    SubmitOutcome::Queued(_) => stats.queued += 1,
                    // Inline conflicts and discards reach the event stream too.
                    SubmitOutcome::Conflict(_) | SubmitOutcome::NotFound | SubmitOutcome::Rejected(_) => {}
                }
                performed += 1;
            }
        }

        tokio::task::yield_now().await;
        for rx in events.iter_mut() {
            stats.absorb(rx);
        }
        if performed > 0 && performed % 100 == 0 {
            println!("  Edits submitted: {}/{}", performed, devices * edits_per_device);
        }
    }

    println!("[Phase 3/3] Reconnecting and verifying convergence...");
    for client in &clients {
        client.set_online(true);
        client.sync_now();
    }
    for (device, client) in clients.iter().enumerate() {
        let mut status = client.watch_status();
        tokio::time::timeout(
            Duration::from_secs(10),
            status.wait_for(|s| s.queue_size == 0 && !s.is_processing),
        )
        .await
        .with_context(|| format!("device {} never drained its queue", device))??;
    }
    for handle in handles {
        handle.shutdown().await;
    }
    for rx in events.iter_mut() {
        stats.absorb(rx);
    }

    let key = CacheKey::ListItems(list.clone());
    let truth = server.fetch(&key).await?;
    let mut converged = true;
    for (device, client) in clients.iter().enumerate() {
        client.cache().invalidate(&key);
        let seen = client.read(&key).await?;
        if seen != truth {
            println!("  ✗ device {} diverged from the server", device);
            converged = false;
        }
    }
    stats.converged = converged;
    stats.total_time = start.elapsed();

    ensure!(stats.converged, "devices did not converge");
    Ok(stats)
}

/// Run the simulation at increasing device counts
pub async fn simulate_scaling(max_devices: usize, step: usize) -> Result<()> {
    println!("\nDevices | Edits | Queued | Replayed | Conflicts | Time (ms)");
    println!("--------|-------|--------|----------|-----------|----------");

    let mut devices = step.max(2);
    while devices <= max_devices {
        let stats = simulate_household(devices, 50, 12, devices as u64).await?;
        println!(
            "{:>7} | {:>5} | {:>6} | {:>8} | {:>9} | {:>9.1}",
            devices,
            devices * 50,
            stats.queued,
            stats.replayed,
            stats.conflicts,
            stats.total_time.as_secs_f64() * 1000.0
        );
        devices += step.max(1);
    }
    Ok(())
}
