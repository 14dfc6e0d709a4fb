//! # Pantry Review
//!
//! A standalone CLI over a persisted Pantry mutation queue: the "review
//! pending changes" surface of a client, plus a scripted demo of offline
//! editing, replay and a check conflict between two devices.
//!
//! ```text
//! pantry-review --queue ./queue.json list
//! pantry-review --queue ./queue.json discard 01HV3K...
//! pantry-review --queue ./queue.json clear
//! pantry-review demo
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::*;
use pantry_core::{Actor, ItemId, ListId, ListItem, Mutation, MutationId, QueuedMutation};
use pantry_queue::{FileBackend, MemoryBackend, MutationQueue};
use pantry_sync::{
    CacheKey, ClientConfigBuilder, MemoryServer, NetworkMonitor, SubmitOutcome, SyncClient,
    SyncEvent,
};
use tracing_subscriber::EnvFilter;

// ─── CLI ───────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "pantry-review")]
#[command(about = "Review, discard and replay pending offline changes")]
#[command(version)]
struct Cli {
    /// Path of the persisted mutation queue
    #[arg(long, global = true, default_value = "pantry-queue.json")]
    queue: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List pending changes, oldest first
    List,
    /// Discard one pending change by id
    Discard { id: String },
    /// Discard every pending change
    Clear,
    /// Summarize the queue
    Stats,
    /// Two devices edit offline, reconnect, and race for the same item
    Demo,
}

// ─── Output helpers ────────────────────────────────────────────────────────

fn header(text: &str) {
    let bar = "═".repeat(60);
    println!("\n{}", bar.bright_cyan());
    println!("  {}", text.bold().bright_white());
    println!("{}", bar.bright_cyan());
}

fn section(text: &str) {
    println!("\n{} {}", "▸".bright_yellow(), text.bold());
}

fn step(text: &str) {
    println!("  {} {}", "•".bright_green(), text);
}

fn age(entry: &QueuedMutation) -> String {
    let secs = entry.age(Utc::now()).num_seconds().max(0);
    match secs {
        0..=59 => format!("{}s", secs),
        60..=3599 => format!("{}m", secs / 60),
        3600..=86_399 => format!("{}h", secs / 3600),
        _ => format!("{}d", secs / 86_400),
    }
}

fn print_entries(entries: &[QueuedMutation]) {
    if entries.is_empty() {
        println!("  {}", "(no pending changes)".dimmed());
        return;
    }
    println!(
        "  {:<26}  {:>5}  {:>7}  {}",
        "ID".bold(),
        "AGE".bold(),
        "RETRIES".bold(),
        "CHANGE".bold()
    );
    for entry in entries {
        let retries = if entry.retry_count > 0 {
            entry.retry_count.to_string().bright_red().to_string()
        } else {
            "0".dimmed().to_string()
        };
        println!(
            "  {:<26}  {:>5}  {:>7}  {}",
            entry.id.to_string(),
            age(entry),
            retries,
            entry.label()
        );
        if let Some(err) = &entry.last_error {
            println!("  {:<26}  {} {}", "", "last error:".dimmed(), err.bright_red());
        }
    }
}

fn open_queue(path: &PathBuf) -> Result<MutationQueue> {
    MutationQueue::open(FileBackend::new(path.clone()))
        .with_context(|| format!("opening queue at {}", path.display()))
}

// ─── Review commands ───────────────────────────────────────────────────────

fn run_list(path: &PathBuf) -> Result<()> {
    let queue = open_queue(path)?;
    header(&format!("Pending changes ({})", queue.len()));
    print_entries(&queue.list());
    Ok(())
}

fn run_discard(path: &PathBuf, id: &str) -> Result<()> {
    let queue = open_queue(path)?;
    let id: MutationId = id
        .parse()
        .with_context(|| format!("'{}' is not a mutation id", id))?;
    let Some(entry) = queue.get(&id) else {
        bail!("no pending change with id {}", id);
    };
    queue.remove(&id)?;
    println!(
        "  {} Discarded {} ({} left)",
        "✓".bright_green().bold(),
        entry.label().bold(),
        queue.len()
    );
    Ok(())
}

fn run_clear(path: &PathBuf) -> Result<()> {
    let queue = open_queue(path)?;
    let count = queue.len();
    queue.clear()?;
    println!(
        "  {} Discarded {} pending change(s)",
        "✓".bright_green().bold(),
        count
    );
    Ok(())
}

fn run_stats(path: &PathBuf) -> Result<()> {
    let queue = open_queue(path)?;
    let entries = queue.list();
    header("Queue statistics");
    step(&format!("File: {}", path.display()));
    step(&format!("Pending: {}", entries.len()));

    let mut by_operation: Vec<(&'static str, usize)> = Vec::new();
    for entry in &entries {
        match by_operation.iter_mut().find(|(op, _)| *op == entry.operation()) {
            Some((_, n)) => *n += 1,
            None => by_operation.push((entry.operation(), 1)),
        }
    }
    for (operation, count) in by_operation {
        println!("      {:<22} {}", operation, count);
    }

    if let Some(oldest) = entries.first() {
        step(&format!("Oldest: {} ({} ago)", oldest.label(), age(oldest)));
    }
    let failing = entries.iter().filter(|e| e.retry_count > 0).count();
    if failing > 0 {
        step(&format!("{} change(s) have failed at least once", failing).bright_red().to_string());
    }
    Ok(())
}

// ─── Demo ──────────────────────────────────────────────────────────────────

fn report_events(device: &str, events: &mut tokio::sync::broadcast::Receiver<SyncEvent>) {
    while let Ok(event) = events.try_recv() {
        match &event {
            SyncEvent::Replayed { label, .. } => step(&format!("{}: replayed {}", device, label)),
            _ => {
                if let Some(message) = event.user_message() {
                    println!("  {} {}: {}", "!".bright_yellow(), device, message);
                }
            }
        }
    }
}

fn device(
    server: &Arc<MemoryServer>,
    actor: Actor,
    queue: MutationQueue,
) -> SyncClient<MemoryServer> {
    SyncClient::new(
        ClientConfigBuilder::new().actor(actor).build(),
        queue,
        Arc::clone(server),
        Arc::new(NetworkMonitor::default()),
    )
}

async fn run_demo(path: &PathBuf) -> Result<()> {
    header("Offline replay with a check conflict");

    let list = ListId::new("weekly");
    let server = Arc::new(MemoryServer::new());
    for (id, name) in [("milk", "Milk"), ("eggs", "Eggs"), ("bread", "Bread")] {
        server.seed(ListItem::new(ItemId::new(id), list.clone(), name));
    }

    // Alice's queue is written to disk so it can be inspected afterwards.
    let alice = device(&server, Actor::new("alice", "Alice"), open_queue(path)?);
    let bob = device(
        &server,
        Actor::new("bob", "Bob"),
        MutationQueue::open(MemoryBackend::new())?,
    );
    let mut alice_events = alice.events();
    let mut bob_events = bob.events();

    section("Both phones lose signal in the supermarket");
    alice.set_online(false);
    bob.set_online(false);

    alice
        .toggle_checked(list.clone(), ItemId::new("milk"), true)
        .await?;
    alice
        .submit(Mutation::SetItemQuantity {
            list_id: list.clone(),
            item_id: ItemId::new("eggs"),
            quantity: Some("12".into()),
        })
        .await?;
    step("Alice checks off Milk and sets Eggs to 12");

    bob.toggle_checked(list.clone(), ItemId::new("milk"), true)
        .await?;
    bob.toggle_checked(list.clone(), ItemId::new("bread"), true)
        .await?;
    step("Bob checks off Milk and Bread");

    section(&format!("Alice's pending changes ({})", path.display()));
    print_entries(&alice.queue().list());

    section("Alice reconnects first");
    alice.set_online(true);
    let report = alice.drain().await?;
    report_events("alice", &mut alice_events);
    step(&format!("replayed {}, conflicts {}", report.replayed, report.conflicts));

    section("Bob reconnects");
    bob.set_online(true);
    let report = bob.drain().await?;
    report_events("bob", &mut bob_events);
    step(&format!("replayed {}, conflicts {}", report.replayed, report.conflicts));

    section("Bob's list after refetch");
    let items = bob.read(&CacheKey::ListItems(list.clone())).await?;
    for item in items.as_ref().and_then(|v| v.as_items()).unwrap_or_default() {
        let mark = if item.checked { "☑" } else { "☐" };
        let by = item
            .checked_by
            .as_ref()
            .map(|a| format!(" (by {})", a.display_name))
            .unwrap_or_default();
        println!("    {} {}{}", mark, item.name, by.dimmed());
    }

    section("Bob unchecks Milk and takes it over");
    bob.toggle_checked(list.clone(), ItemId::new("milk"), false)
        .await?;
    match bob.toggle_checked(list.clone(), ItemId::new("milk"), true).await? {
        SubmitOutcome::Confirmed(_) => step("Milk is now Bob's"),
        other => println!("  {} unexpected outcome: {:?}", "✗".bright_red(), other),
    }

    let holder = server
        .item(&ItemId::new("milk"))
        .and_then(|i| i.checked_by)
        .map(|a| a.display_name);
    let converged = holder.as_deref() == Some("Bob") && alice.pending().is_empty() && bob.pending().is_empty();
    if converged {
        println!("\n  {} {}", "✓".bright_green().bold(), "All queues drained".bright_green().bold());
    } else {
        println!("\n  {} {}", "✗".bright_red().bold(), "Demo ended in an unexpected state".bright_red().bold());
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List => run_list(&cli.queue),
        Commands::Discard { id } => run_discard(&cli.queue, &id),
        Commands::Clear => run_clear(&cli.queue),
        Commands::Stats => run_stats(&cli.queue),
        Commands::Demo => run_demo(&cli.queue).await,
    }
}
