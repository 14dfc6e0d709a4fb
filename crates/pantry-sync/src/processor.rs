//! The sync processor: drains the mutation queue against the transport.

use crate::backoff::RetryPolicy;
use crate::bus::{DiscardReason, NotificationBus, SyncEvent};
use crate::error::{FailureClass, Result, TransportError};
use crate::network::NetworkMonitor;
use crate::optimistic::OptimisticCoordinator;
use crate::projection;
use crate::transport::{SyncTransport, TransportOutcome};
use chrono::{DateTime, Utc};
use pantry_core::{Mutation, QueuedMutation};
use pantry_queue::MutationQueue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Configuration for replay behavior.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Transient failures tolerated before the user is told.
    pub max_retries: u32,
    /// First retry delay (in milliseconds).
    pub base_backoff_ms: u64,
    /// Upper bound on the retry delay (in milliseconds).
    pub max_backoff_ms: u64,
    /// Add up to 20% random jitter to retry delays.
    pub jitter: bool,
    /// Drain automatically on reconnect and when the backoff timer fires.
    pub auto_sync: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            jitter: true,
            auto_sync: true,
        }
    }
}

impl SyncConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.base_backoff_ms, self.max_backoff_ms, self.jitter)
    }
}

/// Builder for sync configuration.
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn base_backoff(mut self, ms: u64) -> Self {
        self.config.base_backoff_ms = ms;
        self
    }

    pub fn max_backoff(mut self, ms: u64) -> Self {
        self.config.max_backoff_ms = ms;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.config.jitter = enabled;
        self
    }

    pub fn auto_sync(mut self, enabled: bool) -> Self {
        self.config.auto_sync = enabled;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a drain run ended.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum StopReason {
    /// The queue is empty.
    #[default]
    Drained,
    /// The device went offline.
    Offline,
    /// The head entry failed transiently. `retry_at` is `None` once the
    /// retry budget is spent and only a reconnect or manual sync retries.
    TransientFailure { retry_at: Option<DateTime<Utc>> },
    /// The queue was cleared during the run.
    Cancelled,
    /// Another run was already in progress.
    AlreadyRunning,
}

/// Summary of one drain run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub replayed: usize,
    pub conflicts: usize,
    pub discarded: usize,
    pub remaining: usize,
    pub stopped: StopReason,
}

impl DrainReport {
    fn stopped(reason: StopReason, remaining: usize) -> Self {
        Self {
            remaining,
            stopped: reason,
            ..Self::default()
        }
    }
}

/// Clears the processing flag however the run ends.
struct ProcessingGuard<'a> {
    flag: &'a AtomicBool,
    bus: &'a NotificationBus,
}

impl<'a> ProcessingGuard<'a> {
    fn acquire(flag: &'a AtomicBool, bus: &'a NotificationBus) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        bus.set_processing(true);
        Some(Self { flag, bus })
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
        self.bus.set_processing(false);
    }
}

/// Replays queued mutations one at a time, oldest first.
pub struct SyncProcessor<T: SyncTransport> {
    queue: Arc<MutationQueue>,
    transport: Arc<T>,
    network: Arc<NetworkMonitor>,
    coordinator: OptimisticCoordinator,
    bus: Arc<NotificationBus>,
    config: SyncConfig,
    policy: RetryPolicy,
    processing: AtomicBool,
    /// Held for every transport call so at most one mutation is in flight.
    flight: AsyncMutex<()>,
    trigger: Notify,
    next_retry: Mutex<Option<Instant>>,
}

impl<T: SyncTransport> SyncProcessor<T> {
    pub fn new(
        queue: Arc<MutationQueue>,
        transport: Arc<T>,
        network: Arc<NetworkMonitor>,
        coordinator: OptimisticCoordinator,
        bus: Arc<NotificationBus>,
        config: SyncConfig,
    ) -> Self {
        Self {
            policy: config.retry_policy(),
            queue,
            transport,
            network,
            coordinator,
            bus,
            config,
            processing: AtomicBool::new(false),
            flight: AsyncMutex::new(()),
            trigger: Notify::new(),
            next_retry: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// When the backoff timer will next retry the head entry, if armed.
    pub fn next_retry(&self) -> Option<Instant> {
        *self.next_retry.lock()
    }

    /// Claim the in-flight slot for an inline submit without waiting.
    ///
    /// Returns `None` while a replay run or another inline call holds it.
    pub(crate) fn try_claim_flight(&self) -> Option<AsyncMutexGuard<'_, ()>> {
        if self.is_processing() {
            return None;
        }
        self.flight.try_lock().ok()
    }

    /// Ask the background loop to drain now, ignoring any backoff timer.
    pub fn sync_now(&self) {
        self.trigger.notify_one();
    }

    /// Replay queued mutations until the queue is empty, the device goes
    /// offline, the head entry fails transiently, or the queue is cleared.
    pub async fn drain(&self) -> Result<DrainReport> {
        let Some(_guard) = ProcessingGuard::acquire(&self.processing, &self.bus) else {
            debug!("drain already running");
            return Ok(DrainReport::stopped(StopReason::AlreadyRunning, self.queue.len()));
        };
        let _flight = self.flight.lock().await;
        if !self.network.is_online() {
            return Ok(DrainReport::stopped(StopReason::Offline, self.queue.len()));
        }
        if self.queue.is_empty() {
            return Ok(DrainReport::default());
        }

        *self.next_retry.lock() = None;
        let epoch = self.queue.epoch();
        let pending = self.queue.len();
        info!(pending, "sync run started");
        self.bus.publish(SyncEvent::ProcessingStarted { pending });

        let mut report = DrainReport::default();
        let stopped = loop {
            if self.queue.epoch() != epoch {
                break StopReason::Cancelled;
            }
            if !self.network.is_online() {
                break StopReason::Offline;
            }
            let Some(entry) = self.queue.peek() else {
                break StopReason::Drained;
            };

            debug!(
                mutation_id = %entry.id,
                operation = entry.operation(),
                retry_count = entry.retry_count,
                "replaying mutation"
            );
            self.queue.mark_in_flight(&entry.id);
            let result = self.transport.execute(&entry.mutation).await;
            self.queue.clear_in_flight();

            if self.queue.epoch() != epoch {
                debug!(mutation_id = %entry.id, "queue cleared during replay, dropping result");
                break StopReason::Cancelled;
            }
            if !self.queue.contains(&entry.id) {
                debug!(mutation_id = %entry.id, "entry discarded during replay, dropping result");
                self.coordinator.invalidate(&entry.mutation);
                continue;
            }

            match result {
                Ok(outcome) => self.settle(&entry, outcome, &mut report)?,
                Err(err) => {
                    if let Some(reason) = self.fail(&entry, err, &mut report).await? {
                        break reason;
                    }
                }
            }
        };

        report.stopped = stopped;
        report.remaining = self.queue.len();
        info!(
            replayed = report.replayed,
            conflicts = report.conflicts,
            discarded = report.discarded,
            remaining = report.remaining,
            stopped = ?report.stopped,
            "sync run finished"
        );
        self.bus.publish(SyncEvent::ProcessingFinished {
            report: report.clone(),
        });
        Ok(report)
    }

    fn settle(
        &self,
        entry: &QueuedMutation,
        outcome: TransportOutcome,
        report: &mut DrainReport,
    ) -> Result<()> {
        self.queue.remove(&entry.id)?;
        match outcome {
            TransportOutcome::Confirmed(item) => {
                report.replayed += 1;
                if let Some(item) = item {
                    self.coordinator.absorb_confirmed(&item, &self.queue.list());
                }
                self.bus.set_last_error(None);
                self.bus.publish(SyncEvent::Replayed {
                    id: entry.id,
                    label: entry.label(),
                });
            }
            TransportOutcome::Conflict(result) => {
                report.conflicts += 1;
                warn!(
                    mutation_id = %entry.id,
                    item_id = %result.item_id,
                    holder = ?result.conflict_user.as_ref().map(|a| a.id.as_str()),
                    "check conflict, not retrying"
                );
                self.bus.publish(SyncEvent::Conflict {
                    id: Some(entry.id),
                    result,
                });
            }
        }
        self.coordinator.invalidate(&entry.mutation);
        Ok(())
    }

    /// Handle a failed replay. Returns the stop reason if the run must halt.
    async fn fail(
        &self,
        entry: &QueuedMutation,
        err: TransportError,
        report: &mut DrainReport,
    ) -> Result<Option<StopReason>> {
        match err.class() {
            FailureClass::Transient => {
                let retry_count = self.queue.record_failure(&entry.id, err.to_string())?;
                warn!(
                    mutation_id = %entry.id,
                    operation = entry.operation(),
                    retry_count,
                    error = %err,
                    "transient replay failure"
                );
                self.bus.set_last_error(Some(err.to_string()));
                self.bus.publish(SyncEvent::ReplayFailed {
                    id: entry.id,
                    label: entry.label(),
                    error: err.to_string(),
                    retry_count,
                });

                if retry_count > self.config.max_retries {
                    if retry_count == self.config.max_retries + 1 {
                        error!(mutation_id = %entry.id, retry_count, "retry budget exhausted");
                        self.bus.publish(SyncEvent::RetryExhausted {
                            id: entry.id,
                            label: entry.label(),
                            retry_count,
                        });
                    }
                    return Ok(Some(StopReason::TransientFailure { retry_at: None }));
                }

                let delay = self.policy.delay(retry_count);
                *self.next_retry.lock() = Some(Instant::now() + delay);
                let retry_at = chrono::Duration::from_std(delay).ok().map(|d| Utc::now() + d);
                Ok(Some(StopReason::TransientFailure { retry_at }))
            }
            FailureClass::NotFound => {
                self.queue.remove(&entry.id)?;
                report.discarded += 1;
                debug!(mutation_id = %entry.id, "target gone, dropping mutation");
                self.bus.publish(SyncEvent::Discarded {
                    id: Some(entry.id),
                    label: entry.label(),
                    reason: DiscardReason::NotFound,
                });
                self.refresh(&entry.mutation).await;
                Ok(None)
            }
            FailureClass::Permanent => {
                self.queue.remove(&entry.id)?;
                report.discarded += 1;
                error!(
                    mutation_id = %entry.id,
                    operation = entry.operation(),
                    error = %err,
                    "mutation rejected, dropping"
                );
                self.bus.set_last_error(Some(err.to_string()));
                self.bus.publish(SyncEvent::Discarded {
                    id: Some(entry.id),
                    label: entry.label(),
                    reason: DiscardReason::Rejected(err.to_string()),
                });
                self.refresh(&entry.mutation).await;
                Ok(None)
            }
        }
    }

    /// Silently refetch what `mutation` touched, keeping pending intent.
    pub(crate) async fn refresh(&self, mutation: &Mutation) {
        let keys = projection::affected_keys(mutation);
        let result = self
            .coordinator
            .cache()
            .reconcile(self.transport.as_ref(), &keys, &self.queue.list())
            .await;
        if let Err(e) = result {
            debug!(error = %e, "refresh failed, leaving regions stale");
            self.coordinator.invalidate(mutation);
        }
    }

    async fn run_once(&self) {
        match self.drain().await {
            Ok(report) => debug!(stopped = ?report.stopped, "background drain done"),
            Err(e) => {
                error!(error = %e, "background drain failed");
                self.bus.set_last_error(Some(e.to_string()));
            }
        }
    }

    /// Run the background loop: drain on reconnect, on [`sync_now`](Self::sync_now)
    /// and when the backoff timer fires.
    pub fn spawn(self: &Arc<Self>) -> SyncHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let processor = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut online = processor.network.subscribe();
            processor.bus.set_online(*online.borrow_and_update());
            if processor.config.auto_sync {
                processor.run_once().await;
            }

            loop {
                let retry_at = processor.next_retry();
                let backoff = async move {
                    match retry_at {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => futures::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let is_online = *online.borrow_and_update();
                        processor.bus.set_online(is_online);
                        if is_online && processor.config.auto_sync {
                            processor.run_once().await;
                        }
                    }
                    _ = processor.trigger.notified() => processor.run_once().await,
                    _ = backoff, if processor.config.auto_sync => {
                        *processor.next_retry.lock() = None;
                        processor.run_once().await;
                    }
                }
            }
            debug!("sync loop stopped");
        });

        SyncHandle { shutdown, task }
    }
}

/// Handle to a running background loop.
pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
