//! Notifications for queue-review and status surfaces.
//!
//! Two channels: a `watch` holding the current [`QueueStatus`] for banners
//! and badges, and a `broadcast` of [`SyncEvent`]s for toasts and logs.

use crate::processor::DrainReport;
use pantry_core::{CheckConflictResult, MutationId};
use tokio::sync::{broadcast, watch};

/// Snapshot of queue and connectivity state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub queue_size: usize,
    pub is_processing: bool,
    pub is_online: bool,
    pub last_error: Option<String>,
}

/// Why a queued mutation was dropped without being applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscardReason {
    /// The target no longer exists on the server.
    NotFound,
    /// The server refused the request as invalid.
    Rejected(String),
    /// The user removed it from the pending-changes screen.
    ByUser,
}

/// How loudly an event should reach the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Escalation {
    /// Nothing shown.
    Silent,
    /// Reflected in a status indicator only.
    Passive,
    /// Informational toast.
    Notice,
    /// Error the user can act on.
    Actionable,
}

/// Something the sync engine wants observers to know about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    NetworkChanged {
        online: bool,
    },
    QueueChanged {
        size: usize,
    },
    ProcessingStarted {
        pending: usize,
    },
    ProcessingFinished {
        report: DrainReport,
    },
    Replayed {
        id: MutationId,
        label: String,
    },
    /// Someone else holds the check. `id` is `None` for inline submissions.
    Conflict {
        id: Option<MutationId>,
        result: CheckConflictResult,
    },
    Discarded {
        id: Option<MutationId>,
        label: String,
        reason: DiscardReason,
    },
    ReplayFailed {
        id: MutationId,
        label: String,
        error: String,
        retry_count: u32,
    },
    /// A mutation kept failing transiently past the retry budget.
    RetryExhausted {
        id: MutationId,
        label: String,
        retry_count: u32,
    },
}

impl SyncEvent {
    pub fn escalation(&self) -> Escalation {
        match self {
            SyncEvent::Replayed { .. }
            | SyncEvent::QueueChanged { .. }
            | SyncEvent::ProcessingStarted { .. }
            | SyncEvent::ProcessingFinished { .. } => Escalation::Silent,
            SyncEvent::NetworkChanged { .. } | SyncEvent::ReplayFailed { .. } => Escalation::Passive,
            SyncEvent::Conflict { .. } => Escalation::Notice,
            SyncEvent::Discarded { reason, .. } => match reason {
                DiscardReason::NotFound | DiscardReason::ByUser => Escalation::Silent,
                DiscardReason::Rejected(_) => Escalation::Actionable,
            },
            SyncEvent::RetryExhausted { .. } => Escalation::Actionable,
        }
    }

    /// Text for a toast, if the event warrants one.
    pub fn user_message(&self) -> Option<String> {
        if self.escalation() < Escalation::Notice {
            return None;
        }
        match self {
            SyncEvent::Conflict { result, .. } => Some(match &result.conflict_user {
                Some(holder) => format!(
                    "{} was already checked off by {}",
                    result.item_name, holder.display_name
                ),
                None => format!("{} was already checked off", result.item_name),
            }),
            SyncEvent::Discarded {
                label,
                reason: DiscardReason::Rejected(why),
                ..
            } => Some(format!("Could not sync \"{}\": {}", label, why)),
            SyncEvent::RetryExhausted {
                label, retry_count, ..
            } => Some(format!(
                "\"{}\" failed to sync after {} attempts",
                label, retry_count
            )),
            _ => None,
        }
    }
}

/// Observer fan-out owned by the composition root.
pub struct NotificationBus {
    events: broadcast::Sender<SyncEvent>,
    status: watch::Sender<QueueStatus>,
}

impl NotificationBus {
    pub fn new(initial: QueueStatus) -> Self {
        let (events, _) = broadcast::channel(256);
        let (status, _) = watch::channel(initial);
        Self { events, status }
    }

    pub fn publish(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> QueueStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<QueueStatus> {
        self.status.subscribe()
    }

    /// Modify the status, waking watchers only if it actually changed.
    pub fn update_status(&self, f: impl FnOnce(&mut QueueStatus)) -> bool {
        self.status.send_if_modified(|status| {
            let before = status.clone();
            f(status);
            *status != before
        })
    }

    pub fn set_queue_size(&self, size: usize) {
        self.update_status(|s| s.queue_size = size);
        self.publish(SyncEvent::QueueChanged { size });
    }

    pub fn set_processing(&self, processing: bool) {
        self.update_status(|s| s.is_processing = processing);
    }

    pub fn set_online(&self, online: bool) {
        if self.update_status(|s| s.is_online = online) {
            self.publish(SyncEvent::NetworkChanged { online });
        }
    }

    pub fn set_last_error(&self, error: Option<String>) {
        self.update_status(|s| s.last_error = error);
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(QueueStatus::default())
    }
}
