//! Online/offline status observer.

use tokio::sync::watch;
use tracing::{info, warn};

/// Tracks whether the backend is reachable.
///
/// A transition to online is the trigger that lets the sync processor
/// drain the queue.
pub struct NetworkMonitor {
    online: watch::Sender<bool>,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (online, _) = watch::channel(initially_online);
        Self { online }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Report the current connectivity. Returns `true` if it changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            if online {
                info!("network: back online");
            } else {
                warn!("network: went offline");
            }
        }
        changed
    }

    /// Receiver that wakes on every transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    /// Resolve once the network is online (immediately if it already is).
    pub async fn wait_online(&self) {
        let mut rx = self.subscribe();
        // Sender is owned by self, so the channel cannot close while we wait.
        let _ = rx.wait_for(|online| *online).await;
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
