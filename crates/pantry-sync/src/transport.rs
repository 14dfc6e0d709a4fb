//! Transport abstraction between the sync engine and the backend.

use crate::cache::{CacheKey, CacheValue};
use crate::error::TransportError;
use async_trait::async_trait;
use pantry_core::{CheckConflictResult, CheckLedger, CoreError, ListItem, Mutation};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Successful outcome of executing a mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportOutcome {
    /// Applied. Carries the server's copy of the item when there is one.
    Confirmed(Option<ListItem>),
    /// Rejected as a check race. Nothing changed on the server.
    Conflict(CheckConflictResult),
}

/// Executes mutations against the backend and reads server state.
#[async_trait]
pub trait SyncTransport: Send + Sync + 'static {
    /// Execute one mutation.
    async fn execute(&self, mutation: &Mutation) -> Result<TransportOutcome, TransportError>;

    /// Read the authoritative value of a cache region.
    async fn fetch(&self, key: &CacheKey) -> Result<Option<CacheValue>, TransportError>;
}

/// In-process backend for tests and simulations.
///
/// Holds items in a [`CheckLedger`], so check races are arbitrated exactly
/// as the real server does. Reachability, latency and one-shot failures
/// can be scripted.
pub struct MemoryServer {
    ledger: Mutex<CheckLedger>,
    reachable: AtomicBool,
    latency: Mutex<Option<Duration>>,
    scripted_failures: Mutex<VecDeque<TransportError>>,
    applied: Mutex<Vec<Mutation>>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self {
            ledger: Mutex::new(CheckLedger::new()),
            reachable: AtomicBool::new(true),
            latency: Mutex::new(None),
            scripted_failures: Mutex::new(VecDeque::new()),
            applied: Mutex::new(Vec::new()),
        }
    }

    /// Insert or replace an item directly, bypassing mutations.
    pub fn seed(&self, item: ListItem) {
        self.ledger.lock().insert(item);
    }

    pub fn item(&self, id: &pantry_core::ItemId) -> Option<ListItem> {
        self.ledger.lock().get(id).cloned()
    }

    /// Delete an item out-of-band, as another device would.
    pub fn delete(&self, id: &pantry_core::ItemId) -> Option<ListItem> {
        self.ledger.lock().remove(id)
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Fail the next `execute` call with `error`.
    pub fn fail_next(&self, error: TransportError) {
        self.scripted_failures.lock().push_back(error);
    }

    /// Mutations that reached the server and were processed, in order.
    pub fn applied(&self) -> Vec<Mutation> {
        self.applied.lock().clone()
    }

    async fn round_trip(&self) -> Result<(), TransportError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Network("server unreachable".to_string()));
        }
        Ok(())
    }

    fn apply(&self, mutation: &Mutation) -> Result<TransportOutcome, TransportError> {
        let mut ledger = self.ledger.lock();
        let item_id = mutation.item_id();

        let outcome = match mutation {
            Mutation::CreateItem {
                list_id,
                name,
                quantity,
                ..
            } => {
                validate_name(name)?;
                if ledger.get(item_id).is_none() {
                    let mut item = ListItem::new(item_id.clone(), list_id.clone(), name.clone());
                    item.quantity = quantity.clone();
                    ledger.insert(item);
                }
                TransportOutcome::Confirmed(ledger.get(item_id).cloned())
            }
            Mutation::ToggleItemChecked { checked, actor, .. } => {
                let result = ledger.toggle(item_id, *checked, actor).map_err(not_found)?;
                if result.conflict {
                    TransportOutcome::Conflict(result)
                } else {
                    TransportOutcome::Confirmed(ledger.get(item_id).cloned())
                }
            }
            Mutation::DeleteItem { .. } => {
                ledger
                    .remove(item_id)
                    .ok_or_else(|| TransportError::NotFound(item_id.to_string()))?;
                TransportOutcome::Confirmed(None)
            }
            Mutation::RenameItem { name, .. } => {
                validate_name(name)?;
                let item = existing(&mut ledger, item_id)?;
                item.name = name.clone();
                TransportOutcome::Confirmed(Some(item.clone()))
            }
            Mutation::SetItemQuantity { quantity, .. } => {
                let item = existing(&mut ledger, item_id)?;
                item.quantity = quantity.clone();
                TransportOutcome::Confirmed(Some(item.clone()))
            }
            Mutation::SnoozeItem { until, .. } => {
                let item = existing(&mut ledger, item_id)?;
                item.snoozed_until = *until;
                TransportOutcome::Confirmed(Some(item.clone()))
            }
        };

        self.applied.lock().push(mutation.clone());
        Ok(outcome)
    }
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_name(name: &str) -> Result<(), TransportError> {
    if name.trim().is_empty() {
        Err(TransportError::Rejected("item name must not be empty".to_string()))
    } else {
        Ok(())
    }
}

fn not_found(err: CoreError) -> TransportError {
    match err {
        CoreError::ItemNotFound(id) => TransportError::NotFound(id),
        other => TransportError::Rejected(other.to_string()),
    }
}

fn existing<'a>(
    ledger: &'a mut CheckLedger,
    id: &pantry_core::ItemId,
) -> Result<&'a mut ListItem, TransportError> {
    ledger
        .get_mut(id)
        .ok_or_else(|| TransportError::NotFound(id.to_string()))
}

#[async_trait]
impl SyncTransport for MemoryServer {
    async fn execute(&self, mutation: &Mutation) -> Result<TransportOutcome, TransportError> {
        self.round_trip().await?;
        if let Some(err) = self.scripted_failures.lock().pop_front() {
            return Err(err);
        }
        self.apply(mutation)
    }

    async fn fetch(&self, key: &CacheKey) -> Result<Option<CacheValue>, TransportError> {
        self.round_trip().await?;
        let ledger = self.ledger.lock();
        let value = match key {
            CacheKey::ListItems(list_id) => Some(CacheValue::Items(
                ledger
                    .items()
                    .filter(|item| &item.list_id == list_id)
                    .cloned()
                    .collect(),
            )),
            CacheKey::Item(id) => ledger.get(id).cloned().map(CacheValue::Item),
        };
        Ok(value)
    }
}
