//! Server-authoritative conflict detection for the checked/owner state.
//!
//! An item's check behaves as a single-owner lock:
//!
//! ```text
//!            check(A)                uncheck(any)
//! Unchecked ─────────▶ Checked(A) ─────────────▶ Unchecked
//!                        │  ▲
//!                check(A)│  │ no-op
//!                        └──┘
//!                check(B) → rejected, conflict names A, state untouched
//! ```
//!
//! Checking clears the item's snooze; unchecking leaves it alone.

use crate::error::{CoreError, Result};
use crate::ids::ItemId;
use crate::item::{Actor, ListItem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The checked/owner state of an item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckState {
    Unchecked,
    Checked { by: Actor, at: DateTime<Utc> },
}

impl CheckState {
    pub fn of(item: &ListItem) -> Self {
        match (&item.checked_by, item.checked_at) {
            (Some(by), Some(at)) if item.checked => CheckState::Checked { by: by.clone(), at },
            _ => CheckState::Unchecked,
        }
    }

    pub fn holder(&self) -> Option<&Actor> {
        match self {
            CheckState::Unchecked => None,
            CheckState::Checked { by, .. } => Some(by),
        }
    }
}

/// Authoritative outcome of one check/uncheck attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckConflictResult {
    pub conflict: bool,
    pub item_id: ItemId,
    pub item_name: String,
    /// The actor currently holding the check, present only on conflict.
    pub conflict_user: Option<Actor>,
}

impl CheckConflictResult {
    pub fn accepted(item: &ListItem) -> Self {
        Self {
            conflict: false,
            item_id: item.id.clone(),
            item_name: item.name.clone(),
            conflict_user: None,
        }
    }

    pub fn rejected(item: &ListItem, holder: Actor) -> Self {
        Self {
            conflict: true,
            item_id: item.id.clone(),
            item_name: item.name.clone(),
            conflict_user: Some(holder),
        }
    }
}

/// Decide a check transition on a single item, mutating it only when allowed.
pub fn apply_check(item: &mut ListItem, actor: &Actor, now: DateTime<Utc>) -> CheckConflictResult {
    match CheckState::of(item) {
        CheckState::Checked { by, .. } if by.id != actor.id => {
            CheckConflictResult::rejected(item, by)
        }
        // Same actor re-checking (duplicate request) keeps the original timestamp.
        CheckState::Checked { .. } => CheckConflictResult::accepted(item),
        CheckState::Unchecked => {
            item.mark_checked(actor, now);
            CheckConflictResult::accepted(item)
        }
    }
}

/// Uncheck an item. Never conflicts.
pub fn apply_uncheck(item: &mut ListItem) -> CheckConflictResult {
    item.mark_unchecked();
    CheckConflictResult::accepted(item)
}

/// Server-side table of items that arbitrates concurrent checks.
#[derive(Clone, Debug, Default)]
pub struct CheckLedger {
    items: BTreeMap<ItemId, ListItem>,
}

impl CheckLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, item: ListItem) {
        self.items.insert(item.id.clone(), item);
    }

    pub fn remove(&mut self, id: &ItemId) -> Option<ListItem> {
        self.items.remove(id)
    }

    pub fn get(&self, id: &ItemId) -> Option<&ListItem> {
        self.items.get(id)
    }

    pub fn get_mut(&mut self, id: &ItemId) -> Option<&mut ListItem> {
        self.items.get_mut(id)
    }

    pub fn items(&self) -> impl Iterator<Item = &ListItem> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Check `id` on behalf of `actor`.
    pub fn check(&mut self, id: &ItemId, actor: &Actor) -> Result<CheckConflictResult> {
        self.check_at(id, actor, Utc::now())
    }

    pub fn check_at(
        &mut self,
        id: &ItemId,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<CheckConflictResult> {
        let item = self
            .items
            .get_mut(id)
            .ok_or_else(|| CoreError::ItemNotFound(id.to_string()))?;
        Ok(apply_check(item, actor, now))
    }

    /// Uncheck `id`, whoever holds it.
    pub fn uncheck(&mut self, id: &ItemId) -> Result<CheckConflictResult> {
        let item = self
            .items
            .get_mut(id)
            .ok_or_else(|| CoreError::ItemNotFound(id.to_string()))?;
        Ok(apply_uncheck(item))
    }

    /// Apply a toggle in either direction.
    pub fn toggle(&mut self, id: &ItemId, checked: bool, actor: &Actor) -> Result<CheckConflictResult> {
        if checked {
            self.check(id, actor)
        } else {
            self.uncheck(id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ListId;

    fn ledger_with(name: &str) -> (CheckLedger, ItemId) {
        let mut ledger = CheckLedger::new();
        let id = ItemId::new(name.to_lowercase());
        ledger.insert(ListItem::new(id.clone(), ListId::new("weekly"), name));
        (ledger, id)
    }

    #[test]
    fn test_same_actor_recheck_keeps_timestamp() {
        let (mut ledger, id) = ledger_with("Milk");
        let alice = Actor::new("alice", "Alice");
        let first = Utc::now();

        ledger.check_at(&id, &alice, first).unwrap();
        let again = ledger
            .check_at(&id, &alice, first + chrono::Duration::seconds(5))
            .unwrap();

        assert!(!again.conflict);
        assert_eq!(ledger.get(&id).unwrap().checked_at, Some(first));
    }

    #[test]
    fn test_conflict_reports_item_name_and_holder() {
        let (mut ledger, id) = ledger_with("Milk");
        ledger.check(&id, &Actor::new("alice", "Alice")).unwrap();

        let result = ledger.check(&id, &Actor::new("bob", "Bob")).unwrap();
        assert!(result.conflict);
        assert_eq!(result.item_name, "Milk");
        assert_eq!(result.conflict_user.unwrap().display_name, "Alice");
    }

    #[test]
    fn test_missing_item_is_not_found() {
        let mut ledger = CheckLedger::new();
        let err = ledger.uncheck(&ItemId::new("ghost")).unwrap_err();
        assert_eq!(err, CoreError::ItemNotFound("ghost".into()));
    }

    #[test]
    fn test_check_state_of_item() {
        let (mut ledger, id) = ledger_with("Bread");
        assert_eq!(CheckState::of(ledger.get(&id).unwrap()), CheckState::Unchecked);

        let carol = Actor::new("carol", "Carol");
        ledger.check(&id, &carol).unwrap();
        let state = CheckState::of(ledger.get(&id).unwrap());
        assert_eq!(state.holder(), Some(&carol));
    }
}
