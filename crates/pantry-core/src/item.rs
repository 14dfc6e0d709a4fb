//! List items and the actors that act on them.

use crate::ids::{ActorId, ItemId, ListId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user acting on a shared list, with the name shown to other users.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: ActorId,
    pub display_name: String,
}

impl Actor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: ActorId::new(id),
            display_name: display_name.into(),
        }
    }
}

/// One entry on a shopping list, as held by the server and mirrored in the
/// client cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListItem {
    pub id: ItemId,
    pub list_id: ListId,
    pub name: String,
    pub quantity: Option<String>,
    pub checked: bool,
    /// Who currently holds the check. `None` whenever `checked` is false.
    pub checked_by: Option<Actor>,
    pub checked_at: Option<DateTime<Utc>>,
    pub snoozed_until: Option<DateTime<Utc>>,
}

impl ListItem {
    /// Create an unchecked, unsnoozed item.
    pub fn new(id: ItemId, list_id: ListId, name: impl Into<String>) -> Self {
        Self {
            id,
            list_id,
            name: name.into(),
            quantity: None,
            checked: false,
            checked_by: None,
            checked_at: None,
            snoozed_until: None,
        }
    }

    pub fn with_quantity(mut self, quantity: impl Into<String>) -> Self {
        self.quantity = Some(quantity.into());
        self
    }

    /// Whether the item is snoozed at `now`.
    pub fn is_snoozed(&self, now: DateTime<Utc>) -> bool {
        self.snoozed_until.map(|until| until > now).unwrap_or(false)
    }

    /// Mark the item checked by `actor`. Checking clears any snooze.
    pub fn mark_checked(&mut self, actor: &Actor, at: DateTime<Utc>) {
        self.checked = true;
        self.checked_by = Some(actor.clone());
        self.checked_at = Some(at);
        self.snoozed_until = None;
    }

    /// Clear the check, its owner and timestamp. The snooze is left alone.
    pub fn mark_unchecked(&mut self) {
        self.checked = false;
        self.checked_by = None;
        self.checked_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn item() -> ListItem {
        ListItem::new(ItemId::new("eggs"), ListId::new("weekly"), "Eggs")
    }

    #[test]
    fn test_checking_clears_snooze() {
        let now = Utc::now();
        let mut item = item();
        item.snoozed_until = Some(now + Duration::days(2));
        assert!(item.is_snoozed(now));

        item.mark_checked(&Actor::new("alice", "Alice"), now);
        assert!(item.checked);
        assert!(!item.is_snoozed(now));
    }

    #[test]
    fn test_unchecking_keeps_snooze() {
        let now = Utc::now();
        let mut item = item();
        item.mark_checked(&Actor::new("alice", "Alice"), now);
        item.snoozed_until = Some(now + Duration::hours(3));

        item.mark_unchecked();
        assert!(!item.checked);
        assert!(item.checked_by.is_none());
        assert!(item.checked_at.is_none());
        assert!(item.is_snoozed(now));
    }
}
