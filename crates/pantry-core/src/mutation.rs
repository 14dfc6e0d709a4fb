//! Mutations: the state-changing intents a client can queue and replay.
//!
//! Every operation is a variant of [`Mutation`] carrying its own typed
//! payload, so replay code matches exhaustively instead of dispatching on
//! operation names. The serialized form is adjacently tagged:
//!
//! ```text
//! { "operation": "toggle-item-checked",
//!   "payload": { "list_id": "weekly", "item_id": "milk", "checked": true, "actor": {..} } }
//! ```

use crate::error::{CoreError, Result};
use crate::ids::{ItemId, ListId};
use crate::item::Actor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Verb class of the underlying request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationMethod {
    Create,
    Update,
    Delete,
}

impl fmt::Display for MutationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationMethod::Create => write!(f, "create"),
            MutationMethod::Update => write!(f, "update"),
            MutationMethod::Delete => write!(f, "delete"),
        }
    }
}

/// The group of fields a mutation writes on its item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldFamily {
    /// The item itself (create/delete).
    Existence,
    Name,
    Quantity,
    /// The checked/owner state, the one family with racy semantics.
    Checked,
    Snooze,
}

impl FieldFamily {
    /// Families where only the latest write matters.
    pub fn is_overwrite(&self) -> bool {
        matches!(
            self,
            FieldFamily::Name | FieldFamily::Quantity | FieldFamily::Snooze
        )
    }
}

/// The logical resource and field family a mutation acts on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MutationTarget {
    pub list_id: ListId,
    pub item_id: ItemId,
    pub family: FieldFamily,
}

/// A single state-changing client intent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "payload", rename_all = "kebab-case")]
pub enum Mutation {
    CreateItem {
        list_id: ListId,
        item_id: ItemId,
        name: String,
        quantity: Option<String>,
    },
    RenameItem {
        list_id: ListId,
        item_id: ItemId,
        name: String,
    },
    SetItemQuantity {
        list_id: ListId,
        item_id: ItemId,
        quantity: Option<String>,
    },
    ToggleItemChecked {
        list_id: ListId,
        item_id: ItemId,
        checked: bool,
        actor: Actor,
    },
    SnoozeItem {
        list_id: ListId,
        item_id: ItemId,
        until: Option<DateTime<Utc>>,
    },
    DeleteItem {
        list_id: ListId,
        item_id: ItemId,
    },
}

impl Mutation {
    /// Stable operation name, identical to the serialized tag.
    pub fn operation(&self) -> &'static str {
        match self {
            Mutation::CreateItem { .. } => "create-item",
            Mutation::RenameItem { .. } => "rename-item",
            Mutation::SetItemQuantity { .. } => "set-item-quantity",
            Mutation::ToggleItemChecked { .. } => "toggle-item-checked",
            Mutation::SnoozeItem { .. } => "snooze-item",
            Mutation::DeleteItem { .. } => "delete-item",
        }
    }

    pub fn method(&self) -> MutationMethod {
        match self {
            Mutation::CreateItem { .. } => MutationMethod::Create,
            Mutation::DeleteItem { .. } => MutationMethod::Delete,
            _ => MutationMethod::Update,
        }
    }

    pub fn list_id(&self) -> &ListId {
        match self {
            Mutation::CreateItem { list_id, .. }
            | Mutation::RenameItem { list_id, .. }
            | Mutation::SetItemQuantity { list_id, .. }
            | Mutation::ToggleItemChecked { list_id, .. }
            | Mutation::SnoozeItem { list_id, .. }
            | Mutation::DeleteItem { list_id, .. } => list_id,
        }
    }

    pub fn item_id(&self) -> &ItemId {
        match self {
            Mutation::CreateItem { item_id, .. }
            | Mutation::RenameItem { item_id, .. }
            | Mutation::SetItemQuantity { item_id, .. }
            | Mutation::ToggleItemChecked { item_id, .. }
            | Mutation::SnoozeItem { item_id, .. }
            | Mutation::DeleteItem { item_id, .. } => item_id,
        }
    }

    pub fn target(&self) -> MutationTarget {
        let family = match self {
            Mutation::CreateItem { .. } | Mutation::DeleteItem { .. } => FieldFamily::Existence,
            Mutation::RenameItem { .. } => FieldFamily::Name,
            Mutation::SetItemQuantity { .. } => FieldFamily::Quantity,
            Mutation::ToggleItemChecked { .. } => FieldFamily::Checked,
            Mutation::SnoozeItem { .. } => FieldFamily::Snooze,
        };
        MutationTarget {
            list_id: self.list_id().clone(),
            item_id: self.item_id().clone(),
            family,
        }
    }

    /// Whether this mutation makes replaying `older` pointless.
    ///
    /// Only plain field overwrites on the same item and field qualify.
    /// Toggles never supersede each other: a check followed by an uncheck
    /// must both reach the server in order.
    pub fn supersedes(&self, older: &Mutation) -> bool {
        let target = self.target();
        target.family.is_overwrite() && target == older.target()
    }

    /// Human-readable text for the pending-changes screen.
    pub fn label(&self) -> String {
        match self {
            Mutation::CreateItem { name, .. } => format!("Add \"{}\"", name),
            Mutation::RenameItem { item_id, name, .. } => {
                format!("Rename {} to \"{}\"", item_id, name)
            }
            Mutation::SetItemQuantity {
                item_id, quantity, ..
            } => match quantity {
                Some(q) => format!("Set quantity of {} to {}", item_id, q),
                None => format!("Clear quantity of {}", item_id),
            },
            Mutation::ToggleItemChecked {
                item_id, checked, ..
            } => {
                if *checked {
                    format!("Check {}", item_id)
                } else {
                    format!("Uncheck {}", item_id)
                }
            }
            Mutation::SnoozeItem { item_id, until, .. } => match until {
                Some(until) => format!("Snooze {} until {}", item_id, until.format("%Y-%m-%d %H:%M")),
                None => format!("Unsnooze {}", item_id),
            },
            Mutation::DeleteItem { item_id, .. } => format!("Delete {}", item_id),
        }
    }

    /// Split into operation name and opaque payload for storage.
    pub fn to_parts(&self) -> Result<(String, serde_json::Value)> {
        let invalid = |reason: String| CoreError::InvalidPayload {
            operation: self.operation().to_string(),
            reason,
        };
        let value = serde_json::to_value(self).map_err(|e| invalid(e.to_string()))?;
        let payload = match value {
            serde_json::Value::Object(mut map) => map
                .remove("payload")
                .ok_or_else(|| invalid("missing payload".to_string()))?,
            _ => return Err(invalid("not an object".to_string())),
        };
        Ok((self.operation().to_string(), payload))
    }

    /// Rebuild a mutation from its stored operation name and payload.
    pub fn from_parts(operation: &str, payload: serde_json::Value) -> Result<Self> {
        if !KNOWN_OPERATIONS.contains(&operation) {
            return Err(CoreError::UnknownOperation(operation.to_string()));
        }
        let tagged = serde_json::json!({ "operation": operation, "payload": payload });
        serde_json::from_value(tagged).map_err(|e| CoreError::InvalidPayload {
            operation: operation.to_string(),
            reason: e.to_string(),
        })
    }
}

const KNOWN_OPERATIONS: &[&str] = &[
    "create-item",
    "rename-item",
    "set-item-quantity",
    "toggle-item-checked",
    "snooze-item",
    "delete-item",
];
