//! Local projection of a mutation's expected effect on cached state.

use crate::cache::{CacheKey, CacheValue};
use chrono::{DateTime, Utc};
use pantry_core::{ListItem, Mutation, QueuedMutation};

/// Cache regions a mutation touches.
pub fn affected_keys(mutation: &Mutation) -> Vec<CacheKey> {
    vec![
        CacheKey::ListItems(mutation.list_id().clone()),
        CacheKey::Item(mutation.item_id().clone()),
    ]
}

/// Expected value of `key` once `mutation` succeeds.
///
/// Lists that are not cached stay uncached: a list holding only the new
/// item would be wrong, not merely incomplete.
pub fn project(
    mutation: &Mutation,
    key: &CacheKey,
    current: Option<&CacheValue>,
    now: DateTime<Utc>,
) -> Option<CacheValue> {
    match key {
        CacheKey::ListItems(_) => {
            let mut items = current?.as_items()?.to_vec();
            match mutation {
                Mutation::CreateItem { .. } => {
                    if !items.iter().any(|i| &i.id == mutation.item_id()) {
                        items.extend(created(mutation));
                    }
                }
                Mutation::DeleteItem { item_id, .. } => items.retain(|i| &i.id != item_id),
                _ => {
                    if let Some(item) = items.iter_mut().find(|i| &i.id == mutation.item_id()) {
                        apply_fields(mutation, item, now);
                    }
                }
            }
            Some(CacheValue::Items(items))
        }
        CacheKey::Item(_) => match mutation {
            Mutation::CreateItem { .. } => created(mutation).map(CacheValue::Item),
            Mutation::DeleteItem { .. } => None,
            _ => {
                let mut item = current?.as_item()?.clone();
                apply_fields(mutation, &mut item, now);
                Some(CacheValue::Item(item))
            }
        },
    }
}

/// Lay the projections of the `pending` entries that touch `key` over a
/// server value, oldest first.
pub fn rebase<'a, I>(key: &CacheKey, value: Option<CacheValue>, pending: I, now: DateTime<Utc>) -> Option<CacheValue>
where
    I: IntoIterator<Item = &'a QueuedMutation>,
{
    pending
        .into_iter()
        .filter(|entry| affected_keys(&entry.mutation).contains(key))
        .fold(value, |value, entry| project(&entry.mutation, key, value.as_ref(), now))
}

fn created(mutation: &Mutation) -> Option<ListItem> {
    match mutation {
        Mutation::CreateItem {
            list_id,
            item_id,
            name,
            quantity,
        } => {
            let mut item = ListItem::new(item_id.clone(), list_id.clone(), name.clone());
            item.quantity = quantity.clone();
            Some(item)
        }
        _ => None,
    }
}

fn apply_fields(mutation: &Mutation, item: &mut ListItem, now: DateTime<Utc>) {
    match mutation {
        Mutation::RenameItem { name, .. } => item.name = name.clone(),
        Mutation::SetItemQuantity { quantity, .. } => item.quantity = quantity.clone(),
        Mutation::ToggleItemChecked { checked, actor, .. } => {
            if *checked {
                item.mark_checked(actor, now);
            } else {
                item.mark_unchecked();
            }
        }
        Mutation::SnoozeItem { until, .. } => item.snoozed_until = *until,
        Mutation::CreateItem { .. } | Mutation::DeleteItem { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pantry_core::{Actor, ItemId, ListId};

    fn list() -> CacheValue {
        CacheValue::Items(vec![
            ListItem::new(ItemId::new("milk"), ListId::new("weekly"), "Milk"),
            ListItem::new(ItemId::new("eggs"), ListId::new("weekly"), "Eggs"),
        ])
    }

    #[test]
    fn test_check_projects_onto_list_and_item() {
        let alice = Actor::new("alice", "Alice");
        let m = Mutation::ToggleItemChecked {
            list_id: ListId::new("weekly"),
            item_id: ItemId::new("milk"),
            checked: true,
            actor: alice.clone(),
        };
        let now = Utc::now();

        let projected = project(&m, &CacheKey::ListItems(ListId::new("weekly")), Some(&list()), now).unwrap();
        let items = projected.as_items().unwrap();
        assert!(items[0].checked);
        assert_eq!(items[0].checked_by, Some(alice));
        assert!(!items[1].checked);

        // Uncached single item stays uncached.
        assert_eq!(project(&m, &CacheKey::Item(ItemId::new("milk")), None, now), None);
    }

    #[test]
    fn test_create_and_delete() {
        let key = CacheKey::ListItems(ListId::new("weekly"));
        let now = Utc::now();
        let create = Mutation::CreateItem {
            list_id: ListId::new("weekly"),
            item_id: ItemId::new("tea"),
            name: "Tea".into(),
            quantity: Some("1 box".into()),
        };
        let with_tea = project(&create, &key, Some(&list()), now).unwrap();
        assert_eq!(with_tea.as_items().unwrap().len(), 3);

        let delete = Mutation::DeleteItem {
            list_id: ListId::new("weekly"),
            item_id: ItemId::new("milk"),
        };
        let without_milk = project(&delete, &key, Some(&with_tea), now).unwrap();
        let names: Vec<_> = without_milk.as_items().unwrap().iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["Eggs", "Tea"]);

        assert_eq!(project(&delete, &CacheKey::Item(ItemId::new("milk")), None, now), None);
    }

    #[test]
    fn test_uncached_list_stays_uncached() {
        let create = Mutation::CreateItem {
            list_id: ListId::new("weekly"),
            item_id: ItemId::new("tea"),
            name: "Tea".into(),
            quantity: None,
        };
        let key = CacheKey::ListItems(ListId::new("weekly"));
        assert_eq!(project(&create, &key, None, Utc::now()), None);
    }
}
