//! Client-side cache of positioned items, fed by engine events.
//!
//! Engine events carry the post-mutation item under `data.item` (or
//! `data.items` for nav updates) and the orders of shifted siblings under
//! `data.shifted`. The cache keeps the highest version it has seen per item.
//! A version that skips ahead means an event was missed, so the page is
//! marked stale and the owner should refetch it.

use std::collections::{HashMap, HashSet};

use pagesync_core::{EventKind, PositionedItem, RealtimeEvent};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
struct ShiftedOrder {
    id: String,
    order: u32,
}

#[derive(Debug, Default)]
pub struct ItemCache {
    items: HashMap<String, PositionedItem>,
    stale_pages: HashSet<String>,
}

impl ItemCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from an authoritative fetch. Replaces whatever was cached.
    pub fn insert(&mut self, item: PositionedItem) {
        self.items.insert(item.id.clone(), item);
    }

    pub fn seed(&mut self, items: impl IntoIterator<Item = PositionedItem>) {
        for item in items {
            self.insert(item);
        }
    }

    pub fn get(&self, id: &str) -> Option<&PositionedItem> {
        self.items.get(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Active cached items on `page`, by section then order.
    pub fn page_items(&self, page: &str) -> Vec<PositionedItem> {
        let mut items: Vec<PositionedItem> = self
            .items
            .values()
            .filter(|i| i.page_id == page && i.is_active)
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            (&a.section_id, &a.parent_id, a.order).cmp(&(&b.section_id, &b.parent_id, b.order))
        });
        items
    }

    pub fn is_stale(&self, page: &str) -> bool {
        self.stale_pages.contains(page)
    }

    /// Call after refetching `page`.
    pub fn clear_stale(&mut self, page: &str) {
        self.stale_pages.remove(page);
    }

    /// Apply an engine event; events carrying no item change nothing.
    /// Returns the page name when the event shows the cache fell behind.
    pub fn apply_event(&mut self, event: &RealtimeEvent) -> Option<String> {
        if event.kind == EventKind::Presence {
            return None;
        }

        let mut stale = false;
        for entry in event.data_entries() {
            for item in carried_items(event.kind, &entry) {
                stale |= self.merge(item);
            }
            if let Some(shifted) = entry.get("shifted") {
                let orders: Vec<ShiftedOrder> =
                    serde_json::from_value(shifted.clone()).unwrap_or_default();
                for shift in orders {
                    if let Some(cached) = self.items.get_mut(&shift.id) {
                        cached.order = shift.order;
                    }
                }
            }
        }

        if stale {
            log::debug!(
                "item cache missed an update on page {}, refetch required",
                event.page_name
            );
            self.stale_pages.insert(event.page_name.clone());
            Some(event.page_name.clone())
        } else {
            None
        }
    }

    /// Adopt the stored state carried by a conflict; the page must be
    /// refetched since siblings may have moved too.
    pub fn apply_conflict(&mut self, current: &PositionedItem) -> String {
        self.items.insert(current.id.clone(), current.clone());
        self.stale_pages.insert(current.page_id.clone());
        current.page_id.clone()
    }

    /// Returns true when `item` skipped past a version we never saw.
    fn merge(&mut self, item: PositionedItem) -> bool {
        match self.items.get(&item.id) {
            Some(cached) if item.version <= cached.version => false,
            Some(cached) => {
                let gap = item.version > cached.version + 1;
                self.items.insert(item.id.clone(), item);
                gap
            }
            None => {
                self.items.insert(item.id.clone(), item);
                false
            }
        }
    }
}

fn carried_items(kind: EventKind, entry: &Value) -> Vec<PositionedItem> {
    let mut items = Vec::new();
    if let Some(item) = entry.get("item") {
        if let Ok(item) = serde_json::from_value::<PositionedItem>(item.clone()) {
            items.push(item);
        }
    }
    if kind == EventKind::NavUpdate {
        if let Some(Value::Array(list)) = entry.get("items") {
            items.extend(
                list.iter()
                    .filter_map(|v| serde_json::from_value::<PositionedItem>(v.clone()).ok()),
            );
        }
    }
    items
}
