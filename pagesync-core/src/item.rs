//! Positioned items: component instances and navigation entries.
//!
//! Items live in groups keyed by `(pageId, sectionId, parentId)`. Within a
//! group the active items' `order` values are always `0..n` with no gaps or
//! duplicates; only the position engine writes `order`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The ordered collection an item belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupKey {
    pub page_id: String,
    pub section_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl GroupKey {
    pub fn new(page_id: impl Into<String>, section_id: impl Into<String>) -> Self {
        Self {
            page_id: page_id.into(),
            section_id: section_id.into(),
            parent_id: None,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.parent_id {
            Some(parent) => write!(f, "{}/{}/{}", self.page_id, self.section_id, parent),
            None => write!(f, "{}/{}", self.page_id, self.section_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Component,
    Navigation,
}

/// A component instance or navigation entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionedItem {
    /// Stable across moves
    pub id: String,
    pub kind: ItemKind,
    /// Component type, or the navigation entry flavour
    pub item_type: String,
    pub page_id: String,
    pub section_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Zero-based rank within the group
    pub order: u32,
    /// Bumped on every structural or content change to this item
    pub version: u64,
    /// Sanitized props or nav display fields
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub last_modified_by: String,
    pub last_modified_at: DateTime<Utc>,
    /// Soft-delete flag; inactive items keep their row for audit
    pub is_active: bool,
}

impl PositionedItem {
    /// Fresh item at `order`, version 1.
    pub fn new(
        id: impl Into<String>,
        kind: ItemKind,
        item_type: impl Into<String>,
        group: &GroupKey,
        order: u32,
        payload: Map<String, Value>,
        actor: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            item_type: item_type.into(),
            page_id: group.page_id.clone(),
            section_id: group.section_id.clone(),
            parent_id: group.parent_id.clone(),
            order,
            version: 1,
            payload,
            created_by: actor.to_string(),
            created_at: now,
            last_modified_by: actor.to_string(),
            last_modified_at: now,
            is_active: true,
        }
    }

    pub fn group(&self) -> GroupKey {
        GroupKey {
            page_id: self.page_id.clone(),
            section_id: self.section_id.clone(),
            parent_id: self.parent_id.clone(),
        }
    }

    pub fn in_group(&self, group: &GroupKey) -> bool {
        self.page_id == group.page_id
            && self.section_id == group.section_id
            && self.parent_id == group.parent_id
    }

    pub fn set_group(&mut self, group: &GroupKey) {
        self.page_id = group.page_id.clone();
        self.section_id = group.section_id.clone();
        self.parent_id = group.parent_id.clone();
    }

    /// Record a change by `actor`: bump the version and modification stamp.
    pub fn touch(&mut self, actor: &str) {
        self.version += 1;
        self.last_modified_by = actor.to_string();
        self.last_modified_at = Utc::now();
    }
}

/// Whether the active items' orders form exactly `{0, 1, .., k-1}`.
pub fn is_contiguous(items: &[PositionedItem]) -> bool {
    let mut orders: Vec<u32> = items.iter().filter(|i| i.is_active).map(|i| i.order).collect();
    orders.sort_unstable();
    orders.iter().enumerate().all(|(idx, order)| idx as u32 == *order)
}
