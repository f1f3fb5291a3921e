//! Presence: who is viewing or editing which page.
//!
//! Server side, [`PresenceRegistry`] owns the authoritative per-page set,
//! one record per connection (`presenceRef`). Every change comes back as a
//! [`PresenceDiff`] of joins and leaves to fan out to the page.
//!
//! Client side, [`PresenceTracker`] keeps what this client announced (so it
//! can be re-announced after a reconnect) and the merged view of everyone
//! else, rebuilt from `presence_state` snapshots and `presence_diff` deltas.
//!
//! Presence is ephemeral: never persisted, dropped with the connection.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pagesync_core::{sanitize_str, PresencePayload};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::Frame;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    /// Connection that owns this record
    pub presence_ref: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub online_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl PresenceRecord {
    fn from_payload(presence_ref: String, payload: &PresencePayload, now: DateTime<Utc>) -> Self {
        Self {
            presence_ref,
            user_id: payload.user_id.clone(),
            user_name: payload.user_name.clone(),
            component_id: payload.component_id.clone(),
            action: payload.action.clone(),
            online_at: now,
            last_seen: now,
        }
    }
}

/// Scrub the free-form presence fields.
pub fn sanitize_presence(payload: &PresencePayload) -> PresencePayload {
    PresencePayload {
        user_id: payload.user_id.clone(),
        user_name: payload.user_name.as_deref().map(sanitize_str),
        component_id: payload.component_id.as_deref().map(sanitize_str),
        action: payload.action.as_deref().map(sanitize_str),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceDiff {
    pub page: String,
    pub joins: Vec<PresenceRecord>,
    pub leaves: Vec<PresenceRecord>,
}

impl PresenceDiff {
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.leaves.is_empty()
    }

    pub fn to_frame(&self) -> Frame {
        Frame::PresenceDiff {
            page: self.page.clone(),
            joins: self.joins.clone(),
            leaves: self.leaves.clone(),
        }
    }
}

// ─── Server registry ──────────────────────────────────────────────────────────

pub struct PresenceRegistry {
    pages: RwLock<HashMap<String, HashMap<Uuid, PresenceRecord>>>,
    idle_timeout: Duration,
}

impl PresenceRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            pages: RwLock::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Merge `payload` as the record of `conn` on `page`. A repeat track keeps
    /// the original `onlineAt`.
    pub fn track(&self, page: &str, conn: Uuid, payload: &PresencePayload) -> PresenceDiff {
        self.track_at(page, conn, payload, Utc::now())
    }

    pub fn track_at(
        &self,
        page: &str,
        conn: Uuid,
        payload: &PresencePayload,
        now: DateTime<Utc>,
    ) -> PresenceDiff {
        let payload = sanitize_presence(payload);
        let mut pages = self.pages.write();
        let records = pages.entry(page.to_string()).or_default();

        let mut record = PresenceRecord::from_payload(conn.to_string(), &payload, now);
        if let Some(previous) = records.get(&conn) {
            record.online_at = previous.online_at;
        }
        records.insert(conn, record.clone());

        PresenceDiff {
            page: page.to_string(),
            joins: vec![record],
            leaves: Vec::new(),
        }
    }

    pub fn untrack(&self, page: &str, conn: Uuid) -> Option<PresenceDiff> {
        let mut pages = self.pages.write();
        let records = pages.get_mut(page)?;
        let removed = records.remove(&conn)?;
        if records.is_empty() {
            pages.remove(page);
        }
        Some(PresenceDiff {
            page: page.to_string(),
            joins: Vec::new(),
            leaves: vec![removed],
        })
    }

    /// Refresh `lastSeen` on every record owned by `conn`.
    pub fn touch(&self, conn: Uuid) {
        let now = Utc::now();
        for records in self.pages.write().values_mut() {
            if let Some(record) = records.get_mut(&conn) {
                record.last_seen = now;
            }
        }
    }

    /// Drop every record owned by `conn`, one diff per page.
    pub fn remove_connection(&self, conn: Uuid) -> Vec<PresenceDiff> {
        let mut pages = self.pages.write();
        let mut diffs = Vec::new();
        for (page, records) in pages.iter_mut() {
            if let Some(removed) = records.remove(&conn) {
                diffs.push(PresenceDiff {
                    page: page.clone(),
                    joins: Vec::new(),
                    leaves: vec![removed],
                });
            }
        }
        pages.retain(|_, records| !records.is_empty());
        diffs
    }

    /// Remove records not refreshed within the idle timeout.
    pub fn prune_idle(&self, now: DateTime<Utc>) -> Vec<PresenceDiff> {
        let Ok(timeout) = chrono::Duration::from_std(self.idle_timeout) else {
            return Vec::new();
        };
        let cutoff = now - timeout;
        let mut pages = self.pages.write();
        let mut diffs = Vec::new();
        for (page, records) in pages.iter_mut() {
            let stale: Vec<Uuid> = records
                .iter()
                .filter(|(_, r)| r.last_seen < cutoff)
                .map(|(conn, _)| *conn)
                .collect();
            let leaves: Vec<PresenceRecord> =
                stale.iter().filter_map(|conn| records.remove(conn)).collect();
            if !leaves.is_empty() {
                log::debug!("pruned {} idle presence records on {}", leaves.len(), page);
                diffs.push(PresenceDiff {
                    page: page.clone(),
                    joins: Vec::new(),
                    leaves,
                });
            }
        }
        pages.retain(|_, records| !records.is_empty());
        diffs
    }

    /// Current records on `page`, oldest first.
    pub fn snapshot(&self, page: &str) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> = self
            .pages
            .read()
            .get(page)
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| {
            a.online_at
                .cmp(&b.online_at)
                .then_with(|| a.presence_ref.cmp(&b.presence_ref))
        });
        records
    }

    pub fn page_count(&self) -> usize {
        self.pages.read().len()
    }
}

// ─── Client tracker ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct PresenceTracker {
    /// What this client announced, per page
    local: HashMap<String, PresencePayload>,
    /// Merged remote view, per page
    by_page: HashMap<String, Vec<PresenceRecord>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_local(&mut self, page: &str, payload: PresencePayload) {
        self.local.insert(page.to_string(), payload);
    }

    pub fn untrack_local(&mut self, page: &str) -> Option<PresencePayload> {
        self.local.remove(page)
    }

    /// Local announcements to replay after a reconnect, sorted by page.
    pub fn local_entries(&self) -> Vec<(String, PresencePayload)> {
        let mut entries: Vec<_> = self
            .local
            .iter()
            .map(|(page, payload)| (page.clone(), payload.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Replace the view of `page` with a full snapshot.
    pub fn apply_state(&mut self, page: &str, records: Vec<PresenceRecord>) -> Vec<PresenceRecord> {
        self.by_page.insert(page.to_string(), records.clone());
        records
    }

    /// Apply leaves then joins. A join for an existing `presenceRef`
    /// replaces that record in place.
    pub fn apply_diff(
        &mut self,
        page: &str,
        joins: Vec<PresenceRecord>,
        leaves: Vec<PresenceRecord>,
    ) -> Vec<PresenceRecord> {
        let records = self.by_page.entry(page.to_string()).or_default();
        records.retain(|r| !leaves.iter().any(|l| l.presence_ref == r.presence_ref));
        for join in joins {
            match records.iter_mut().find(|r| r.presence_ref == join.presence_ref) {
                Some(existing) => *existing = join,
                None => records.push(join),
            }
        }
        records.clone()
    }

    pub fn page(&self, page: &str) -> Vec<PresenceRecord> {
        self.by_page.get(page).cloned().unwrap_or_default()
    }

    pub fn clear_page(&mut self, page: &str) {
        self.by_page.remove(page);
    }

    /// Forget the remote view (the server resends it on resubscribe).
    pub fn clear_remote(&mut self) {
        self.by_page.clear();
    }

    pub fn clear(&mut self) {
        self.local.clear();
        self.by_page.clear();
    }
}
