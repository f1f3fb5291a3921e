//! Realtime event envelope.
//!
//! Wire shape (JSON, camelCase):
//! ```text
//! { id, type, pageName, userId, timestamp (RFC 3339), version (string|number), data }
//! ```
//!
//! `type` is a closed set ([`EventKind`]). `data` stays an untyped JSON value in
//! the envelope so it can be sanitized and forwarded verbatim; [`RealtimeEvent::payload`]
//! decodes it into the typed per-kind view. A batched envelope carries `data` as
//! an array of payloads of the same kind, oldest first.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ValidationError;

/// Closed set of event kinds carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ContentChange,
    ComponentAdd,
    ComponentMove,
    ComponentDelete,
    NavUpdate,
    Presence,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::ContentChange,
        EventKind::ComponentAdd,
        EventKind::ComponentMove,
        EventKind::ComponentDelete,
        EventKind::NavUpdate,
        EventKind::Presence,
    ];

    /// Wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ContentChange => "content_change",
            EventKind::ComponentAdd => "component_add",
            EventKind::ComponentMove => "component_move",
            EventKind::ComponentDelete => "component_delete",
            EventKind::NavUpdate => "nav_update",
            EventKind::Presence => "presence",
        }
    }

    /// Parse a wire name. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == name)
    }

    /// Kinds produced by the position engine.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            EventKind::ComponentAdd
                | EventKind::ComponentMove
                | EventKind::ComponentDelete
                | EventKind::NavUpdate
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Post-mutation item version, or a local sequence counter for events that
/// don't touch a versioned item. Either a number or a string on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventVersion {
    Number(u64),
    Text(String),
}

impl EventVersion {
    /// Numeric value, parsing the string form when possible.
    pub fn as_number(&self) -> Option<u64> {
        match self {
            EventVersion::Number(n) => Some(*n),
            EventVersion::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl From<u64> for EventVersion {
    fn from(n: u64) -> Self {
        EventVersion::Number(n)
    }
}

impl From<&str> for EventVersion {
    fn from(s: &str) -> Self {
        EventVersion::Text(s.to_string())
    }
}

/// The envelope every realtime change travels in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub page_name: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub version: EventVersion,
    pub data: Value,
}

// ─── Typed payloads ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentChange {
    pub content_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    pub new_value: Value,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentAdd {
    pub component_id: String,
    pub component_type: String,
    pub position: u32,
    pub props: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentMove {
    pub component_id: String,
    pub old_position: u32,
    pub new_position: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDelete {
    pub component_id: String,
    pub position: u32,
    pub component_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavChangeType {
    Reorder,
    Update,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavUpdate {
    pub items: Vec<Value>,
    pub change_type: NavChangeType,
    pub affected_item_ids: Vec<String>,
}

/// Presence payload: who is doing what on the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

/// Typed view of `data`. Each variant holds one entry per payload, so an
/// unbatched event decodes to a single-element vector.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    ContentChange(Vec<ContentChange>),
    ComponentAdd(Vec<ComponentAdd>),
    ComponentMove(Vec<ComponentMove>),
    ComponentDelete(Vec<ComponentDelete>),
    NavUpdate(Vec<NavUpdate>),
    Presence(Vec<PresencePayload>),
}

impl EventPayload {
    pub fn len(&self) -> usize {
        match self {
            EventPayload::ContentChange(v) => v.len(),
            EventPayload::ComponentAdd(v) => v.len(),
            EventPayload::ComponentMove(v) => v.len(),
            EventPayload::ComponentDelete(v) => v.len(),
            EventPayload::NavUpdate(v) => v.len(),
            EventPayload::Presence(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn decode_one<T: DeserializeOwned>(kind: EventKind, value: &Value) -> Result<T, ValidationError> {
    if !value.is_object() {
        return Err(ValidationError::InvalidData {
            kind,
            reason: "payload must be a JSON object".to_string(),
        });
    }
    serde_json::from_value(value.clone()).map_err(|e| ValidationError::InvalidData {
        kind,
        reason: e.to_string(),
    })
}

fn decode_entries<T: DeserializeOwned>(
    kind: EventKind,
    data: &Value,
) -> Result<Vec<T>, ValidationError> {
    match data {
        Value::Array(entries) => {
            if entries.is_empty() {
                return Err(ValidationError::InvalidData {
                    kind,
                    reason: "batched data must not be empty".to_string(),
                });
            }
            entries.iter().map(|v| decode_one(kind, v)).collect()
        }
        other => Ok(vec![decode_one(kind, other)?]),
    }
}

impl RealtimeEvent {
    /// Build an event stamped with a fresh id and the current time.
    pub fn new(
        kind: EventKind,
        page_name: impl Into<String>,
        user_id: impl Into<String>,
        version: impl Into<EventVersion>,
        data: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            page_name: page_name.into(),
            user_id: user_id.into(),
            timestamp: Utc::now(),
            version: version.into(),
            data,
        }
    }

    /// A text/content edit keyed by `change.content_key`.
    pub fn content_change(
        page_name: impl Into<String>,
        user_id: impl Into<String>,
        sequence: u64,
        change: &ContentChange,
    ) -> Self {
        let data = serde_json::to_value(change).unwrap_or_default();
        Self::new(EventKind::ContentChange, page_name, user_id, sequence, data)
    }

    /// A presence announcement for `payload.user_id`.
    pub fn presence(
        page_name: impl Into<String>,
        sequence: u64,
        payload: &PresencePayload,
    ) -> Self {
        let data = serde_json::to_value(payload).unwrap_or_default();
        Self::new(
            EventKind::Presence,
            page_name,
            payload.user_id.clone(),
            sequence,
            data,
        )
    }

    /// Parse and validate raw inbound JSON.
    pub fn from_json(text: &str) -> Result<Self, ValidationError> {
        crate::validate::parse_event(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode `data` into the typed view for this event's kind.
    pub fn payload(&self) -> Result<EventPayload, ValidationError> {
        let kind = self.kind;
        Ok(match kind {
            EventKind::ContentChange => EventPayload::ContentChange(decode_entries(kind, &self.data)?),
            EventKind::ComponentAdd => EventPayload::ComponentAdd(decode_entries(kind, &self.data)?),
            EventKind::ComponentMove => EventPayload::ComponentMove(decode_entries(kind, &self.data)?),
            EventKind::ComponentDelete => {
                EventPayload::ComponentDelete(decode_entries(kind, &self.data)?)
            }
            EventKind::NavUpdate => EventPayload::NavUpdate(decode_entries(kind, &self.data)?),
            EventKind::Presence => EventPayload::Presence(decode_entries(kind, &self.data)?),
        })
    }

    /// Whether `data` carries several coalesced payloads.
    pub fn is_batched(&self) -> bool {
        self.data.is_array()
    }

    /// Payloads in order, one per coalesced edit.
    pub fn data_entries(&self) -> Vec<Value> {
        match &self.data {
            Value::Array(entries) => entries.clone(),
            other => vec![other.clone()],
        }
    }

    /// Key identifying "the same target" for debounce/coalescing.
    ///
    /// Only kinds that describe continuous edits of one target coalesce:
    /// content edits (by content key), moves (by component) and presence (by user).
    pub fn coalesce_key(&self) -> Option<String> {
        let field = match self.kind {
            EventKind::ContentChange => "contentKey",
            EventKind::ComponentMove => "componentId",
            EventKind::Presence => "userId",
            EventKind::ComponentAdd | EventKind::ComponentDelete | EventKind::NavUpdate => {
                return None
            }
        };
        let first = match &self.data {
            Value::Array(entries) => entries.first()?,
            other => other,
        };
        let target = first.get(field)?.as_str()?;
        Some(format!("{}:{}:{}", self.kind, self.page_name, target))
    }
}
