//! Structural mutation requests and their replies.
//!
//! ```text
//! { "op": "move", "itemId": "c1", "expectedVersion": 3, "position": 0 }
//!   -> { "status": "applied",  "event": { ... } }
//!   -> { "status": "conflict", "current": { ...item... }, "expectedVersion": 3 }
//!   -> { "status": "rejected", "reason": "authorization", "message": "..." }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConflictError;
use crate::event::RealtimeEvent;
use crate::item::{GroupKey, ItemKind, PositionedItem};

/// Destination group for a move, on the item's current page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveTarget {
    pub section_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum MutationRequest {
    Insert {
        group: GroupKey,
        position: u32,
        kind: ItemKind,
        item_type: String,
        #[serde(default)]
        payload: Map<String, Value>,
        /// Client-chosen id; generated when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
    },
    Move {
        item_id: String,
        expected_version: u64,
        /// `None` keeps the item in its current group
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<MoveTarget>,
        position: u32,
    },
    Update {
        item_id: String,
        expected_version: u64,
        patch: Map<String, Value>,
    },
    Delete {
        item_id: String,
        expected_version: u64,
    },
    Reorder {
        group: GroupKey,
        ordered_ids: Vec<String>,
    },
}

impl MutationRequest {
    pub fn op_name(&self) -> &'static str {
        match self {
            MutationRequest::Insert { .. } => "insert",
            MutationRequest::Move { .. } => "move",
            MutationRequest::Update { .. } => "update",
            MutationRequest::Delete { .. } => "delete",
            MutationRequest::Reorder { .. } => "reorder",
        }
    }

    /// Item targeted by a single-item mutation.
    pub fn item_id(&self) -> Option<&str> {
        match self {
            MutationRequest::Move { item_id, .. }
            | MutationRequest::Update { item_id, .. }
            | MutationRequest::Delete { item_id, .. } => Some(item_id),
            MutationRequest::Insert { item_id, .. } => item_id.as_deref(),
            MutationRequest::Reorder { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Validation,
    Authorization,
    Invariant,
    NotFound,
    InvalidRequest,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum MutationReply {
    Applied {
        event: RealtimeEvent,
    },
    Conflict {
        current: PositionedItem,
        expected_version: u64,
    },
    Rejected {
        reason: RejectReason,
        message: String,
    },
}

impl MutationReply {
    pub fn rejected(reason: RejectReason, message: impl Into<String>) -> Self {
        MutationReply::Rejected {
            reason,
            message: message.into(),
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, MutationReply::Applied { .. })
    }
}

impl From<ConflictError> for MutationReply {
    fn from(err: ConflictError) -> Self {
        MutationReply::Conflict {
            current: *err.current,
            expected_version: err.expected_version,
        }
    }
}
