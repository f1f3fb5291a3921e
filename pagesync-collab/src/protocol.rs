//! Wire frames exchanged over the realtime channel.
//!
//! Every WebSocket text message is one JSON object tagged by `frame`:
//! ```text
//! client → server   hello · subscribe · unsubscribe · event · mutation
//!                   presence_track · presence_untrack · ping
//! server → client   welcome · subscribed · event · ack · rejected
//!                   mutation_result · presence_state · presence_diff · pong
//! ```
//!
//! Events travel inside `event` frames in their own envelope shape, so the
//! same `RealtimeEvent` JSON is what gets validated, logged and fanned out.

use pagesync_core::{MutationReply, MutationRequest, PresencePayload, RealtimeEvent, RejectReason};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::presence::PresenceRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Frame {
    /// First frame on a fresh channel; the token resolves the identity
    Hello {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    Welcome {
        connection_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        is_admin: bool,
    },
    Subscribe {
        page: String,
    },
    Subscribed {
        page: String,
    },
    Unsubscribe {
        page: String,
    },
    Event {
        event: RealtimeEvent,
    },
    /// Event accepted; `sequence` is its event-log position when persisted
    Ack {
        event_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
    },
    Rejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        reason: RejectReason,
        message: String,
    },
    Mutation {
        request_id: String,
        request: MutationRequest,
    },
    MutationResult {
        request_id: String,
        reply: MutationReply,
    },
    PresenceTrack {
        page: String,
        presence: PresencePayload,
    },
    PresenceUntrack {
        page: String,
    },
    /// Full presence set for a page, sent right after `subscribed`
    PresenceState {
        page: String,
        records: Vec<PresenceRecord>,
    },
    PresenceDiff {
        page: String,
        #[serde(default)]
        joins: Vec<PresenceRecord>,
        #[serde(default)]
        leaves: Vec<PresenceRecord>,
    },
    Ping {
        #[serde(default)]
        nonce: u64,
    },
    Pong {
        #[serde(default)]
        nonce: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

impl Frame {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    /// Wire tag, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Welcome { .. } => "welcome",
            Frame::Subscribe { .. } => "subscribe",
            Frame::Subscribed { .. } => "subscribed",
            Frame::Unsubscribe { .. } => "unsubscribe",
            Frame::Event { .. } => "event",
            Frame::Ack { .. } => "ack",
            Frame::Rejected { .. } => "rejected",
            Frame::Mutation { .. } => "mutation",
            Frame::MutationResult { .. } => "mutation_result",
            Frame::PresenceTrack { .. } => "presence_track",
            Frame::PresenceUntrack { .. } => "presence_untrack",
            Frame::PresenceState { .. } => "presence_state",
            Frame::PresenceDiff { .. } => "presence_diff",
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
        }
    }

    pub fn rejected(event_id: Option<String>, reason: RejectReason, message: impl Into<String>) -> Self {
        Frame::Rejected {
            event_id,
            reason,
            message: message.into(),
        }
    }
}
