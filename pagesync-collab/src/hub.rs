//! Server-side coordination of the engine, the event log and fan-out.
//!
//! ```text
//!  mutation ──► PositionEngine ──► EventLog.append ──► RoomManager.publish
//!  event    ──► validate/sanitize ─┘                          │
//!  presence ──► PresenceRegistry ─────────────────────────────┘
//! ```
//!
//! Append and publish run under one lock so subscribers of a page see
//! events in the order they were persisted. Mutation events are appended
//! while the engine still holds the groups they wrote, so persisted order
//! is commit order. An event is never published unless its append
//! succeeded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pagesync_core::{
    require_user, sanitize, validate, AuthorizationError, EventKind, IdentityProvider,
    MutationReply, MutationRequest, PresencePayload, RealtimeEvent, RejectReason,
    ValidationError,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::broadcast::{Outbound, RoomManager};
use crate::engine::{EngineError, PositionEngine};
use crate::presence::{PresenceDiff, PresenceRecord, PresenceRegistry};
use crate::protocol::{Frame, ProtocolError};
use crate::storage::{EventLog, LogError};

#[derive(Debug, Clone, Error)]
pub enum HubError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Encode(#[from] ProtocolError),
    #[error("{0} events are produced by mutations only")]
    StructuralEvent(EventKind),
}

impl HubError {
    pub fn reject_reason(&self) -> RejectReason {
        match self {
            HubError::Validation(_) => RejectReason::Validation,
            HubError::Authorization(_) => RejectReason::Authorization,
            HubError::StructuralEvent(_) => RejectReason::InvalidRequest,
            HubError::Log(_) | HubError::Encode(_) => RejectReason::Internal,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub events_persisted: u64,
    pub events_published: u64,
    pub mutations_applied: u64,
    pub mutations_rejected: u64,
    pub conflicts: u64,
}

#[derive(Default)]
struct HubCounters {
    events_persisted: AtomicU64,
    events_published: AtomicU64,
    mutations_applied: AtomicU64,
    mutations_rejected: AtomicU64,
    conflicts: AtomicU64,
}

pub struct SyncHub {
    engine: PositionEngine,
    log: EventLog,
    rooms: Arc<RoomManager>,
    presence: PresenceRegistry,
    publish_lock: Mutex<()>,
    counters: HubCounters,
}

impl SyncHub {
    pub fn new(
        engine: PositionEngine,
        log: EventLog,
        rooms: Arc<RoomManager>,
        presence_idle_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            log,
            rooms,
            presence: PresenceRegistry::new(presence_idle_timeout),
            publish_lock: Mutex::new(()),
            counters: HubCounters::default(),
        }
    }

    pub fn engine(&self) -> &PositionEngine {
        &self.engine
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    // ─── Rooms ────────────────────────────────────────────────────────────

    /// Join `page`'s room. Everything published afterwards reaches the
    /// returned receiver.
    pub async fn join(&self, connection: Uuid, page: &str) -> broadcast::Receiver<Arc<Outbound>> {
        self.rooms.get_or_create(page).await.join(connection).await
    }

    pub async fn leave(&self, connection: Uuid, page: &str) {
        if let Some(room) = self.rooms.get(page).await {
            room.leave(&connection).await;
        }
        self.rooms.remove_if_idle(page).await;
    }

    // ─── Events ───────────────────────────────────────────────────────────

    /// Validate, sanitize, persist and fan out a client event. Presence
    /// events are fanned out without persisting. Returns the log sequence.
    pub async fn accept_event(
        &self,
        origin: Uuid,
        identity: &dyn IdentityProvider,
        event: RealtimeEvent,
    ) -> Result<Option<u64>, HubError> {
        validate(&event)?;
        if event.kind.is_structural() {
            return Err(HubError::StructuralEvent(event.kind));
        }
        let mut event = sanitize(&event);
        event.user_id = require_user(identity)?;

        if event.kind == EventKind::Presence {
            stamp_presence_user(&mut event.data, &event.user_id);
            self.presence.touch(origin);
            let outbound = Arc::new(Outbound::encode(Some(origin), &Frame::Event { event: event.clone() })?);
            self.publish(&event.page_name, outbound).await;
            return Ok(None);
        }

        let sequence = self.persist_and_publish(Some(origin), &event).await?;
        Ok(Some(sequence))
    }

    /// Run a structural mutation and fan out its event. Errors become the
    /// reply; nothing is published unless the change committed.
    pub async fn apply_mutation(
        &self,
        origin: Uuid,
        identity: &dyn IdentityProvider,
        request: MutationRequest,
    ) -> MutationReply {
        let op = request.op_name();
        let locked = match self.engine.apply_locked(identity, request).await {
            Ok(locked) => locked,
            Err(err) => {
                if matches!(err, EngineError::Conflict(_)) {
                    self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.mutations_rejected.fetch_add(1, Ordering::Relaxed);
                }
                log::debug!("{} from {} rejected: {}", op, origin, err);
                return err.into_reply();
            }
        };
        self.counters.mutations_applied.fetch_add(1, Ordering::Relaxed);

        // The group locks are held until `locked` drops, so the log and every
        // subscriber see this group's events in commit order.
        let event = &locked.outcome.event;
        if locked.outcome.items.is_empty() {
            log::debug!("{} from {} changed nothing, not logged", op, origin);
        } else if let Err(err) = self.persist_and_publish(Some(origin), event).await {
            log::error!(
                "{} {} committed but not logged, fan-out skipped: {}",
                event.kind,
                event.id,
                err
            );
        }
        MutationReply::Applied {
            event: locked.outcome.event,
        }
    }

    async fn persist_and_publish(
        &self,
        origin: Option<Uuid>,
        event: &RealtimeEvent,
    ) -> Result<u64, HubError> {
        let outbound = Arc::new(Outbound::encode(origin, &Frame::Event { event: event.clone() })?);
        let _guard = self.publish_lock.lock().await;
        let sequence = self.log.append(event)?;
        self.counters.events_persisted.fetch_add(1, Ordering::Relaxed);
        self.publish(&event.page_name, outbound).await;
        Ok(sequence)
    }

    async fn publish(&self, page: &str, outbound: Arc<Outbound>) {
        let receivers = self.rooms.publish(page, outbound).await;
        self.counters.events_published.fetch_add(1, Ordering::Relaxed);
        log::trace!("published on {} to {} receivers", page, receivers);
    }

    // ─── Presence ─────────────────────────────────────────────────────────

    /// Record `payload` for `connection` on `page`. The announced user is
    /// always the connection's own.
    pub async fn track_presence(
        &self,
        connection: Uuid,
        identity: &dyn IdentityProvider,
        page: &str,
        payload: &PresencePayload,
    ) -> Result<(), HubError> {
        if page.trim().is_empty() {
            return Err(ValidationError::EmptyField("page").into());
        }
        let payload = PresencePayload {
            user_id: require_user(identity)?,
            ..payload.clone()
        };
        let diff = self.presence.track(page, connection, &payload);
        self.publish_diff(&diff).await
    }

    pub async fn untrack_presence(&self, connection: Uuid, page: &str) -> Result<(), HubError> {
        match self.presence.untrack(page, connection) {
            Some(diff) => self.publish_diff(&diff).await,
            None => Ok(()),
        }
    }

    pub fn touch_presence(&self, connection: Uuid) {
        self.presence.touch(connection);
    }

    pub fn presence_snapshot(&self, page: &str) -> Vec<PresenceRecord> {
        self.presence.snapshot(page)
    }

    /// Forget everything a closed connection announced.
    pub async fn drop_connection(&self, connection: Uuid) {
        for diff in self.presence.remove_connection(connection) {
            if let Err(err) = self.publish_diff(&diff).await {
                log::warn!("presence leave for {} not published: {}", connection, err);
            }
        }
    }

    /// Expire presence records idle past the timeout. Returns how many
    /// records left.
    pub async fn prune_idle(&self, now: DateTime<Utc>) -> usize {
        let mut left = 0;
        for diff in self.presence.prune_idle(now) {
            left += diff.leaves.len();
            if let Err(err) = self.publish_diff(&diff).await {
                log::warn!("presence prune on {} not published: {}", diff.page, err);
            }
        }
        left
    }

    async fn publish_diff(&self, diff: &PresenceDiff) -> Result<(), HubError> {
        if diff.is_empty() {
            return Ok(());
        }
        let outbound = Arc::new(Outbound::encode(None, &diff.to_frame())?);
        self.publish(&diff.page, outbound).await;
        Ok(())
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            events_persisted: self.counters.events_persisted.load(Ordering::Relaxed),
            events_published: self.counters.events_published.load(Ordering::Relaxed),
            mutations_applied: self.counters.mutations_applied.load(Ordering::Relaxed),
            mutations_rejected: self.counters.mutations_rejected.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
        }
    }
}

/// Presence data names the announcing user; batched data names it per entry.
fn stamp_presence_user(data: &mut Value, user_id: &str) {
    match data {
        Value::Object(fields) => {
            fields.insert("userId".to_string(), Value::String(user_id.to_string()));
        }
        Value::Array(entries) => {
            for entry in entries {
                stamp_presence_user(entry, user_id);
            }
        }
        _ => {}
    }
}
