//! Synchronous local pub/sub for connection manager events.
//!
//! Handlers run on the emitting task, in registration order. A panicking
//! handler is caught and logged; the remaining handlers still run and the
//! emitter never sees the panic.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use pagesync_core::{ConflictError, RealtimeEvent, RejectReason};
use parking_lot::RwLock;

use crate::client::ConnectionStatus;
use crate::presence::PresenceRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEventKind {
    StatusChanged,
    Connected,
    Disconnected,
    Message,
    PresenceUpdate,
    Conflict,
    RefetchRequired,
    Rejected,
    Error,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    StatusChanged {
        from: ConnectionStatus,
        to: ConnectionStatus,
    },
    Connected,
    /// `requested` is true when the caller asked for it via `disconnect()`
    Disconnected {
        requested: bool,
    },
    /// A validated, sanitized inbound event
    Message(RealtimeEvent),
    /// Consolidated presence view for a page after a state or diff frame
    PresenceUpdate {
        page: String,
        records: Vec<PresenceRecord>,
    },
    Conflict(ConflictError),
    RefetchRequired {
        page: String,
    },
    Rejected {
        event_id: Option<String>,
        reason: RejectReason,
        message: String,
    },
    Error(String),
}

impl ClientEvent {
    pub fn kind(&self) -> ClientEventKind {
        match self {
            ClientEvent::StatusChanged { .. } => ClientEventKind::StatusChanged,
            ClientEvent::Connected => ClientEventKind::Connected,
            ClientEvent::Disconnected { .. } => ClientEventKind::Disconnected,
            ClientEvent::Message(_) => ClientEventKind::Message,
            ClientEvent::PresenceUpdate { .. } => ClientEventKind::PresenceUpdate,
            ClientEvent::Conflict(_) => ClientEventKind::Conflict,
            ClientEvent::RefetchRequired { .. } => ClientEventKind::RefetchRequired,
            ClientEvent::Rejected { .. } => ClientEventKind::Rejected,
            ClientEvent::Error(_) => ClientEventKind::Error,
        }
    }
}

pub type Handler = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Returned by [`ListenerBus::on`]; pass to `off` to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct ListenerBus {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<ClientEventKind, Vec<(ListenerId, Handler)>>>,
}

impl ListenerBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, kind: ClientEventKind, handler: Handler) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, handler));
        id
    }

    /// Returns false if `id` wasn't registered for `kind`.
    pub fn off(&self, kind: ClientEventKind, id: ListenerId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        before != list.len()
    }

    /// Deliver `event` to every handler of its kind. Returns how many
    /// handlers completed without panicking.
    pub fn emit(&self, event: &ClientEvent) -> usize {
        let kind = event.kind();
        // Snapshot so handlers may call on/off re-entrantly
        let snapshot: Vec<Handler> = match self.handlers.read().get(&kind) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for handler in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let detail = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic".to_string());
                    log::error!("listener for {:?} panicked: {}", kind, detail);
                }
            }
        }
        delivered
    }

    pub fn listener_count(&self, kind: ClientEventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }
}
