//! # pagesync-collab: realtime page synchronization
//!
//! Keeps every open editor of a page in step with the server's
//! authoritative component and navigation ordering.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────┐   JSON frames   ┌───────────────────┐
//! │ ConnectionManager │ ◄─────────────► │ SyncServer        │
//! │ (per editor)      │   WebSocket     │ (central)         │
//! └─────────┬─────────┘                 └─────────┬─────────┘
//!           │                                     │
//!   ┌───────┴────────┐                   ┌────────┴────────┐
//!   │ OutboundQueue  │                   │ SyncHub         │
//!   │ ItemCache      │                   │  PositionEngine │
//!   │ PresenceTracker│                   │  EventLog       │
//!   │ ListenerBus    │                   │  RoomManager    │
//!   └────────────────┘                   └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: tagged JSON frames on the wire
//! - [`client`]: connection manager with reconnect, queue and listeners
//! - [`queue`]: bounded outbound queue with tail coalescing
//! - [`presence`]: server registry and client tracker
//! - [`cache`]: client-side item cache and staleness tracking
//! - [`engine`]: server position/ordering engine
//! - [`storage`]: item stores and the append-only event log
//! - [`broadcast`]: per-page fan-out rooms
//! - [`hub`]: log-then-publish coordination
//! - [`server`]: WebSocket sync server

pub mod backoff;
pub mod broadcast;
pub mod cache;
pub mod channel;
pub mod client;
pub mod engine;
pub mod hub;
pub mod listeners;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use backoff::{Backoff, Scheduler, TokioScheduler};
pub use broadcast::{ConnectionRegistry, Outbound, PageRoom, RoomManager};
pub use cache::ItemCache;
pub use channel::{Channel, ChannelSignal, TransportError, WebSocketChannel};
pub use client::{ClientConfig, ClientError, ConnectionManager, ConnectionStatus};
pub use engine::{EngineConfig, EngineError, MutationOutcome, PositionEngine};
pub use hub::{HubError, HubStats, SyncHub};
pub use listeners::{ClientEvent, ClientEventKind, Handler, ListenerBus, ListenerId};
pub use presence::{PresenceDiff, PresenceRecord, PresenceRegistry, PresenceTracker};
pub use protocol::{Frame, ProtocolError};
pub use queue::{Enqueued, OutboundQueue, DEFAULT_QUEUE_CAPACITY};
pub use server::{AccessDirectory, ServerConfig, ServerStats, SyncServer};
pub use storage::{
    EventLog, GroupWrite, ItemStore, LogError, MemoryStore, RocksStore, StoreConfig, StoreError,
};
