//! WebSocket sync server with page-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── PositionEngine ── ItemStore
//!             ├── connection task ──┤── EventLog ──────── EventLogBackend
//! Client B ──┘        │             └── PresenceRegistry
//!                     │
//!                     └── RoomManager (page) ── PageRoom ──┬──► Client A
//!                                                           └──► Client B
//! ```
//!
//! Each connection owns one outbox fed by a forwarder task per page room it
//! joined, so a slow socket only ever lags its own rooms. Direct replies are
//! held on the session and written before the next inbound frame is read;
//! they are never dropped.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use pagesync_core::{
    IdentityProvider, PresencePayload, RealtimeEvent, RejectReason, StaticIdentity,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{ConnectionRegistry, Outbound, RoomManager};
use crate::engine::{EngineConfig, PositionEngine};
use crate::hub::SyncHub;
use crate::protocol::Frame;
use crate::storage::{
    EventLog, EventLogBackend, ItemStore, LogError, MemoryStore, RocksStore, StoreConfig,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per room receiver before it lags
    pub broadcast_capacity: usize,
    /// Presence prune interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Presence records idle this long are dropped
    pub presence_idle_timeout_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            presence_idle_timeout_secs: 90,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            broadcast_capacity: 64,
            heartbeat_interval_secs: 1,
            presence_idle_timeout_secs: 5,
            storage_path: None,
        }
    }

    /// Defaults overridden by `PAGESYNC_*` variables. Unparseable values are
    /// logged and ignored.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("PAGESYNC_BIND").unwrap_or(defaults.bind_addr),
            broadcast_capacity: env_or("PAGESYNC_BROADCAST_CAPACITY", defaults.broadcast_capacity),
            heartbeat_interval_secs: env_or(
                "PAGESYNC_HEARTBEAT_SECS",
                defaults.heartbeat_interval_secs,
            ),
            presence_idle_timeout_secs: env_or(
                "PAGESYNC_PRESENCE_TTL_SECS",
                defaults.presence_idle_timeout_secs,
            ),
            storage_path: std::env::var_os("PAGESYNC_STORAGE")
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("ignoring invalid {}={:?}", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

/// Token → user table plus the admin set.
///
/// With no tokens configured the server runs open: a `hello` that claims a
/// user id is taken at its word.
#[derive(Debug, Clone, Default)]
pub struct AccessDirectory {
    tokens: HashMap<String, String>,
    admins: BTreeSet<String>,
}

impl AccessDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), user_id.into());
        self
    }

    pub fn with_admin(mut self, user_id: impl Into<String>) -> Self {
        self.admins.insert(user_id.into());
        self
    }

    /// Parse `token=user,token=user` and `user,user`. Malformed pairs are
    /// skipped.
    pub fn parse(tokens: &str, admins: &str) -> Self {
        let mut directory = Self::new();
        for pair in tokens.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some((token, user)) if !token.trim().is_empty() && !user.trim().is_empty() => {
                    directory = directory.with_token(token.trim(), user.trim());
                }
                _ => log::warn!("ignoring malformed token entry {:?}", pair),
            }
        }
        for admin in admins.split(',').map(str::trim).filter(|a| !a.is_empty()) {
            directory = directory.with_admin(admin);
        }
        directory
    }

    pub fn from_env() -> Self {
        Self::parse(
            &std::env::var("PAGESYNC_TOKENS").unwrap_or_default(),
            &std::env::var("PAGESYNC_ADMINS").unwrap_or_default(),
        )
    }

    pub fn is_open(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Identity for a `hello` frame.
    pub fn resolve(&self, token: Option<&str>, claimed_user: Option<&str>) -> StaticIdentity {
        let user = match token.and_then(|t| self.tokens.get(t)) {
            Some(user) => Some(user.as_str()),
            None if self.is_open() => claimed_user.filter(|u| !u.trim().is_empty()),
            None => None,
        };
        match user {
            Some(user) if self.admins.contains(user) => StaticIdentity::admin(user),
            Some(user) => StaticIdentity::user(user),
            None => StaticIdentity::anonymous(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub active_rooms: usize,
    pub events_persisted: u64,
    pub mutations_applied: u64,
    pub mutations_rejected: u64,
    pub conflicts: u64,
}

#[derive(Default)]
struct ServerCounters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
}

struct Shared {
    config: ServerConfig,
    hub: SyncHub,
    connections: ConnectionRegistry,
    access: AccessDirectory,
    counters: ServerCounters,
}

/// The sync server.
pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    /// Open storage (RocksDB when `storage_path` is set) and build the hub.
    pub fn new(config: ServerConfig) -> Result<Self, LogError> {
        Self::with_access(config, AccessDirectory::new())
    }

    pub fn with_access(config: ServerConfig, access: AccessDirectory) -> Result<Self, LogError> {
        let (items, events): (Arc<dyn ItemStore>, Arc<dyn EventLogBackend>) =
            match &config.storage_path {
                Some(path) => {
                    let store = Arc::new(RocksStore::open(StoreConfig::new(path.clone()))?);
                    log::info!("persisting to {}", path.display());
                    (store.clone(), store)
                }
                None => {
                    let store = Arc::new(MemoryStore::new());
                    (store.clone(), store)
                }
            };
        let log = EventLog::open(events)?;
        let recovered = log.recover()?;
        if recovered.corrupted > 0 {
            log::warn!("{} corrupt event log entries skipped", recovered.corrupted);
        }
        log::info!("event log holds {} entries", recovered.entries.len());

        let hub = SyncHub::new(
            PositionEngine::new(items, EngineConfig::default()),
            log,
            Arc::new(RoomManager::new(config.broadcast_capacity)),
            Duration::from_secs(config.presence_idle_timeout_secs),
        );
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                hub,
                connections: ConnectionRegistry::new(),
                access,
                counters: ServerCounters::default(),
            }),
        })
    }

    /// Accept connections until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.shared.config.bind_addr);

        let heartbeat = self.spawn_heartbeat();
        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            log::debug!("New TCP connection from {addr}");
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };
        heartbeat.abort();
        result
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let period = Duration::from_secs(shared.config.heartbeat_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let left = shared.hub.prune_idle(Utc::now()).await;
                if left > 0 {
                    log::info!("pruned {} idle presence records", left);
                }
            }
        })
    }

    pub fn hub(&self) -> &SyncHub {
        &self.shared.hub
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        let counters = &self.shared.counters;
        let hub = self.shared.hub.stats();
        ServerStats {
            total_connections: counters.total_connections.load(Ordering::Relaxed),
            active_connections: counters.active_connections.load(Ordering::Relaxed),
            frames_received: counters.frames_received.load(Ordering::Relaxed),
            frames_dropped: counters.frames_dropped.load(Ordering::Relaxed),
            active_rooms: self.shared.hub.rooms().room_count().await,
            events_persisted: hub.events_persisted,
            mutations_applied: hub.mutations_applied,
            mutations_rejected: hub.mutations_rejected,
            conflicts: hub.conflicts,
        }
    }
}

/// Per-socket state.
struct Session {
    id: Uuid,
    identity: StaticIdentity,
    outbox: mpsc::Sender<Arc<str>>,
    /// Direct replies awaiting the socket, in send order
    replies: VecDeque<String>,
    forwarders: HashMap<String, JoinHandle<()>>,
    shared: Arc<Shared>,
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (outbox, mut outbox_rx) =
        mpsc::channel::<Arc<str>>(shared.config.broadcast_capacity.max(1));
    let mut session = Session::new(outbox, shared.clone());
    shared.connections.register(session.id).await;
    shared.counters.total_connections.fetch_add(1, Ordering::Relaxed);
    shared.counters.active_connections.fetch_add(1, Ordering::Relaxed);
    log::info!("Connection {} established from {addr}", session.id);

    let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        session.handle_text(text.as_str()).await;
                        if let Err(e) = session.flush_replies(&mut ws_sender).await {
                            break Err(e.into());
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                            break Err(e.into());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection {} closed from {addr}", session.id);
                        break Ok(());
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break Ok(());
                    }
                    Some(Ok(_)) => {}
                }
            }
            text = outbox_rx.recv() => {
                let Some(text) = text else { break Ok(()) };
                if let Err(e) = ws_sender.send(Message::text(text.to_string())).await {
                    break Err(e.into());
                }
            }
        }
    };

    session.close().await;
    shared.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    result
}

impl Session {
    fn new(outbox: mpsc::Sender<Arc<str>>, shared: Arc<Shared>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity: StaticIdentity::anonymous(),
            outbox,
            replies: VecDeque::new(),
            forwarders: HashMap::new(),
            shared,
        }
    }

    async fn handle_text(&mut self, text: &str) {
        self.shared.counters.frames_received.fetch_add(1, Ordering::Relaxed);
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.shared.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Failed to decode frame from {}: {e}", self.id);
                return;
            }
        };
        self.shared.hub.touch_presence(self.id);

        match frame {
            Frame::Hello { token, user_id } => {
                self.identity = self
                    .shared
                    .access
                    .resolve(token.as_deref(), user_id.as_deref());
                let user_id = self.identity.current_user_id();
                let is_admin = user_id
                    .as_deref()
                    .is_some_and(|u| self.identity.is_admin(u));
                self.shared
                    .connections
                    .set_identity(self.id, user_id.clone(), is_admin)
                    .await;
                log::debug!("{} identified as {:?}", self.id, user_id);
                self.send(&Frame::Welcome {
                    connection_id: self.id,
                    user_id,
                    is_admin,
                });
            }
            Frame::Subscribe { page } => self.subscribe(page).await,
            Frame::Unsubscribe { page } => self.unsubscribe(&page).await,
            Frame::Event { event } => self.accept_event(event).await,
            Frame::Mutation {
                request_id,
                request,
            } => {
                let reply = self
                    .shared
                    .hub
                    .apply_mutation(self.id, &self.identity, request)
                    .await;
                self.send(&Frame::MutationResult { request_id, reply });
            }
            Frame::PresenceTrack { page, presence } => self.track(&page, &presence).await,
            Frame::PresenceUntrack { page } => {
                if let Err(e) = self.shared.hub.untrack_presence(self.id, &page).await {
                    log::warn!("presence untrack on {} failed: {e}", page);
                }
            }
            Frame::Ping { nonce } => self.send(&Frame::Pong { nonce }),
            other => log::debug!("Unhandled {} frame from {}", other.name(), self.id),
        }
    }

    async fn subscribe(&mut self, page: String) {
        if page.trim().is_empty() {
            self.send(&Frame::rejected(None, RejectReason::Validation, "page is empty"));
            return;
        }
        if self.forwarders.contains_key(&page) {
            self.send(&Frame::Subscribed { page });
            return;
        }
        let rx = self.shared.hub.join(self.id, &page).await;
        self.shared.connections.add_page(self.id, &page).await;
        self.send(&Frame::Subscribed { page: page.clone() });
        self.send(&Frame::PresenceState {
            page: page.clone(),
            records: self.shared.hub.presence_snapshot(&page),
        });
        let forwarder = spawn_forwarder(
            self.id,
            page.clone(),
            rx,
            self.outbox.clone(),
            self.shared.clone(),
        );
        self.forwarders.insert(page.clone(), forwarder);
        log::debug!("{} subscribed to {}", self.id, page);
    }

    async fn unsubscribe(&mut self, page: &str) {
        if let Some(forwarder) = self.forwarders.remove(page) {
            forwarder.abort();
        }
        self.shared.connections.remove_page(self.id, page).await;
        if let Err(e) = self.shared.hub.untrack_presence(self.id, page).await {
            log::warn!("presence untrack on {} failed: {e}", page);
        }
        self.shared.hub.leave(self.id, page).await;
    }

    async fn accept_event(&mut self, event: RealtimeEvent) {
        let event_id = event.id.clone();
        match self
            .shared
            .hub
            .accept_event(self.id, &self.identity, event)
            .await
        {
            Ok(sequence) => self.send(&Frame::Ack { event_id, sequence }),
            Err(e) => {
                log::debug!("event {} from {} rejected: {e}", event_id, self.id);
                self.send(&Frame::rejected(Some(event_id), e.reject_reason(), e.to_string()));
            }
        }
    }

    async fn track(&mut self, page: &str, presence: &PresencePayload) {
        if let Err(e) = self.shared.hub.track_presence(self.id, &self.identity, page, presence).await {
            self.send(&Frame::rejected(None, e.reject_reason(), e.to_string()));
        }
    }

    /// Hold a direct reply until the next flush.
    fn send(&mut self, frame: &Frame) {
        match frame.encode() {
            Ok(text) => self.replies.push_back(text),
            Err(e) => log::error!("failed to encode {}: {e}", frame.name()),
        }
    }

    /// Write held replies straight to the socket, bypassing the room outbox.
    async fn flush_replies<S>(&mut self, sink: &mut S) -> Result<(), S::Error>
    where
        S: futures_util::Sink<Message> + Unpin,
    {
        while let Some(text) = self.replies.pop_front() {
            sink.send(Message::text(text)).await?;
        }
        Ok(())
    }

    /// Leave every room and announce presence leaves.
    async fn close(&mut self) {
        let pages: Vec<String> = self.forwarders.keys().cloned().collect();
        for (_, forwarder) in self.forwarders.drain() {
            forwarder.abort();
        }
        self.shared.hub.drop_connection(self.id).await;
        for page in pages {
            self.shared.hub.leave(self.id, &page).await;
        }
        self.shared.connections.remove(self.id).await;
    }
}

/// Copy a room's frames into one connection's outbox, skipping its own.
fn spawn_forwarder(
    connection: Uuid,
    page: String,
    mut rx: broadcast::Receiver<Arc<Outbound>>,
    outbox: mpsc::Sender<Arc<str>>,
    shared: Arc<Shared>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(outbound) => {
                    if outbound.is_from(connection) {
                        continue;
                    }
                    if outbox.send(outbound.text.clone()).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Connection {connection} lagged by {n} frames on {page}");
                    if let Some(room) = shared.hub.rooms().get(&page).await {
                        room.record_lag(n);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
