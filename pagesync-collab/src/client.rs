//! Client connection manager.
//!
//! Owns one logical realtime channel and everything scoped to it: the
//! subscribed pages, the outbound queue, the presence view and the item
//! cache. Nothing here is shared with another manager.
//!
//! ```text
//!                  connect()
//!   Disconnected ───────────► Connecting ──subscribed──► Connected
//!        ▲                      │    ▲                     │
//!        │ disconnect()   fail  ▼    │ backoff delay       │ channel lost
//!        └──────────────────── Error ┘                     ▼
//!                     (retries exhausted: stays Error)  Connecting
//! ```
//!
//! Every (re)connect sends `hello`, re-subscribes all pages, re-announces
//! tracked presence and then drains the outbound queue oldest first.
//! `disconnect()` is the only cancellation primitive: it cancels pending
//! retries and stops the drain, leaving unsent events queued.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use pagesync_core::{
    sanitize, validate, ConflictError, ContentChange, MutationReply, MutationRequest,
    PositionedItem, PresencePayload, RealtimeEvent, RejectReason, ValidationError,
};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backoff::{Backoff, Scheduler, TokioScheduler};
use crate::cache::ItemCache;
use crate::channel::{Channel, ChannelSignal, TransportError, WebSocketChannel};
use crate::listeners::{ClientEvent, ClientEventKind, Handler, ListenerBus, ListenerId};
use crate::presence::{PresenceRecord, PresenceTracker};
use crate::protocol::Frame;
use crate::queue::{Enqueued, OutboundQueue, DEFAULT_QUEUE_CAPACITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the sync server
    pub url: String,
    /// Sent in `hello`; the server maps it to a user
    pub auth_token: Option<String>,
    /// Author stamped on events built by this client
    pub user_id: Option<String>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    pub subscribe_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub queue_capacity: usize,
    pub debounce_window: Duration,
    pub batching: bool,
    pub mutation_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            auth_token: None,
            user_id: None,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_retries: 3,
            subscribe_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            debounce_window: Duration::from_millis(50),
            batching: false,
            mutation_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Short timeouts, no debounce, no heartbeat traffic.
    pub fn for_testing() -> Self {
        Self {
            subscribe_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(3600),
            debounce_window: Duration::ZERO,
            mutation_timeout: Duration::from_secs(2),
            ..Self::default()
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            base: self.base_delay,
            max: self.max_delay,
            max_retries: self.max_retries,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error("mutation rejected ({reason:?}): {message}")]
    Rejected { reason: RejectReason, message: String },
    #[error("gave up after {attempts} connect attempts: {last}")]
    RetriesExhausted { attempts: u32, last: TransportError },
    #[error("cancelled by disconnect()")]
    Cancelled,
    #[error("not connected")]
    NotConnected,
    #[error("no reply to mutation {request_id}")]
    MutationTimeout { request_id: String },
}

struct Outbox {
    queue: OutboundQueue,
    draining: bool,
}

struct Inner {
    config: ClientConfig,
    channel: Arc<dyn Channel>,
    scheduler: Arc<dyn Scheduler>,
    status: RwLock<ConnectionStatus>,
    retry_count: AtomicU32,
    subscriptions: Mutex<BTreeSet<String>>,
    outbox: Mutex<Outbox>,
    presence: Mutex<PresenceTracker>,
    cache: Mutex<ItemCache>,
    listeners: ListenerBus,
    /// Bumped by `disconnect()`; anything started under an older epoch stops
    epoch: watch::Sender<u64>,
    /// Bumped per opened channel; stale reader/heartbeat signals are ignored
    session: AtomicU64,
    connect_lock: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pending_subscribes: Mutex<HashMap<String, oneshot::Sender<Result<(), String>>>>,
    pending_mutations: Mutex<HashMap<String, oneshot::Sender<MutationReply>>>,
    sequence: AtomicU64,
    connection_id: Mutex<Option<Uuid>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        self.channel.close();
    }
}

/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig, channel: Arc<dyn Channel>, scheduler: Arc<dyn Scheduler>) -> Self {
        let (epoch, _) = watch::channel(0u64);
        let queue = OutboundQueue::new(config.queue_capacity, config.debounce_window, config.batching);
        Self {
            inner: Arc::new(Inner {
                config,
                channel,
                scheduler,
                status: RwLock::new(ConnectionStatus::Disconnected),
                retry_count: AtomicU32::new(0),
                subscriptions: Mutex::new(BTreeSet::new()),
                outbox: Mutex::new(Outbox {
                    queue,
                    draining: false,
                }),
                presence: Mutex::new(PresenceTracker::new()),
                cache: Mutex::new(ItemCache::new()),
                listeners: ListenerBus::new(),
                epoch,
                session: AtomicU64::new(0),
                connect_lock: tokio::sync::Mutex::new(()),
                tasks: Mutex::new(Vec::new()),
                pending_subscribes: Mutex::new(HashMap::new()),
                pending_mutations: Mutex::new(HashMap::new()),
                sequence: AtomicU64::new(0),
                connection_id: Mutex::new(None),
            }),
        }
    }

    /// Manager over a real WebSocket channel and tokio timers.
    pub fn websocket(config: ClientConfig) -> Self {
        let channel = Arc::new(WebSocketChannel::new(config.url.clone()));
        Self::new(config, channel, Arc::new(TokioScheduler))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // ─── Lifecycle ────────────────────────────────────────────────────────

    /// Resolves once connected. Idempotent; rejects with the last transport
    /// error once the retry budget is spent.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let epoch = self.current_epoch();
        self.connect_from(epoch).await
    }

    async fn connect_from(&self, epoch: u64) -> Result<(), ClientError> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.current_epoch() != epoch {
            return Err(ClientError::Cancelled);
        }
        if self.status() == ConnectionStatus::Connected {
            return Ok(());
        }

        let mut epoch_rx = self.inner.epoch.subscribe();
        let backoff = self.inner.config.backoff();
        let mut attempt = 0u32;
        self.inner.retry_count.store(0, Ordering::SeqCst);

        let session = loop {
            self.set_status(ConnectionStatus::Connecting);
            log::info!(
                "connecting to {} (attempt {})",
                self.inner.config.url,
                attempt + 1
            );

            let err = match self.attempt_connect().await {
                Ok(session) if self.current_epoch() == epoch => break session,
                Ok(_) => {
                    self.teardown_transport();
                    return Err(ClientError::Cancelled);
                }
                Err(err) => err,
            };

            self.teardown_transport();
            if self.current_epoch() != epoch {
                return Err(ClientError::Cancelled);
            }
            self.set_status(ConnectionStatus::Error);
            self.inner.listeners.emit(&ClientEvent::Error(err.to_string()));

            if attempt >= backoff.max_retries {
                log::warn!(
                    "giving up on {} after {} attempts: {}",
                    self.inner.config.url,
                    attempt + 1,
                    err
                );
                return Err(ClientError::RetriesExhausted {
                    attempts: attempt + 1,
                    last: err,
                });
            }

            let delay = backoff.delay(attempt);
            attempt += 1;
            self.inner.retry_count.store(attempt, Ordering::SeqCst);
            self.set_status(ConnectionStatus::Connecting);
            log::info!("connect failed ({}), retrying in {:?}", err, delay);

            tokio::select! {
                _ = self.inner.scheduler.sleep(delay) => {}
                _ = epoch_rx.changed() => return Err(ClientError::Cancelled),
            }
            if self.current_epoch() != epoch {
                return Err(ClientError::Cancelled);
            }
        };

        self.inner.retry_count.store(0, Ordering::SeqCst);
        self.set_status(ConnectionStatus::Connected);
        log::info!("connected to {}", self.inner.config.url);
        self.inner.listeners.emit(&ClientEvent::Connected);

        let heartbeat = self.spawn_heartbeat(session);
        self.inner.tasks.lock().push(heartbeat);

        if let Err(err) = self.drain_queue(epoch).await {
            self.handle_channel_lost(session, err);
        }
        Ok(())
    }

    /// Open the channel and restore session state. Returns the session id.
    async fn attempt_connect(&self) -> Result<u64, TransportError> {
        let signals = self.inner.channel.open().await?;
        let session = self.inner.session.fetch_add(1, Ordering::SeqCst) + 1;
        let reader = self.spawn_reader(signals, session);
        self.inner.tasks.lock().push(reader);

        self.inner
            .channel
            .send(Frame::Hello {
                token: self.inner.config.auth_token.clone(),
                user_id: self.inner.config.user_id.clone(),
            })
            .await?;

        for page in self.get_subscriptions() {
            self.request_subscribe(&page).await?;
        }

        let tracked = self.inner.presence.lock().local_entries();
        for (page, presence) in tracked {
            self.inner
                .channel
                .send(Frame::PresenceTrack { page, presence })
                .await?;
        }
        Ok(session)
    }

    /// Always succeeds. Cancels retries and the queue drain, forgets
    /// subscriptions and presence. Queued events stay queued.
    pub fn disconnect(&self) {
        self.inner.epoch.send_modify(|epoch| *epoch += 1);
        self.inner.session.fetch_add(1, Ordering::SeqCst);
        self.teardown_transport();

        self.inner.subscriptions.lock().clear();
        self.inner.presence.lock().clear();
        self.fail_pending("disconnected");
        self.inner.retry_count.store(0, Ordering::SeqCst);
        *self.inner.connection_id.lock() = None;

        log::info!(
            "disconnected from {} ({} events held)",
            self.inner.config.url,
            self.queued_len()
        );
        self.set_status(ConnectionStatus::Disconnected);
        self.inner
            .listeners
            .emit(&ClientEvent::Disconnected { requested: true });
    }

    fn teardown_transport(&self) {
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.inner.channel.close();
    }

    fn fail_pending(&self, reason: &str) {
        let subscribes: Vec<_> = self.inner.pending_subscribes.lock().drain().collect();
        for (_, tx) in subscribes {
            let _ = tx.send(Err(reason.to_string()));
        }
        // Dropping the senders fails the waiting mutations
        self.inner.pending_mutations.lock().clear();
    }

    /// The channel closed or errored underneath an open session.
    fn handle_channel_lost(&self, session: u64, err: TransportError) {
        if self
            .inner
            .session
            .compare_exchange(session, session + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.teardown_transport();
        self.fail_pending("channel lost");

        let was = self.status();
        log::warn!("channel to {} lost: {}", self.inner.config.url, err);
        self.inner.listeners.emit(&ClientEvent::Error(err.to_string()));

        if was == ConnectionStatus::Connected {
            self.inner.presence.lock().clear_remote();
            self.inner
                .listeners
                .emit(&ClientEvent::Disconnected { requested: false });
            self.set_status(ConnectionStatus::Connecting);

            let epoch = self.current_epoch();
            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(err) = manager.connect_from(epoch).await {
                    log::warn!("auto-reconnect ended: {}", err);
                }
            });
        }
    }

    fn spawn_reader(&self, mut signals: mpsc::Receiver<ChannelSignal>, session: u64) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let manager = ConnectionManager { inner };
                match signal {
                    ChannelSignal::Text(text) => manager.handle_text(&text),
                    ChannelSignal::Closed => {
                        manager.handle_channel_lost(session, TransportError::Closed);
                        return;
                    }
                    ChannelSignal::Error(reason) => {
                        manager.handle_channel_lost(session, TransportError::Send(reason));
                        return;
                    }
                }
            }
            if let Some(inner) = weak.upgrade() {
                ConnectionManager { inner }.handle_channel_lost(session, TransportError::Closed);
            }
        })
    }

    fn spawn_heartbeat(&self, session: u64) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.heartbeat_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            let mut nonce = 0u64;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let manager = ConnectionManager { inner };
                nonce += 1;
                if let Err(err) = manager.inner.channel.send(Frame::Ping { nonce }).await {
                    manager.handle_channel_lost(session, err);
                    return;
                }
            }
        })
    }

    async fn request_subscribe(&self, page: &str) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending_subscribes
            .lock()
            .insert(page.to_string(), tx);

        let sent = self
            .inner
            .channel
            .send(Frame::Subscribe {
                page: page.to_string(),
            })
            .await;
        if let Err(err) = sent {
            self.inner.pending_subscribes.lock().remove(page);
            return Err(err);
        }

        match tokio::time::timeout(self.inner.config.subscribe_timeout, rx).await {
            Ok(Ok(Ok(()))) => {
                log::debug!("subscribed to {}", page);
                Ok(())
            }
            Ok(Ok(Err(reason))) => Err(TransportError::Subscribe {
                page: page.to_string(),
                reason,
            }),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.inner.pending_subscribes.lock().remove(page);
                Err(TransportError::SubscribeTimeout {
                    page: page.to_string(),
                })
            }
        }
    }

    // ─── Outbound ─────────────────────────────────────────────────────────

    /// Validate, sanitize and transmit. While not connected (or while the
    /// queue still holds older events) the event is queued and this
    /// returns `Ok`.
    pub async fn send_event(&self, event: RealtimeEvent) -> Result<(), ClientError> {
        validate(&event)?;
        let event = sanitize(&event);

        {
            let mut outbox = self.inner.outbox.lock();
            let direct = self.status() == ConnectionStatus::Connected
                && !outbox.draining
                && outbox.queue.is_empty();
            if !direct {
                if let Enqueued::Evicted(old) = outbox.queue.push(event) {
                    log::debug!("queue full, dropped oldest event {}", old.id);
                }
                return Ok(());
            }
        }

        self.inner.channel.send(Frame::Event { event }).await?;
        Ok(())
    }

    /// Build and send a `content_change` authored by the configured user.
    pub async fn send_content_change(&self, page: &str, change: &ContentChange) -> Result<(), ClientError> {
        let user = self.inner.config.user_id.clone().unwrap_or_default();
        let event = RealtimeEvent::content_change(page, user, self.next_sequence(), change);
        self.send_event(event).await
    }

    /// Send queued events oldest first. Stops on disconnect or on the first
    /// failed send, which goes back to the head of the queue.
    async fn drain_queue(&self, epoch: u64) -> Result<usize, TransportError> {
        {
            let mut outbox = self.inner.outbox.lock();
            if outbox.draining {
                return Ok(0);
            }
            outbox.draining = true;
        }

        let mut sent = 0usize;
        loop {
            let next = {
                let mut outbox = self.inner.outbox.lock();
                let live = self.current_epoch() == epoch
                    && self.status() == ConnectionStatus::Connected;
                let next = if live { outbox.queue.pop_front() } else { None };
                if next.is_none() {
                    outbox.draining = false;
                }
                next
            };
            let Some(event) = next else {
                break;
            };

            if let Err(err) = self.inner.channel.send(Frame::Event { event: event.clone() }).await {
                let mut outbox = self.inner.outbox.lock();
                outbox.queue.push_front(event);
                outbox.draining = false;
                return Err(err);
            }
            sent += 1;
        }

        if sent > 0 {
            log::debug!("drained {} queued events", sent);
        }
        Ok(sent)
    }

    // ─── Pages and presence ───────────────────────────────────────────────

    /// Idempotent. When connected, resolves once the server confirms. The
    /// page stays in the set on failure and is retried on reconnect.
    pub async fn subscribe_to_page(&self, page: &str) -> Result<(), ClientError> {
        if page.trim().is_empty() {
            return Err(ValidationError::EmptyField("pageName").into());
        }
        if !self.inner.subscriptions.lock().insert(page.to_string()) {
            return Ok(());
        }
        if self.status() == ConnectionStatus::Connected {
            self.request_subscribe(page).await?;
        }
        Ok(())
    }

    /// Idempotent. Also withdraws any presence tracked on the page.
    pub async fn unsubscribe_from_page(&self, page: &str) -> Result<(), ClientError> {
        if !self.inner.subscriptions.lock().remove(page) {
            return Ok(());
        }
        {
            let mut presence = self.inner.presence.lock();
            presence.untrack_local(page);
            presence.clear_page(page);
        }
        if self.status() == ConnectionStatus::Connected {
            self.inner
                .channel
                .send(Frame::Unsubscribe {
                    page: page.to_string(),
                })
                .await?;
        }
        Ok(())
    }

    pub fn get_subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions.lock().iter().cloned().collect()
    }

    /// Announce this user's presence on `page`. Re-announced after every
    /// reconnect until untracked.
    pub async fn track_presence(&self, page: &str, presence: PresencePayload) -> Result<(), ClientError> {
        if presence.user_id.trim().is_empty() {
            return Err(ValidationError::EmptyField("userId").into());
        }
        self.inner
            .presence
            .lock()
            .track_local(page, presence.clone());
        if self.status() == ConnectionStatus::Connected {
            self.inner
                .channel
                .send(Frame::PresenceTrack {
                    page: page.to_string(),
                    presence,
                })
                .await?;
        }
        Ok(())
    }

    pub async fn untrack_presence(&self, page: &str) -> Result<(), ClientError> {
        if self.inner.presence.lock().untrack_local(page).is_none() {
            return Ok(());
        }
        if self.status() == ConnectionStatus::Connected {
            self.inner
                .channel
                .send(Frame::PresenceUntrack {
                    page: page.to_string(),
                })
                .await?;
        }
        Ok(())
    }

    pub fn presence(&self, page: &str) -> Vec<PresenceRecord> {
        self.inner.presence.lock().page(page)
    }

    // ─── Mutations ────────────────────────────────────────────────────────

    /// Submit a structural mutation and wait for the server's verdict.
    pub async fn submit_mutation(&self, request: MutationRequest) -> Result<RealtimeEvent, ClientError> {
        if self.status() != ConnectionStatus::Connected {
            return Err(ClientError::NotConnected);
        }
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending_mutations
            .lock()
            .insert(request_id.clone(), tx);

        let sent = self
            .inner
            .channel
            .send(Frame::Mutation {
                request_id: request_id.clone(),
                request,
            })
            .await;
        if let Err(err) = sent {
            self.inner.pending_mutations.lock().remove(&request_id);
            return Err(err.into());
        }

        let reply = match tokio::time::timeout(self.inner.config.mutation_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(TransportError::Closed.into()),
            Err(_) => {
                self.inner.pending_mutations.lock().remove(&request_id);
                return Err(ClientError::MutationTimeout { request_id });
            }
        };

        match reply {
            MutationReply::Applied { event } => {
                let stale = self.inner.cache.lock().apply_event(&event);
                self.inner.listeners.emit(&ClientEvent::Message(event.clone()));
                if let Some(page) = stale {
                    self.inner
                        .listeners
                        .emit(&ClientEvent::RefetchRequired { page });
                }
                Ok(event)
            }
            MutationReply::Conflict {
                current,
                expected_version,
            } => {
                let page = self.inner.cache.lock().apply_conflict(&current);
                let conflict = ConflictError::new(current, expected_version);
                log::debug!("mutation {} conflicted: {}", request_id, conflict);
                self.inner
                    .listeners
                    .emit(&ClientEvent::Conflict(conflict.clone()));
                self.inner
                    .listeners
                    .emit(&ClientEvent::RefetchRequired { page });
                Err(conflict.into())
            }
            MutationReply::Rejected { reason, message } => {
                Err(ClientError::Rejected { reason, message })
            }
        }
    }

    // ─── Inbound ──────────────────────────────────────────────────────────

    fn handle_text(&self, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("dropping malformed frame: {}", err);
                return;
            }
        };

        match frame {
            Frame::Event { event } => self.deliver(event),
            Frame::Subscribed { page } => {
                if let Some(tx) = self.inner.pending_subscribes.lock().remove(&page) {
                    let _ = tx.send(Ok(()));
                }
            }
            Frame::PresenceState { page, records } => {
                let records = self.inner.presence.lock().apply_state(&page, records);
                self.inner
                    .listeners
                    .emit(&ClientEvent::PresenceUpdate { page, records });
            }
            Frame::PresenceDiff { page, joins, leaves } => {
                let records = self.inner.presence.lock().apply_diff(&page, joins, leaves);
                self.inner
                    .listeners
                    .emit(&ClientEvent::PresenceUpdate { page, records });
            }
            Frame::MutationResult { request_id, reply } => {
                match self.inner.pending_mutations.lock().remove(&request_id) {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => log::debug!("late mutation result {}", request_id),
                }
            }
            Frame::Rejected {
                event_id,
                reason,
                message,
            } => {
                log::debug!("server rejected {:?}: {}", event_id, message);
                self.inner.listeners.emit(&ClientEvent::Rejected {
                    event_id,
                    reason,
                    message,
                });
            }
            Frame::Welcome { connection_id, .. } => {
                *self.inner.connection_id.lock() = Some(connection_id);
            }
            Frame::Pong { nonce } => log::trace!("pong {}", nonce),
            Frame::Ack { event_id, sequence } => log::trace!("ack {} at {:?}", event_id, sequence),
            other => log::warn!("unexpected {} frame from server", other.name()),
        }
    }

    fn deliver(&self, event: RealtimeEvent) {
        if let Err(err) = validate(&event) {
            log::warn!("dropping invalid event {}: {}", event.id, err);
            return;
        }
        let event = sanitize(&event);
        let stale = self.inner.cache.lock().apply_event(&event);
        self.inner.listeners.emit(&ClientEvent::Message(event));
        if let Some(page) = stale {
            self.inner
                .listeners
                .emit(&ClientEvent::RefetchRequired { page });
        }
    }

    // ─── State ────────────────────────────────────────────────────────────

    fn set_status(&self, to: ConnectionStatus) {
        let from = std::mem::replace(&mut *self.inner.status.write(), to);
        if from != to {
            log::debug!("status {} -> {}", from, to);
            self.inner
                .listeners
                .emit(&ClientEvent::StatusChanged { from, to });
        }
    }

    fn current_epoch(&self) -> u64 {
        *self.inner.epoch.borrow()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.read()
    }

    /// Retries taken by the current or last connect.
    pub fn retry_count(&self) -> u32 {
        self.inner.retry_count.load(Ordering::SeqCst)
    }

    pub fn queued_len(&self) -> usize {
        self.inner.outbox.lock().queue.len()
    }

    /// Events waiting to be sent, oldest first.
    pub fn queued_events(&self) -> Vec<RealtimeEvent> {
        self.inner.outbox.lock().queue.snapshot()
    }

    pub fn connection_id(&self) -> Option<Uuid> {
        *self.inner.connection_id.lock()
    }

    /// Local sequence for events that don't carry an item version.
    pub fn next_sequence(&self) -> u64 {
        self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn cached_item(&self, id: &str) -> Option<PositionedItem> {
        self.inner.cache.lock().get(id).cloned()
    }

    pub fn cache_items(&self, page: &str) -> Vec<PositionedItem> {
        self.inner.cache.lock().page_items(page)
    }

    /// Load authoritative items after a fetch and clear the page's stale flag.
    pub fn seed_cache(&self, page: &str, items: Vec<PositionedItem>) {
        let mut cache = self.inner.cache.lock();
        cache.seed(items);
        cache.clear_stale(page);
    }

    pub fn is_page_stale(&self, page: &str) -> bool {
        self.inner.cache.lock().is_stale(page)
    }

    // ─── Listeners ────────────────────────────────────────────────────────

    pub fn on(&self, kind: ClientEventKind, handler: Handler) -> ListenerId {
        self.inner.listeners.on(kind, handler)
    }

    pub fn off(&self, kind: ClientEventKind, id: ListenerId) -> bool {
        self.inner.listeners.off(kind, id)
    }

    /// Deliver a local event to listeners; returns how many ran cleanly.
    pub fn emit(&self, event: &ClientEvent) -> usize {
        self.inner.listeners.emit(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use pagesync_core::EventKind;
    use serde_json::json;

    /// Channel whose `open` always fails.
    struct DeadChannel;

    impl Channel for DeadChannel {
        fn open(&self) -> BoxFuture<'_, Result<mpsc::Receiver<ChannelSignal>, TransportError>> {
            Box::pin(async { Err(TransportError::Connect("refused".into())) })
        }

        fn send(&self, _frame: Frame) -> BoxFuture<'_, Result<(), TransportError>> {
            Box::pin(async { Err(TransportError::NotConnected) })
        }

        fn close(&self) {}
    }

    struct InstantScheduler;

    impl Scheduler for InstantScheduler {
        fn sleep(&self, _duration: Duration) -> BoxFuture<'static, ()> {
            Box::pin(async {})
        }
    }

    fn offline_manager() -> ConnectionManager {
        ConnectionManager::new(
            ClientConfig::for_testing(),
            Arc::new(DeadChannel),
            Arc::new(InstantScheduler),
        )
    }

    fn edit(key: &str) -> RealtimeEvent {
        RealtimeEvent::new(
            EventKind::ContentChange,
            "home",
            "u1",
            1,
            json!({ "contentKey": key, "newValue": "<script>x</script>hi", "contentType": "text" }),
        )
    }

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff().delay(2), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_offline_send_is_queued_and_sanitized() {
        let manager = offline_manager();
        manager.send_event(edit("title")).await.unwrap();
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(manager.queued_len(), 1);
        assert_eq!(manager.queued_events()[0].data["newValue"], "hi");
    }

    #[tokio::test]
    async fn test_invalid_event_rejected_before_queueing() {
        let manager = offline_manager();
        let mut bad = edit("title");
        bad.page_name.clear();
        assert!(matches!(
            manager.send_event(bad).await,
            Err(ClientError::Validation(_))
        ));
        assert_eq!(manager.queued_len(), 0);
    }

    #[tokio::test]
    async fn test_connect_exhausts_retries() {
        let manager = offline_manager();
        let err = manager.connect().await.unwrap_err();
        match err {
            ClientError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 4);
                assert!(matches!(last, TransportError::Connect(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(manager.status(), ConnectionStatus::Error);
        assert_eq!(manager.retry_count(), 3);
    }

    #[tokio::test]
    async fn test_mutation_requires_connection() {
        let manager = offline_manager();
        let request = MutationRequest::Delete {
            item_id: "c1".into(),
            expected_version: 1,
        };
        assert!(matches!(
            manager.submit_mutation(request).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_subscribe_offline_is_idempotent() {
        let manager = offline_manager();
        manager.subscribe_to_page("home").await.unwrap();
        manager.subscribe_to_page("home").await.unwrap();
        assert_eq!(manager.get_subscriptions(), vec!["home".to_string()]);
        manager.unsubscribe_from_page("home").await.unwrap();
        assert!(manager.get_subscriptions().is_empty());
    }

    #[test]
    fn test_malformed_frame_is_dropped() {
        let manager = offline_manager();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        manager.on(
            ClientEventKind::Message,
            Arc::new(move |_event: &ClientEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        manager.handle_text("{not json");
        manager.handle_text(r#"{"frame":"event","event":{"id":"e1"}}"#);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let good = Frame::Event { event: edit("title") }.encode().unwrap();
        manager.handle_text(&good);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
