//! Per-page fan-out.
//!
//! Every page with at least one subscriber has a [`PageRoom`] wrapping a
//! tokio broadcast channel. A published frame is encoded once and shared
//! by every receiver; each connection skips frames it originated itself.
//!
//! A receiver that falls more than `capacity` frames behind loses the
//! oldest ones (`Lagged`) instead of stalling the publisher.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{Frame, ProtocolError};

/// One encoded frame on its way to a room.
#[derive(Debug)]
pub struct Outbound {
    /// Connection whose action produced the frame; it is not echoed back
    pub origin: Option<Uuid>,
    pub text: Arc<str>,
}

impl Outbound {
    pub fn encode(origin: Option<Uuid>, frame: &Frame) -> Result<Self, ProtocolError> {
        Ok(Self {
            origin,
            text: Arc::from(frame.encode()?),
        })
    }

    pub fn is_from(&self, connection: Uuid) -> bool {
        self.origin == Some(connection)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub frames_sent: u64,
    pub frames_lagged: u64,
    pub members: usize,
}

pub struct PageRoom {
    sender: broadcast::Sender<Arc<Outbound>>,
    members: RwLock<BTreeSet<Uuid>>,
    capacity: usize,
    frames_sent: AtomicU64,
    frames_lagged: AtomicU64,
}

impl PageRoom {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: RwLock::new(BTreeSet::new()),
            capacity,
            frames_sent: AtomicU64::new(0),
            frames_lagged: AtomicU64::new(0),
        }
    }

    /// Register `connection` and hand back its receiver. Frames published
    /// after this call are guaranteed to reach it.
    pub async fn join(&self, connection: Uuid) -> broadcast::Receiver<Arc<Outbound>> {
        let mut members = self.members.write().await;
        members.insert(connection);
        self.sender.subscribe()
    }

    pub async fn leave(&self, connection: &Uuid) -> bool {
        self.members.write().await.remove(connection)
    }

    /// Returns how many receivers got the frame.
    pub fn publish(&self, outbound: Arc<Outbound>) -> usize {
        let count = self.sender.send(outbound).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn record_lag(&self, skipped: u64) {
        self.frames_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_lagged: self.frames_lagged.load(Ordering::Relaxed),
            members: self.members.read().await.len(),
        }
    }
}

/// Page name → room.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<PageRoom>>>,
    capacity: usize,
}

impl RoomManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub async fn get_or_create(&self, page: &str) -> Arc<PageRoom> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(page) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(page) {
            return room.clone();
        }
        let room = Arc::new(PageRoom::new(self.capacity));
        rooms.insert(page.to_string(), room.clone());
        log::debug!("opened room for page {}", page);
        room
    }

    pub async fn get(&self, page: &str) -> Option<Arc<PageRoom>> {
        self.rooms.read().await.get(page).cloned()
    }

    /// Publish to `page` if anyone is listening there.
    pub async fn publish(&self, page: &str, outbound: Arc<Outbound>) -> usize {
        match self.get(page).await {
            Some(room) => room.publish(outbound),
            None => 0,
        }
    }

    pub async fn remove_if_idle(&self, page: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(page) {
            if room.member_count().await == 0 {
                rooms.remove(page);
                log::debug!("closed idle room for page {}", page);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_pages(&self) -> Vec<String> {
        let mut pages: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        pages.sort();
        pages
    }
}

/// What the server knows about one socket.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub user_id: Option<String>,
    pub is_admin: bool,
    pub pages: BTreeSet<String>,
}

/// Live connections and the pages each one is in.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, ConnectionInfo>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, connection: Uuid) {
        self.connections
            .write()
            .await
            .insert(connection, ConnectionInfo::default());
    }

    pub async fn set_identity(&self, connection: Uuid, user_id: Option<String>, is_admin: bool) {
        if let Some(info) = self.connections.write().await.get_mut(&connection) {
            info.user_id = user_id;
            info.is_admin = is_admin;
        }
    }

    /// Returns false when already present.
    pub async fn add_page(&self, connection: Uuid, page: &str) -> bool {
        match self.connections.write().await.get_mut(&connection) {
            Some(info) => info.pages.insert(page.to_string()),
            None => false,
        }
    }

    pub async fn remove_page(&self, connection: Uuid, page: &str) -> bool {
        match self.connections.write().await.get_mut(&connection) {
            Some(info) => info.pages.remove(page),
            None => false,
        }
    }

    pub async fn pages(&self, connection: Uuid) -> Vec<String> {
        self.connections
            .read()
            .await
            .get(&connection)
            .map(|info| info.pages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn get(&self, connection: Uuid) -> Option<ConnectionInfo> {
        self.connections.read().await.get(&connection).cloned()
    }

    pub async fn remove(&self, connection: Uuid) -> Option<ConnectionInfo> {
        self.connections.write().await.remove(&connection)
    }

    pub async fn connections_for_user(&self, user_id: &str) -> Vec<Uuid> {
        self.connections
            .read()
            .await
            .iter()
            .filter(|(_, info)| info.user_id.as_deref() == Some(user_id))
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}
