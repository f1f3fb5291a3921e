//! Connection manager behaviour against a scripted channel.
//!
//! The mock channel records every frame the manager sends and answers
//! `subscribe` and `mutation` frames the way the server would. Delays go
//! through a recording scheduler so backoff is observable without sleeping.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use pagesync_collab::{
    Channel, ChannelSignal, ClientConfig, ClientError, ClientEvent, ClientEventKind,
    ConnectionManager, ConnectionStatus, Frame, PresenceRecord, Scheduler, TransportError,
};
use pagesync_core::{
    ContentChange, EventKind, GroupKey, ItemKind, MutationReply, MutationRequest,
    PositionedItem, RealtimeEvent,
};
use parking_lot::Mutex;
use serde_json::{json, Map};
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Default)]
struct MockChannel {
    /// Opens that fail before one succeeds (`usize::MAX` = never succeeds)
    failing_opens: AtomicUsize,
    opens: AtomicUsize,
    sent: Mutex<Vec<Frame>>,
    signals: Mutex<Option<mpsc::Sender<ChannelSignal>>>,
    mutation_reply: Mutex<Option<MutationReply>>,
}

impl MockChannel {
    fn failing(n: usize) -> Arc<Self> {
        let channel = Self::default();
        channel.failing_opens.store(n, Ordering::SeqCst);
        Arc::new(channel)
    }

    fn healthy() -> Arc<Self> {
        Self::failing(0)
    }

    fn sent(&self) -> Vec<Frame> {
        self.sent.lock().clone()
    }

    fn sent_events(&self) -> Vec<RealtimeEvent> {
        self.sent()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Event { event } => Some(event),
                _ => None,
            })
            .collect()
    }

    fn subscribes(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Subscribe { page } => Some(page),
                _ => None,
            })
            .collect()
    }

    fn inject(&self, signal: ChannelSignal) {
        if let Some(tx) = self.signals.lock().as_ref() {
            tx.try_send(signal).unwrap();
        }
    }

    fn inject_frame(&self, frame: &Frame) {
        self.inject(ChannelSignal::Text(frame.encode().unwrap()));
    }
}

impl Channel for MockChannel {
    fn open(&self) -> BoxFuture<'_, Result<mpsc::Receiver<ChannelSignal>, TransportError>> {
        Box::pin(async move {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failing_opens.load(Ordering::SeqCst);
            if remaining > 0 {
                if remaining != usize::MAX {
                    self.failing_opens.store(remaining - 1, Ordering::SeqCst);
                }
                return Err(TransportError::Connect("connection refused".into()));
            }
            let (tx, rx) = mpsc::channel(64);
            *self.signals.lock() = Some(tx);
            Ok(rx)
        })
    }

    fn send(&self, frame: Frame) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if self.signals.lock().is_none() {
                return Err(TransportError::NotConnected);
            }
            let reply = match &frame {
                Frame::Subscribe { page } => Some(Frame::Subscribed { page: page.clone() }),
                Frame::Mutation { request_id, .. } => {
                    self.mutation_reply
                        .lock()
                        .clone()
                        .map(|reply| Frame::MutationResult {
                            request_id: request_id.clone(),
                            reply,
                        })
                }
                _ => None,
            };
            self.sent.lock().push(frame);
            if let Some(reply) = reply {
                self.inject_frame(&reply);
            }
            Ok(())
        })
    }

    fn close(&self) {
        self.signals.lock().take();
    }
}

#[derive(Default)]
struct RecordingScheduler {
    delays: Mutex<Vec<Duration>>,
}

impl Scheduler for RecordingScheduler {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.delays.lock().push(duration);
        Box::pin(async {})
    }
}

fn manager(channel: Arc<MockChannel>) -> (ConnectionManager, Arc<RecordingScheduler>) {
    let scheduler = Arc::new(RecordingScheduler::default());
    let config = ClientConfig {
        user_id: Some("u1".into()),
        ..ClientConfig::for_testing()
    };
    (ConnectionManager::new(config, channel, scheduler.clone()), scheduler)
}

fn edit(key: &str) -> RealtimeEvent {
    RealtimeEvent::content_change(
        "home",
        "u1",
        1,
        &ContentChange {
            content_key: key.to_string(),
            old_value: None,
            new_value: json!(format!("value of {key}")),
            content_type: "text".into(),
        },
    )
}

/// Collect every event of `kind` delivered to listeners.
fn record(manager: &ConnectionManager, kind: ClientEventKind) -> Arc<Mutex<Vec<ClientEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    manager.on(
        kind,
        Arc::new(move |event: &ClientEvent| sink.lock().push(event.clone())),
    );
    seen
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_offline_queue_flushes_in_order_on_connect() {
    let channel = MockChannel::healthy();
    let (manager, _) = manager(channel.clone());

    for i in 0..5 {
        manager.send_event(edit(&format!("k{i}"))).await.unwrap();
    }
    assert_eq!(manager.queued_len(), 5);
    assert!(channel.sent().is_empty());

    manager.connect().await.unwrap();
    assert_eq!(manager.status(), ConnectionStatus::Connected);
    assert_eq!(manager.queued_len(), 0);

    let keys: Vec<String> = channel
        .sent_events()
        .iter()
        .map(|e| e.data["contentKey"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(keys, vec!["k0", "k1", "k2", "k3", "k4"]);
    assert!(matches!(channel.sent()[0], Frame::Hello { .. }));
}

#[tokio::test]
async fn test_queue_bound_drops_oldest() {
    let (manager, _) = manager(MockChannel::healthy());
    for i in 0..101 {
        manager.send_event(edit(&format!("k{i}"))).await.unwrap();
    }
    assert_eq!(manager.queued_len(), 100);
    let queued = manager.queued_events();
    assert_eq!(queued[0].data["contentKey"], "k1");
    assert_eq!(queued[99].data["contentKey"], "k100");
}

#[tokio::test]
async fn test_backoff_then_retries_exhausted() {
    let channel = MockChannel::failing(usize::MAX);
    let (manager, scheduler) = manager(channel.clone());
    let statuses = record(&manager, ClientEventKind::StatusChanged);
    let errors = record(&manager, ClientEventKind::Error);

    let err = manager.connect().await.unwrap_err();
    match err {
        ClientError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 4),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        *scheduler.delays.lock(),
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400)
        ]
    );
    assert_eq!(channel.opens.load(Ordering::SeqCst), 4);
    assert_eq!(manager.status(), ConnectionStatus::Error);
    assert_eq!(errors.lock().len(), 4);

    let last = statuses.lock().last().cloned();
    assert!(matches!(
        last,
        Some(ClientEvent::StatusChanged {
            to: ConnectionStatus::Error,
            ..
        })
    ));
}

#[tokio::test]
async fn test_transient_failures_recover() {
    let channel = MockChannel::failing(2);
    let (manager, scheduler) = manager(channel);

    manager.connect().await.unwrap();
    assert_eq!(manager.status(), ConnectionStatus::Connected);
    assert_eq!(manager.retry_count(), 0);
    assert_eq!(scheduler.delays.lock().len(), 2);
}

#[tokio::test]
async fn test_pages_resubscribed_on_connect() {
    let channel = MockChannel::healthy();
    let (manager, _) = manager(channel.clone());
    manager.subscribe_to_page("home").await.unwrap();
    manager.subscribe_to_page("about").await.unwrap();

    manager.connect().await.unwrap();
    assert_eq!(channel.subscribes(), vec!["about", "home"]);

    // Already subscribed: no new frame
    manager.subscribe_to_page("home").await.unwrap();
    assert_eq!(channel.subscribes().len(), 2);

    manager.subscribe_to_page("pricing").await.unwrap();
    assert_eq!(channel.subscribes().len(), 3);
    assert_eq!(manager.get_subscriptions(), vec!["about", "home", "pricing"]);
}

#[tokio::test]
async fn test_empty_page_name_rejected() {
    let (manager, _) = manager(MockChannel::healthy());
    assert!(matches!(
        manager.subscribe_to_page("  ").await,
        Err(ClientError::Validation(_))
    ));
}

#[tokio::test]
async fn test_panicking_listener_does_not_stop_others() {
    let channel = MockChannel::healthy();
    let (manager, _) = manager(channel.clone());
    manager.on(
        ClientEventKind::Message,
        Arc::new(|_event: &ClientEvent| panic!("listener bug")),
    );
    let messages = record(&manager, ClientEventKind::Message);

    manager.connect().await.unwrap();
    channel.inject_frame(&Frame::Event { event: edit("title") });
    eventually(|| messages.lock().len() == 1).await;
}

#[tokio::test]
async fn test_inbound_events_are_validated_and_sanitized() {
    let channel = MockChannel::healthy();
    let (manager, _) = manager(channel.clone());
    let messages = record(&manager, ClientEventKind::Message);
    manager.connect().await.unwrap();

    channel.inject(ChannelSignal::Text("not a frame".into()));
    channel.inject(ChannelSignal::Text(
        r#"{"frame":"event","event":{"id":"x","type":"teleport"}}"#.into(),
    ));
    let mut dirty = edit("title");
    dirty.data["newValue"] = json!("<img src=x onerror=\"steal()\">ok");
    channel.inject_frame(&Frame::Event { event: dirty });

    eventually(|| messages.lock().len() == 1).await;
    match &messages.lock()[0] {
        ClientEvent::Message(event) => assert_eq!(event.data["newValue"], "<img src=x>ok"),
        other => panic!("unexpected {other:?}"),
    };
}

#[tokio::test]
async fn test_channel_loss_reconnects() {
    let channel = MockChannel::healthy();
    let (manager, _) = manager(channel.clone());
    let disconnects = record(&manager, ClientEventKind::Disconnected);
    manager.subscribe_to_page("home").await.unwrap();
    manager.connect().await.unwrap();

    channel.inject(ChannelSignal::Closed);
    eventually(|| channel.opens.load(Ordering::SeqCst) == 2).await;
    eventually(|| manager.status() == ConnectionStatus::Connected).await;

    assert!(matches!(
        disconnects.lock()[0],
        ClientEvent::Disconnected { requested: false }
    ));
    assert_eq!(channel.subscribes(), vec!["home", "home"]);
}

#[tokio::test]
async fn test_disconnect_keeps_queue_and_clears_pages() {
    let channel = MockChannel::failing(usize::MAX);
    let (manager, _) = manager(channel);
    manager.subscribe_to_page("home").await.unwrap();
    for i in 0..3 {
        manager.send_event(edit(&format!("k{i}"))).await.unwrap();
    }

    manager.disconnect();
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    assert_eq!(manager.queued_len(), 3);
    assert!(manager.get_subscriptions().is_empty());

    // Idempotent
    manager.disconnect();
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_conflict_reply_refreshes_cache() {
    let channel = MockChannel::healthy();
    let (manager, _) = manager(channel.clone());
    let conflicts = record(&manager, ClientEventKind::Conflict);
    let refetches = record(&manager, ClientEventKind::RefetchRequired);

    let mut fresh = PositionedItem::new(
        "c1",
        ItemKind::Component,
        "hero",
        &GroupKey::new("home", "main"),
        2,
        Map::new(),
        "u2",
    );
    fresh.version = 5;
    *channel.mutation_reply.lock() = Some(MutationReply::Conflict {
        current: fresh.clone(),
        expected_version: 4,
    });

    manager.connect().await.unwrap();
    let err = manager
        .submit_mutation(MutationRequest::Move {
            item_id: "c1".into(),
            expected_version: 4,
            target: None,
            position: 0,
        })
        .await
        .unwrap_err();

    match err {
        ClientError::Conflict(conflict) => {
            assert_eq!(conflict.current_version(), 5);
            assert_eq!(conflict.expected_version, 4);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(manager.cached_item("c1"), Some(fresh));
    assert_eq!(conflicts.lock().len(), 1);
    assert!(matches!(
        &refetches.lock()[0],
        ClientEvent::RefetchRequired { page } if page == "home"
    ));
    assert!(manager.is_page_stale("home"));
}

#[tokio::test]
async fn test_applied_mutation_updates_cache() {
    let channel = MockChannel::healthy();
    let (manager, _) = manager(channel.clone());
    let item = PositionedItem::new(
        "c9",
        ItemKind::Component,
        "text",
        &GroupKey::new("home", "main"),
        0,
        Map::new(),
        "u1",
    );
    let event = RealtimeEvent::new(
        EventKind::ComponentAdd,
        "home",
        "u1",
        1u64,
        json!({
            "componentId": "c9",
            "componentType": "text",
            "position": 0,
            "props": {},
            "item": item,
            "shifted": [],
        }),
    );
    *channel.mutation_reply.lock() = Some(MutationReply::Applied {
        event: event.clone(),
    });

    manager.connect().await.unwrap();
    let applied = manager
        .submit_mutation(MutationRequest::Insert {
            group: GroupKey::new("home", "main"),
            position: 0,
            kind: ItemKind::Component,
            item_type: "text".into(),
            payload: Map::new(),
            item_id: Some("c9".into()),
        })
        .await
        .unwrap();
    assert_eq!(applied.id, event.id);
    assert_eq!(manager.cached_item("c9").map(|i| i.version), Some(1));
}

#[tokio::test]
async fn test_presence_state_and_diff_applied() {
    let channel = MockChannel::healthy();
    let (manager, _) = manager(channel.clone());
    let updates = record(&manager, ClientEventKind::PresenceUpdate);
    manager.subscribe_to_page("home").await.unwrap();
    manager.connect().await.unwrap();

    let now = chrono::Utc::now();
    let entry = |conn: &str, user: &str| PresenceRecord {
        presence_ref: conn.to_string(),
        user_id: user.to_string(),
        user_name: None,
        component_id: None,
        action: None,
        online_at: now,
        last_seen: now,
    };
    channel.inject_frame(&Frame::PresenceState {
        page: "home".into(),
        records: vec![entry("c-1", "ada"), entry("c-2", "grace")],
    });
    eventually(|| manager.presence("home").len() == 2).await;

    channel.inject_frame(&Frame::PresenceDiff {
        page: "home".into(),
        joins: Vec::new(),
        leaves: vec![entry("c-1", "ada")],
    });
    eventually(|| manager.presence("home").len() == 1).await;
    assert_eq!(manager.presence("home")[0].user_id, "grace");
    assert_eq!(updates.lock().len(), 2);
}

#[tokio::test]
async fn test_tracked_presence_reannounced_on_connect() {
    let channel = MockChannel::healthy();
    let (manager, _) = manager(channel.clone());
    manager
        .track_presence(
            "home",
            pagesync_core::PresencePayload {
                user_id: "u1".into(),
                user_name: Some("Ada".into()),
                component_id: None,
                action: Some("editing".into()),
            },
        )
        .await
        .unwrap();
    assert!(channel.sent().is_empty());

    manager.connect().await.unwrap();
    assert!(channel
        .sent()
        .iter()
        .any(|frame| matches!(frame, Frame::PresenceTrack { page, .. } if page == "home")));
}
