//! Outbound queue and batcher.
//!
//! Holds events that can't go out yet (offline, or behind a drain in
//! progress). Bounded: when full the oldest entry is evicted so recent edits
//! survive.
//!
//! Debounce: an event whose coalesce key matches the queue's tail entry, and
//! which arrives within `debounce_window` of that entry's last update, is
//! folded into it instead of being appended:
//! - batching off: the tail is replaced by the newer event
//! - batching on: the tail becomes one envelope whose `data` is the ordered
//!   array of both payloads
//!
//! Only the tail coalesces, so queue order always matches submission order.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use pagesync_core::RealtimeEvent;
use serde_json::Value;

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
struct QueuedEvent {
    event: RealtimeEvent,
    key: Option<String>,
    touched_at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    Appended,
    /// Folded into the previous entry
    Coalesced,
    /// The oldest entry, which was dropped to stay within capacity
    Evicted(Box<RealtimeEvent>),
}

#[derive(Debug)]
pub struct OutboundQueue {
    entries: VecDeque<QueuedEvent>,
    capacity: usize,
    debounce_window: Duration,
    batching: bool,
    evicted_total: u64,
}

impl OutboundQueue {
    pub fn new(capacity: usize, debounce_window: Duration, batching: bool) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            debounce_window,
            batching,
            evicted_total: 0,
        }
    }

    pub fn push(&mut self, event: RealtimeEvent) -> Enqueued {
        self.push_at(event, Instant::now())
    }

    /// Enqueue with an explicit arrival time.
    pub fn push_at(&mut self, event: RealtimeEvent, now: Instant) -> Enqueued {
        let key = event.coalesce_key();

        if let (Some(key), Some(tail)) = (&key, self.entries.back_mut()) {
            let fresh = now.saturating_duration_since(tail.touched_at) <= self.debounce_window;
            if fresh && tail.key.as_deref() == Some(key.as_str()) {
                if self.batching {
                    merge_into(&mut tail.event, event);
                } else {
                    tail.event = event;
                }
                tail.touched_at = now;
                return Enqueued::Coalesced;
            }
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front().map(|old| {
                self.evicted_total += 1;
                log::debug!(
                    "outbound queue full ({}), evicted event {} for page {}",
                    self.capacity,
                    old.event.id,
                    old.event.page_name
                );
                old.event
            })
        } else {
            None
        };

        self.entries.push_back(QueuedEvent {
            event,
            key,
            touched_at: now,
        });

        match evicted {
            Some(old) => Enqueued::Evicted(Box::new(old)),
            None => Enqueued::Appended,
        }
    }

    pub fn pop_front(&mut self) -> Option<RealtimeEvent> {
        self.entries.pop_front().map(|q| q.event)
    }

    /// Put back an event whose send failed; it goes out first next time.
    /// It is the oldest entry, so on a full queue it is the one dropped.
    pub fn push_front(&mut self, event: RealtimeEvent) -> Enqueued {
        if self.entries.len() >= self.capacity {
            self.evicted_total += 1;
            log::debug!(
                "outbound queue full ({}), dropped returned event {} for page {}",
                self.capacity,
                event.id,
                event.page_name
            );
            return Enqueued::Evicted(Box::new(event));
        }
        let key = event.coalesce_key();
        self.entries.push_front(QueuedEvent {
            event,
            key,
            touched_at: Instant::now(),
        });
        Enqueued::Appended
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted_total(&self) -> u64 {
        self.evicted_total
    }

    /// Queued events, oldest first.
    pub fn snapshot(&self) -> Vec<RealtimeEvent> {
        self.entries.iter().map(|q| q.event.clone()).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Fold `next` into `batch`: data becomes an array of payloads in arrival
/// order; envelope metadata follows the newest event.
fn merge_into(batch: &mut RealtimeEvent, next: RealtimeEvent) {
    let mut entries = match std::mem::take(&mut batch.data) {
        Value::Array(entries) => entries,
        single => vec![single],
    };
    match next.data {
        Value::Array(more) => entries.extend(more),
        single => entries.push(single),
    }
    batch.id = next.id;
    batch.user_id = next.user_id;
    batch.timestamp = next.timestamp;
    batch.version = next.version;
    batch.data = Value::Array(entries);
}
