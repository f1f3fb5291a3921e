//! Append-only event log.
//!
//! Every accepted mutation is appended here before it is fanned out. Entries
//! are bincode records carrying the event JSON and a checksum:
//!
//! ```text
//! sequence (u64, monotonic) │ page_name │ event_id │ payload (JSON) │ checksum
//! ```
//!
//! Recovery re-reads every entry, verifies the checksum and skips (counts)
//! anything corrupt. Entries are never rewritten.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use pagesync_core::RealtimeEvent;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{EventLogBackend, StoreError};

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    #[error("log serialization error: {0}")]
    Serialization(String),
    #[error("log deserialization error: {0}")]
    Deserialization(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("checksum mismatch at sequence {sequence}")]
    Checksum { sequence: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: u64,
    pub page_name: String,
    pub event_id: String,
    /// Event JSON
    pub payload: Vec<u8>,
    pub checksum: u32,
}

impl LogEntry {
    pub fn new(sequence: u64, event: &RealtimeEvent) -> Result<Self, LogError> {
        let payload =
            serde_json::to_vec(event).map_err(|e| LogError::Serialization(e.to_string()))?;
        let checksum = Self::compute_checksum(sequence, &event.page_name, &event.id, &payload);
        Ok(Self {
            sequence,
            page_name: event.page_name.clone(),
            event_id: event.id.clone(),
            payload,
            checksum,
        })
    }

    pub fn verify(&self) -> bool {
        self.checksum
            == Self::compute_checksum(self.sequence, &self.page_name, &self.event_id, &self.payload)
    }

    /// FNV-1a style fold over every field.
    fn compute_checksum(sequence: u64, page_name: &str, event_id: &str, payload: &[u8]) -> u32 {
        let mut hash = FNV_OFFSET;
        for word in [sequence as u32, (sequence >> 32) as u32] {
            hash ^= word;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        for byte in page_name.bytes().chain([0]).chain(event_id.bytes()) {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        for chunk in payload.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            hash ^= u32::from_le_bytes(word);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }

    pub fn encode(&self) -> Result<Vec<u8>, LogError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| LogError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, LogError> {
        let (entry, _): (Self, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| LogError::Deserialization(e.to_string()))?;
        Ok(entry)
    }

    /// Decode the stored event, refusing entries that fail verification.
    pub fn event(&self) -> Result<RealtimeEvent, LogError> {
        if !self.verify() {
            return Err(LogError::Checksum {
                sequence: self.sequence,
            });
        }
        serde_json::from_slice(&self.payload).map_err(|e| LogError::Deserialization(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Verified entries, ascending by sequence
    pub entries: Vec<LogEntry>,
    pub corrupted: usize,
}

pub struct EventLog {
    backend: Arc<dyn EventLogBackend>,
    next_sequence: AtomicU64,
    /// Keeps assign-then-persist in sequence order
    append_lock: Mutex<()>,
}

impl EventLog {
    /// Resume after the highest stored sequence.
    pub fn open(backend: Arc<dyn EventLogBackend>) -> Result<Self, LogError> {
        let next = backend.last_sequence()?.map_or(1, |last| last + 1);
        log::debug!("event log opened, next sequence {}", next);
        Ok(Self {
            backend,
            next_sequence: AtomicU64::new(next),
            append_lock: Mutex::new(()),
        })
    }

    /// Persist `event`; returns its sequence.
    pub fn append(&self, event: &RealtimeEvent) -> Result<u64, LogError> {
        let _guard = self.append_lock.lock();
        let sequence = self.next_sequence.load(Ordering::SeqCst);
        let entry = LogEntry::new(sequence, event)?;
        self.backend.append_entry(sequence, &entry.encode()?)?;
        self.next_sequence.store(sequence + 1, Ordering::SeqCst);
        log::trace!(
            "persisted {} {} on {} at {}",
            event.kind,
            event.id,
            event.page_name,
            sequence
        );
        Ok(sequence)
    }

    /// Sequence the next append will get.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst)
    }

    /// Verified events for `page` with sequence greater than `since`.
    pub fn read_page(&self, page: &str, since: u64) -> Result<Vec<(u64, RealtimeEvent)>, LogError> {
        self.recover()?
            .entries
            .into_iter()
            .filter(|entry| entry.sequence > since && entry.page_name == page)
            .map(|entry| Ok((entry.sequence, entry.event()?)))
            .collect()
    }

    /// Reload everything, skipping entries that don't decode or verify.
    pub fn recover(&self) -> Result<RecoveryReport, LogError> {
        let mut report = RecoveryReport::default();
        for (sequence, bytes) in self.backend.load_entries()? {
            match LogEntry::decode(&bytes) {
                Ok(entry) if entry.verify() && entry.sequence == sequence => {
                    report.entries.push(entry)
                }
                _ => {
                    log::warn!("event log entry {} is corrupt, skipped", sequence);
                    report.corrupted += 1;
                }
            }
        }
        report.entries.sort_by_key(|e| e.sequence);
        Ok(report)
    }
}
