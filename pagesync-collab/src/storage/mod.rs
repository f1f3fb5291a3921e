//! Storage collaborators for positioned items and the event log.
//!
//! ```text
//! ┌────────────────┐  GroupWrite (atomic)  ┌──────────────────────────────┐
//! │ PositionEngine │ ────────────────────► │ ItemStore                    │
//! └────────────────┘                       │   MemoryStore | RocksStore   │
//! ┌────────────────┐  sequence → bytes     ├──────────────────────────────┤
//! │ EventLog       │ ────────────────────► │ EventLogBackend              │
//! └────────────────┘                       └──────────────────────────────┘
//! ```
//!
//! Every write to a group is a [`GroupWrite`]: inserts plus compare-and-swaps
//! that name the version and order the engine read. A store applies the
//! whole batch or nothing; a mismatch fails with [`StoreError::Stale`] so the
//! engine can tell an external writer moved a row underneath it.

pub mod event_log;
pub mod memory;
pub mod rocks;

pub use event_log::{EventLog, LogEntry, LogError, RecoveryReport};
pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use pagesync_core::{GroupKey, PositionedItem};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("item `{0}` already exists")]
    Duplicate(String),
    #[error("item `{0}` not found")]
    NotFound(String),
    /// Stored version/order no longer matches what the writer read
    #[error("item `{item_id}` changed since it was read")]
    Stale { item_id: String },
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// New row; fails if the id exists
    Insert(PositionedItem),
    /// Replace a row still at `expected_version` / `expected_order`
    Swap {
        expected_version: u64,
        expected_order: u32,
        item: PositionedItem,
    },
}

impl WriteOp {
    pub fn item(&self) -> &PositionedItem {
        match self {
            WriteOp::Insert(item) => item,
            WriteOp::Swap { item, .. } => item,
        }
    }

    /// Check this op against the stored row.
    pub fn check(&self, stored: Option<&PositionedItem>) -> Result<(), StoreError> {
        match (self, stored) {
            (WriteOp::Insert(item), Some(_)) => Err(StoreError::Duplicate(item.id.clone())),
            (WriteOp::Insert(_), None) => Ok(()),
            (WriteOp::Swap { item, .. }, None) => Err(StoreError::NotFound(item.id.clone())),
            (
                WriteOp::Swap {
                    expected_version,
                    expected_order,
                    item,
                },
                Some(stored),
            ) => {
                if stored.version == *expected_version && stored.order == *expected_order {
                    Ok(())
                } else {
                    Err(StoreError::Stale {
                        item_id: item.id.clone(),
                    })
                }
            }
        }
    }
}

/// One atomic unit of item writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupWrite {
    ops: Vec<WriteOp>,
}

impl GroupWrite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, item: PositionedItem) {
        self.ops.push(WriteOp::Insert(item));
    }

    /// Replace `before` with `after`, guarded on `before`'s version and order.
    pub fn compare_and_swap(&mut self, before: &PositionedItem, after: PositionedItem) {
        self.ops.push(WriteOp::Swap {
            expected_version: before.version,
            expected_order: before.order,
            item: after,
        });
    }

    /// Shift the order of every active sibling with `from <= order <= to` by
    /// `delta`. Versions are left alone. Returns the shifted rows.
    pub fn shift_range(
        &mut self,
        siblings: &[PositionedItem],
        from: u32,
        to: u32,
        delta: i32,
    ) -> Vec<PositionedItem> {
        let mut shifted = Vec::new();
        if delta == 0 || from > to {
            return shifted;
        }
        for sibling in siblings
            .iter()
            .filter(|s| s.is_active && s.order >= from && s.order <= to)
        {
            let mut next = sibling.clone();
            next.order = sibling.order.saturating_add_signed(delta);
            self.compare_and_swap(sibling, next.clone());
            shifted.push(next);
        }
        shifted
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Persistence for positioned items.
pub trait ItemStore: Send + Sync {
    /// Active items of `group`, ascending by order.
    fn fetch_group(&self, group: &GroupKey) -> Result<Vec<PositionedItem>, StoreError>;

    /// Any item by id, active or not.
    fn get_item(&self, id: &str) -> Result<Option<PositionedItem>, StoreError>;

    /// Apply every op or none.
    fn commit(&self, write: GroupWrite) -> Result<(), StoreError>;

    /// Single-row update guarded on `expected_version`.
    fn compare_and_swap(
        &self,
        item_id: &str,
        expected_version: u64,
        update: &dyn Fn(&mut PositionedItem),
    ) -> Result<PositionedItem, StoreError> {
        let current = self
            .get_item(item_id)?
            .ok_or_else(|| StoreError::NotFound(item_id.to_string()))?;
        if current.version != expected_version {
            return Err(StoreError::Stale {
                item_id: item_id.to_string(),
            });
        }
        let mut next = current.clone();
        update(&mut next);
        let mut write = GroupWrite::new();
        write.compare_and_swap(&current, next.clone());
        self.commit(write)?;
        Ok(next)
    }
}

/// Append-only byte log keyed by sequence.
pub trait EventLogBackend: Send + Sync {
    fn append_entry(&self, sequence: u64, bytes: &[u8]) -> Result<(), StoreError>;

    /// Every entry, ascending by sequence.
    fn load_entries(&self) -> Result<Vec<(u64, Vec<u8>)>, StoreError>;

    fn last_sequence(&self) -> Result<Option<u64>, StoreError>;
}
