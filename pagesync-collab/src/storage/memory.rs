//! In-memory item store and event log backend.

use std::collections::{BTreeMap, HashMap};

use pagesync_core::{GroupKey, PositionedItem};
use parking_lot::RwLock;

use super::{EventLogBackend, GroupWrite, ItemStore, StoreError, WriteOp};

#[derive(Debug, Default)]
pub struct MemoryStore {
    items: RwLock<HashMap<String, PositionedItem>>,
    events: RwLock<BTreeMap<u64, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row, active or not, ordered by id.
    pub fn all_items(&self) -> Vec<PositionedItem> {
        let mut items: Vec<_> = self.items.read().values().cloned().collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }

    /// Overwrite a row without any check. Simulates a writer that bypasses
    /// the engine.
    pub fn put_unchecked(&self, item: PositionedItem) {
        self.items.write().insert(item.id.clone(), item);
    }

    /// Overwrite a stored entry's bytes in place.
    pub fn corrupt_entry(&self, sequence: u64, bytes: Vec<u8>) {
        self.events.write().insert(sequence, bytes);
    }
}

impl ItemStore for MemoryStore {
    fn fetch_group(&self, group: &GroupKey) -> Result<Vec<PositionedItem>, StoreError> {
        let mut items: Vec<PositionedItem> = self
            .items
            .read()
            .values()
            .filter(|i| i.is_active && i.in_group(group))
            .cloned()
            .collect();
        items.sort_by_key(|i| i.order);
        Ok(items)
    }

    fn get_item(&self, id: &str) -> Result<Option<PositionedItem>, StoreError> {
        Ok(self.items.read().get(id).cloned())
    }

    fn commit(&self, write: GroupWrite) -> Result<(), StoreError> {
        let mut items = self.items.write();
        for op in write.ops() {
            op.check(items.get(&op.item().id))?;
        }
        for op in write.into_ops() {
            let item = match op {
                WriteOp::Insert(item) => item,
                WriteOp::Swap { item, .. } => item,
            };
            items.insert(item.id.clone(), item);
        }
        Ok(())
    }
}

impl EventLogBackend for MemoryStore {
    fn append_entry(&self, sequence: u64, bytes: &[u8]) -> Result<(), StoreError> {
        self.events.write().insert(sequence, bytes.to_vec());
        Ok(())
    }

    fn load_entries(&self) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        Ok(self
            .events
            .read()
            .iter()
            .map(|(seq, bytes)| (*seq, bytes.clone()))
            .collect())
    }

    fn last_sequence(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.events.read().keys().next_back().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagesync_core::ItemKind;

    fn item(id: &str, order: u32) -> PositionedItem {
        PositionedItem::new(
            id,
            ItemKind::Component,
            "text",
            &GroupKey::new("home", "main"),
            order,
            Default::default(),
            "u1",
        )
    }

    #[test]
    fn test_commit_is_all_or_nothing() {
        let store = MemoryStore::new();
        let mut write = GroupWrite::new();
        write.insert(item("a", 0));
        write.insert(item("b", 1));
        store.commit(write).unwrap();

        let a = store.get_item("a").unwrap().unwrap();
        let mut stale_a = a.clone();
        stale_a.version = 9;

        let mut write = GroupWrite::new();
        write.insert(item("c", 2));
        write.compare_and_swap(&stale_a, item("a", 5));
        assert!(matches!(store.commit(write), Err(StoreError::Stale { .. })));
        assert!(store.get_item("c").unwrap().is_none());
        assert_eq!(store.get_item("a").unwrap().unwrap().order, 0);
    }

    #[test]
    fn test_fetch_group_sorted_active_only() {
        let store = MemoryStore::new();
        let mut write = GroupWrite::new();
        write.insert(item("b", 1));
        write.insert(item("a", 0));
        let mut gone = item("z", 2);
        gone.is_active = false;
        write.insert(gone);
        store.commit(write).unwrap();

        let ids: Vec<_> = store
            .fetch_group(&GroupKey::new("home", "main"))
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(store.all_items().len(), 3);
    }

    #[test]
    fn test_single_row_compare_and_swap() {
        let store = MemoryStore::new();
        store.put_unchecked(item("a", 0));

        let updated = store
            .compare_and_swap("a", 1, &|i: &mut PositionedItem| i.touch("u2"))
            .unwrap();
        assert_eq!(updated.version, 2);
        assert!(matches!(
            store.compare_and_swap("a", 1, &|i: &mut PositionedItem| i.touch("u2")),
            Err(StoreError::Stale { .. })
        ));
        assert!(matches!(
            store.compare_and_swap("missing", 1, &|_: &mut PositionedItem| {}),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_event_entries() {
        let store = MemoryStore::new();
        assert_eq!(store.last_sequence().unwrap(), None);
        store.append_entry(2, b"two").unwrap();
        store.append_entry(1, b"one").unwrap();
        assert_eq!(store.last_sequence().unwrap(), Some(2));
        let seqs: Vec<_> = store.load_entries().unwrap().into_iter().map(|(s, _)| s).collect();
        assert_eq!(seqs, vec![1, 2]);
    }
}
