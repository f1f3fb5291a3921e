//! RocksDB-backed item store and event log backend.
//!
//! Column families:
//! - `items`: item rows keyed by id (JSON, LZ4 compressed)
//! - `groups`: membership index `page \0 section \0 parent \0 id` → empty,
//!   active items only, so a group is one prefix scan
//! - `events`: event log entries keyed by big-endian sequence
//!
//! A commit reads, checks and writes under one mutex and lands as a single
//! `WriteBatch`, so a group write is atomic on disk.

use std::path::{Path, PathBuf};

use pagesync_core::{GroupKey, PositionedItem};
use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};

use super::{EventLogBackend, GroupWrite, ItemStore, StoreError};

const CF_ITEMS: &str = "items";
const CF_GROUPS: &str = "groups";
const CF_EVENTS: &str = "events";

const COLUMN_FAMILIES: &[&str] = &[CF_ITEMS, CF_GROUPS, CF_EVENTS];

const KEY_SEPARATOR: u8 = 0;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every commit (default: true, the event log is the audit trail)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pagesync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-check-write in `commit`
    commit_lock: Mutex<()>,
}

impl RocksStore {
    /// Open (creating if missing) the store at `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("opened item store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            commit_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_ITEMS => {
                // Values are already LZ4 framed
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_GROUPS => {
                opts.set_compression_type(DBCompressionType::Lz4);
            }
            CF_EVENTS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    /// `page \0 section \0 parent \0`
    fn group_prefix(group: &GroupKey) -> Vec<u8> {
        let parent = group.parent_id.as_deref().unwrap_or("");
        let mut key = Vec::with_capacity(group.page_id.len() + group.section_id.len() + parent.len() + 3);
        for part in [group.page_id.as_str(), group.section_id.as_str(), parent] {
            key.extend_from_slice(part.as_bytes());
            key.push(KEY_SEPARATOR);
        }
        key
    }

    fn group_key(item: &PositionedItem) -> Vec<u8> {
        let mut key = Self::group_prefix(&item.group());
        key.extend_from_slice(item.id.as_bytes());
        key
    }

    fn encode_item(item: &PositionedItem) -> Result<Vec<u8>, StoreError> {
        let json = serde_json::to_vec(item).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&json))
    }

    fn decode_item(bytes: &[u8]) -> Result<PositionedItem, StoreError> {
        let json = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

impl ItemStore for RocksStore {
    fn fetch_group(&self, group: &GroupKey) -> Result<Vec<PositionedItem>, StoreError> {
        let cf = self.cf(CF_GROUPS)?;
        let prefix = Self::group_prefix(group);

        let mut items = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix.as_slice(), Direction::Forward));
        for entry in iter {
            let (key, _) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            let id = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            match self.get_item(&id)? {
                Some(item) if item.is_active && item.in_group(group) => items.push(item),
                _ => log::warn!("group index for {} points at missing item {}", group, id),
            }
        }
        items.sort_by_key(|i| i.order);
        Ok(items)
    }

    fn get_item(&self, id: &str) -> Result<Option<PositionedItem>, StoreError> {
        let cf = self.cf(CF_ITEMS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode_item(&bytes)?)),
            None => Ok(None),
        }
    }

    fn commit(&self, write: GroupWrite) -> Result<(), StoreError> {
        let cf_items = self.cf(CF_ITEMS)?;
        let cf_groups = self.cf(CF_GROUPS)?;
        let _guard = self.commit_lock.lock();

        let mut batch = WriteBatch::default();
        for op in write.ops() {
            let item = op.item();
            let stored = self.get_item(&item.id)?;
            op.check(stored.as_ref())?;

            if let Some(stored) = stored.as_ref().filter(|s| s.is_active) {
                batch.delete_cf(&cf_groups, Self::group_key(stored));
            }
            if item.is_active {
                batch.put_cf(&cf_groups, Self::group_key(item), b"");
            }
            batch.put_cf(&cf_items, item.id.as_bytes(), Self::encode_item(item)?);
        }

        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }
}

impl EventLogBackend for RocksStore {
    fn append_entry(&self, sequence: u64, bytes: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(CF_EVENTS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, sequence.to_be_bytes(), bytes);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn load_entries(&self) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_EVENTS)?;
        let mut entries = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = entry?;
            if let Some(sequence) = decode_sequence(&key) {
                entries.push((sequence, value.to_vec()));
            }
        }
        Ok(entries)
    }

    fn last_sequence(&self) -> Result<Option<u64>, StoreError> {
        let cf = self.cf(CF_EVENTS)?;
        let mut iter = self.db.iterator_cf(&cf, IteratorMode::End);
        match iter.next() {
            Some(entry) => {
                let (key, _) = entry?;
                Ok(decode_sequence(&key))
            }
            None => Ok(None),
        }
    }
}

fn decode_sequence(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
