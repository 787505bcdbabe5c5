//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots`: full document state per room (LZ4 compressed)
//! - `metadata`: bincode row header (room key, version, timestamps, sizes)
//!
//! Both are written in one atomic batch, so a row is never half-updated.
//!
//! Row key: `len(room_type):u16 BE ‖ room_type ‖ room_id`. The length prefix
//! keeps `("ab", "c")` and `("a", "bc")` apart.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{PersistedSnapshot, SnapshotStore, StoreError};
use crate::key::RoomKey;

/// Column family names.
const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("collab_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config rooted at `path` with the default tuning.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches).
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

/// Row header stored in the metadata column family.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotMeta {
    room_type: String,
    room_id: String,
    version: u64,
    updated_at: u64,
    /// Uncompressed state size in bytes
    snapshot_size: u64,
    /// Compressed state size in bytes
    compressed_size: u64,
}

impl SnapshotMeta {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Durable snapshot store.
pub struct RocksSnapshotStore {
    /// RocksDB instance (single-threaded mode; callers serialize via spawn_blocking)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksSnapshotStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        match name {
            CF_SNAPSHOTS => {
                // Values are already LZ4 framed
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// List every room that has a persisted row.
    pub fn list_rooms(&self) -> Result<Vec<RoomKey>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut keys = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let meta = SnapshotMeta::decode(&value)?;
            let key = RoomKey::new(meta.room_type, meta.room_id)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            keys.push(key);
        }

        Ok(keys)
    }

    /// Force memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn row_key(room_type: &str, room_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(2 + room_type.len() + room_id.len());
        key.extend_from_slice(&(room_type.len() as u16).to_be_bytes());
        key.extend_from_slice(room_type.as_bytes());
        key.extend_from_slice(room_id.as_bytes());
        key
    }
}

impl SnapshotStore for RocksSnapshotStore {
    fn load(&self, key: &RoomKey) -> Result<Option<PersistedSnapshot>, StoreError> {
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let row_key = Self::row_key(key.room_type(), key.room_id());

        let meta = match self.db.get_cf(cf_meta, &row_key)? {
            Some(bytes) => SnapshotMeta::decode(&bytes)?,
            None => return Ok(None),
        };
        if meta.room_type != key.room_type() || meta.room_id != key.room_id() {
            return Err(StoreError::Corrupt(key.clone()));
        }

        let compressed = self
            .db
            .get_cf(cf_snapshots, &row_key)?
            .ok_or_else(|| StoreError::Corrupt(key.clone()))?;
        let state = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;

        Ok(Some(PersistedSnapshot {
            room_type: meta.room_type,
            room_id: meta.room_id,
            state,
            version: meta.version,
            updated_at: meta.updated_at,
        }))
    }

    fn save(&self, snapshot: &PersistedSnapshot) -> Result<(), StoreError> {
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let row_key = Self::row_key(&snapshot.room_type, &snapshot.room_id);

        let compressed = lz4_flex::compress_prepend_size(&snapshot.state);
        let meta = SnapshotMeta {
            room_type: snapshot.room_type.clone(),
            room_id: snapshot.room_id.clone(),
            version: snapshot.version,
            updated_at: snapshot.updated_at,
            snapshot_size: snapshot.state.len() as u64,
            compressed_size: compressed.len() as u64,
        };

        // Atomic batch write: state + header
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snapshots, &row_key, &compressed);
        batch.put_cf(cf_meta, &row_key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(())
    }
}
