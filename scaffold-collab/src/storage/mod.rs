//! Durable snapshot storage for rooms.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   PersistedSnapshot   ┌─────────────────────┐
//! │ Room actor  │ ────────────────────► │ PersistenceService  │
//! │ (encodes)   │                       │ (spawn_blocking)    │
//! └─────────────┘                       └──────────┬──────────┘
//!                                                  │ SnapshotStore
//!                                   ┌──────────────┴──────────────┐
//!                                   ▼                             ▼
//!                        ┌────────────────────┐        ┌────────────────────┐
//!                        │ RocksSnapshotStore │        │ MemorySnapshotStore│
//!                        │ CF "snapshots"     │        │ (tests, no disk)   │
//!                        │ CF "metadata"      │        └────────────────────┘
//!                        └────────────────────┘
//! ```
//!
//! One row per `(room_type, room_id)`, overwritten on every flush. Rows are
//! never deleted by the collaboration core.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 3

pub mod memory;
pub mod rocks;

pub use memory::MemorySnapshotStore;
pub use rocks::{RocksSnapshotStore, StoreConfig};

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::key::RoomKey;

/// The persisted state of one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub room_type: String,
    pub room_id: String,
    /// Full encoded document state.
    pub state: Vec<u8>,
    /// Incremented by one on every successful flush.
    pub version: u64,
    /// Seconds since the Unix epoch.
    pub updated_at: u64,
}

impl PersistedSnapshot {
    /// Build a row for `key`, stamped with the current time.
    pub fn new(key: &RoomKey, state: Vec<u8>, version: u64) -> Self {
        Self {
            room_type: key.room_type().to_string(),
            room_id: key.room_id().to_string(),
            state,
            version,
            updated_at: unix_now(),
        }
    }

    /// Whether this row belongs to `key`.
    pub fn is_for(&self, key: &RoomKey) -> bool {
        self.room_type == key.room_type() && self.room_id == key.room_id()
    }
}

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// RocksDB internal error
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    /// The blocking storage task panicked or was cancelled.
    #[error("Storage task failed: {0}")]
    Task(String),
    /// The room key stored in a row does not match the row's primary key.
    #[error("Corrupt snapshot row for {0}")]
    Corrupt(RoomKey),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// A row store keyed by `(room_type, room_id)`.
///
/// Implementations are synchronous; callers run them off the async runtime.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Read the row for `key`, or `None` if the room was never flushed.
    fn load(&self, key: &RoomKey) -> Result<Option<PersistedSnapshot>, StoreError>;

    /// Upsert the row keyed by the snapshot's `(room_type, room_id)`.
    fn save(&self, snapshot: &PersistedSnapshot) -> Result<(), StoreError>;
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
