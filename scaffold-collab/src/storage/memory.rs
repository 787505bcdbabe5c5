//! In-memory snapshot store.
//!
//! Used when the server runs without a storage path, and by tests that need
//! to observe how often the persistence layer writes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{PersistedSnapshot, SnapshotStore, StoreError};
use crate::key::RoomKey;

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    rows: Mutex<HashMap<RoomKey, PersistedSnapshot>>,
    writes: AtomicU64,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `save` calls since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows().is_empty()
    }

    fn rows(&self) -> MutexGuard<'_, HashMap<RoomKey, PersistedSnapshot>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, key: &RoomKey) -> Result<Option<PersistedSnapshot>, StoreError> {
        Ok(self.rows().get(key).cloned())
    }

    fn save(&self, snapshot: &PersistedSnapshot) -> Result<(), StoreError> {
        let key = RoomKey::new(snapshot.room_type.clone(), snapshot.room_id.clone())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.rows().insert(key, snapshot.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
