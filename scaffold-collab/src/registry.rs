//! Registry of live rooms.
//!
//! Maps `RoomKey → RoomHandle`. Each key gets a `OnceCell`, so concurrent
//! first connections to a cold room all wait on the same initialization and
//! receive the same handle. The map lock only guards cell lookup; the storage
//! read that hydrates a room happens outside it, so a slow load never stalls
//! connections to other rooms.
//!
//! A room whose task has stopped is replaced on the next `get_or_create`,
//! hydrated again from its last snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::{Mutex, OnceCell};

use crate::error::CollabError;
use crate::key::RoomKey;
use crate::persistence::PersistenceService;
use crate::room::{Room, RoomHandle};
use crate::storage::StoreError;

pub struct RoomRegistry {
    rooms: Mutex<HashMap<RoomKey, Arc<OnceCell<RoomHandle>>>>,
    persistence: PersistenceService,
}

impl RoomRegistry {
    pub fn new(persistence: PersistenceService) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            persistence,
        }
    }

    /// Return the live room for `key`, creating and hydrating it if needed.
    ///
    /// A failed load leaves the slot empty; the next caller retries.
    pub async fn get_or_create(&self, key: &RoomKey) -> Result<RoomHandle, CollabError> {
        let cell = {
            let mut rooms = self.rooms.lock().await;
            let cell = rooms.entry(key.clone()).or_default();
            if cell.get().is_some_and(RoomHandle::is_closed) {
                warn!("Room {key} stopped; reopening from its last snapshot");
                *cell = Arc::default();
            }
            cell.clone()
        };

        let handle = cell
            .get_or_try_init(|| self.create(key))
            .await?;
        Ok(handle.clone())
    }

    async fn create(&self, key: &RoomKey) -> Result<RoomHandle, CollabError> {
        let snapshot = self.persistence.load(key).await?;
        if let Some(row) = &snapshot {
            if !row.is_for(key) {
                return Err(StoreError::Corrupt(key.clone()).into());
            }
        }

        let hydrated = snapshot.as_ref().map(|row| (row.version, row.state.len()));
        let handle = Room::spawn(key.clone(), snapshot, self.persistence.clone())?;

        match hydrated {
            Some((version, bytes)) => {
                info!("Opened room {key} from snapshot v{version} ({bytes} bytes)")
            }
            None => info!("Opened new room {key}"),
        }
        Ok(handle)
    }

    /// Look up a live room without creating it.
    pub async fn get(&self, key: &RoomKey) -> Option<RoomHandle> {
        let rooms = self.rooms.lock().await;
        rooms
            .get(key)
            .and_then(|cell| cell.get())
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        let rooms = self.rooms.lock().await;
        rooms
            .values()
            .filter(|cell| cell.get().is_some_and(|handle| !handle.is_closed()))
            .count()
    }

    /// Flush every live room now and wait for the writes.
    ///
    /// Returns the number of rooms flushed without error; failures are logged.
    pub async fn flush_all(&self) -> usize {
        let handles: Vec<RoomHandle> = {
            let rooms = self.rooms.lock().await;
            rooms
                .values()
                .filter_map(|cell| cell.get())
                .filter(|handle| !handle.is_closed())
                .cloned()
                .collect()
        };

        let mut flushed = 0;
        for handle in handles {
            match handle.flush().await {
                Ok(()) => flushed += 1,
                Err(e) => error!("Failed to flush room {}: {e}", handle.key()),
            }
        }
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::room::PEER_QUEUE_CAPACITY;
    use crate::storage::{MemorySnapshotStore, PersistedSnapshot, SnapshotStore};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;
    use yrs::{Text, WriteTxn};

    /// Store that counts loads and can be told to fail them.
    #[derive(Default)]
    struct CountingStore {
        inner: MemorySnapshotStore,
        loads: AtomicUsize,
        fail_loads: AtomicBool,
    }

    impl SnapshotStore for CountingStore {
        fn load(&self, key: &RoomKey) -> Result<Option<PersistedSnapshot>, StoreError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            // Widen the race window for concurrent creation
            std::thread::sleep(Duration::from_millis(20));
            if self.fail_loads.load(Ordering::SeqCst) {
                return Err(StoreError::Database("load failed".into()));
            }
            self.inner.load(key)
        }

        fn save(&self, snapshot: &PersistedSnapshot) -> Result<(), StoreError> {
            self.inner.save(snapshot)
        }
    }

    fn registry(store: Arc<dyn SnapshotStore>) -> RoomRegistry {
        RoomRegistry::new(PersistenceService::new(store, Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn test_same_key_same_room() {
        let registry = registry(Arc::new(MemorySnapshotStore::new()));
        let key = RoomKey::new("page", "abc").unwrap();

        let first = registry.get_or_create(&key).await.unwrap();
        let second = registry.get_or_create(&key).await.unwrap();

        let (tx, _rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
        first.join(Uuid::new_v4(), tx).await.unwrap();
        assert_eq!(second.stats().await.unwrap().peers, 1);
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let registry = registry(Arc::new(MemorySnapshotStore::new()));
        let page = RoomKey::new("page", "abc").unwrap();
        let graph = RoomKey::new("graph", "abc").unwrap();

        let a = registry.get_or_create(&page).await.unwrap();
        registry.get_or_create(&graph).await.unwrap();

        let (tx, _rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
        a.join(Uuid::new_v4(), tx).await.unwrap();

        let b = registry.get(&graph).await.unwrap();
        assert_eq!(b.stats().await.unwrap().peers, 0);
        assert_eq!(registry.room_count().await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_creation_loads_once() {
        let store = Arc::new(CountingStore::default());
        let registry = Arc::new(registry(store.clone()));
        let key = RoomKey::new("page", "hot").unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                let room = registry.get_or_create(&key).await.unwrap();
                let (tx, _rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
                room.join(Uuid::new_v4(), tx).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
        assert_eq!(registry.room_count().await, 1);
        let room = registry.get(&key).await.unwrap();
        assert_eq!(room.stats().await.unwrap().peers, 8);
    }

    #[tokio::test]
    async fn test_load_failure_is_retryable() {
        let store = Arc::new(CountingStore::default());
        store.fail_loads.store(true, Ordering::SeqCst);
        let registry = registry(store.clone());
        let key = RoomKey::new("page", "abc").unwrap();

        assert!(matches!(
            registry.get_or_create(&key).await,
            Err(CollabError::Store(_))
        ));
        assert!(registry.get(&key).await.is_none());
        assert_eq!(registry.room_count().await, 0);

        store.fail_loads.store(false, Ordering::SeqCst);
        assert!(registry.get_or_create(&key).await.is_ok());
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_get_never_creates() {
        let registry = registry(Arc::new(MemorySnapshotStore::new()));
        let key = RoomKey::new("page", "abc").unwrap();
        assert!(registry.get(&key).await.is_none());
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_cold_start_hydrates() {
        let store = Arc::new(MemorySnapshotStore::new());
        let key = RoomKey::new("page", "abc").unwrap();

        let source = Document::new();
        source.edit(|txn| {
            let content = txn.get_or_insert_text("content");
            content.insert(txn, 0, "from disk");
        });
        store
            .save(&PersistedSnapshot::new(&key, source.encode_state(), 4))
            .unwrap();

        let registry = registry(store);
        let room = registry.get_or_create(&key).await.unwrap();

        assert_eq!(room.encode_state().await.unwrap(), source.encode_state());
        assert_eq!(room.stats().await.unwrap().last_persisted_version, 4);
    }

    #[tokio::test]
    async fn test_stopped_room_is_reopened() {
        let store = Arc::new(CountingStore::default());
        let key = RoomKey::new("page", "abc").unwrap();

        let source = Document::new();
        source.edit(|txn| {
            let content = txn.get_or_insert_text("content");
            content.insert(txn, 0, "survives");
        });
        store
            .inner
            .save(&PersistedSnapshot::new(&key, source.encode_state(), 3))
            .unwrap();

        let registry = registry(store.clone());
        registry.rooms.lock().await.insert(
            key.clone(),
            Arc::new(OnceCell::from(RoomHandle::stopped(key.clone()))),
        );
        assert!(registry.get(&key).await.is_none());
        assert_eq!(registry.room_count().await, 0);
        assert_eq!(registry.flush_all().await, 0);

        let room = registry.get_or_create(&key).await.unwrap();
        assert!(!room.is_closed());
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
        assert_eq!(room.encode_state().await.unwrap(), source.encode_state());
        assert_eq!(room.stats().await.unwrap().last_persisted_version, 3);

        // The replacement is what later callers see
        let again = registry.get_or_create(&key).await.unwrap();
        let (tx, _rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
        again.join(Uuid::new_v4(), tx).await.unwrap();
        assert_eq!(room.stats().await.unwrap().peers, 1);
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_flush_all_writes_dirty_rooms() {
        let store = Arc::new(MemorySnapshotStore::new());
        let registry = registry(store.clone());

        for id in ["a", "b"] {
            let key = RoomKey::new("page", id).unwrap();
            let room = registry.get_or_create(&key).await.unwrap();
            let source = Document::new();
            let update = source.edit(|txn| {
                let content = txn.get_or_insert_text("content");
                content.insert(txn, 0, id);
            });
            room.apply_update(Uuid::new_v4(), update).unwrap();
        }
        registry
            .get_or_create(&RoomKey::new("page", "clean").unwrap())
            .await
            .unwrap();

        assert_eq!(registry.flush_all().await, 3);
        assert_eq!(store.write_count(), 2);
        assert_eq!(store.len(), 2);
    }
}
