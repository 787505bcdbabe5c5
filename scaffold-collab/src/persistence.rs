//! Snapshot persistence with debounced flushing.
//!
//! Rooms never write on every update. Each update re-arms a [`Debouncer`];
//! only once the room has been quiet for a full window does it ask to flush.
//! The room then encodes its state and hands the row to
//! [`PersistenceService::save`], which runs the blocking store call on
//! tokio's blocking pool so relay traffic never waits on disk.
//!
//! ```text
//! update ──► schedule() ──► [window resets] ──► quiet ──► fire()
//!                                                           │
//!                                       Room: Flush ◄───────┘
//!                                             │ encode + version
//!                                             ▼
//!                                 spawn_blocking(store.save)
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::key::RoomKey;
use crate::storage::{PersistedSnapshot, SnapshotStore, StoreError};

/// Default quiet window before a dirty room is flushed.
pub const DEFAULT_FLUSH_DEBOUNCE: Duration = Duration::from_millis(1000);

/// Async front for a [`SnapshotStore`].
#[derive(Clone)]
pub struct PersistenceService {
    store: Arc<dyn SnapshotStore>,
    debounce: Duration,
}

impl PersistenceService {
    pub fn new(store: Arc<dyn SnapshotStore>, debounce: Duration) -> Self {
        Self { store, debounce }
    }

    /// Quiet window used by rooms built on this service.
    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Read the persisted row for `key`, if any.
    pub async fn load(&self, key: &RoomKey) -> Result<Option<PersistedSnapshot>, StoreError> {
        let store = self.store.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || store.load(&key))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Upsert one row off the async runtime.
    pub async fn save(&self, snapshot: PersistedSnapshot) -> Result<(), StoreError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save(&snapshot))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

/// Trailing-edge debounce timer.
///
/// Every [`schedule`](Self::schedule) restarts the window. `fire` runs once
/// per quiet window; returning `false` stops the timer task for good.
/// Dropping the `Debouncer` also stops it, without firing.
pub struct Debouncer {
    trigger: mpsc::UnboundedSender<()>,
}

impl Debouncer {
    pub fn spawn<F>(window: Duration, mut fire: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (trigger, mut rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                loop {
                    match tokio::time::timeout(window, rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) => return,
                        Err(_elapsed) => break,
                    }
                }
                if !fire() {
                    return;
                }
            }
        });

        Self { trigger }
    }

    /// Arm (or re-arm) the timer.
    pub fn schedule(&self) {
        let _ = self.trigger.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySnapshotStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn counting_debouncer(window: Duration) -> (Debouncer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let debouncer = Debouncer::spawn(window, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        (debouncer, fired)
    }

    #[tokio::test]
    async fn test_debounce_coalesces_burst() {
        let (debouncer, fired) = counting_debouncer(Duration::from_millis(80));

        for _ in 0..5 {
            debouncer.schedule();
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_debounce_fires_per_quiet_window() {
        let (debouncer, fired) = counting_debouncer(Duration::from_millis(40));

        debouncer.schedule();
        sleep(Duration::from_millis(200)).await;
        debouncer.schedule();
        sleep(Duration::from_millis(200)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_debounce_stops_when_fire_declines() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let debouncer = Debouncer::spawn(Duration::from_millis(20), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            false
        });

        debouncer.schedule();
        sleep(Duration::from_millis(150)).await;
        debouncer.schedule();
        sleep(Duration::from_millis(150)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_debouncer_never_fires() {
        let (debouncer, fired) = counting_debouncer(Duration::from_millis(30));
        debouncer.schedule();
        drop(debouncer);

        sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_service_save_then_load() {
        let store = Arc::new(MemorySnapshotStore::new());
        let service = PersistenceService::new(store.clone(), DEFAULT_FLUSH_DEBOUNCE);
        let key = RoomKey::new("page", "abc").unwrap();

        assert!(service.load(&key).await.unwrap().is_none());

        service
            .save(PersistedSnapshot::new(&key, vec![9, 9, 9], 1))
            .await
            .unwrap();

        let row = service.load(&key).await.unwrap().unwrap();
        assert_eq!(row.state, vec![9, 9, 9]);
        assert_eq!(row.version, 1);
        assert_eq!(store.write_count(), 1);
        assert_eq!(service.debounce(), Duration::from_millis(1000));
    }
}
