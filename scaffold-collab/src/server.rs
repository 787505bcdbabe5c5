//! Collaboration server: store, registry and router wired together.
//!
//! ```text
//! TcpListener ──► axum Router ──► RoomRegistry ──► Room tasks
//!                                                      │
//!                                              PersistenceService
//!                                                      │
//!                                      SnapshotStore (RocksDB | memory)
//! ```
//!
//! On shutdown the server stops accepting connections, then flushes every
//! live room so nothing newer than the last debounce window is lost.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use log::info;
use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::error::CollabError;
use crate::gateway;
use crate::persistence::PersistenceService;
use crate::registry::RoomRegistry;
use crate::storage::{MemorySnapshotStore, RocksSnapshotStore, SnapshotStore, StoreConfig};

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
}

impl CollabServer {
    /// Create a server, opening RocksDB at `storage_path` if one is set.
    pub fn new(config: ServerConfig) -> Result<Self, CollabError> {
        let store: Arc<dyn SnapshotStore> = match &config.storage_path {
            Some(path) => {
                let store = RocksSnapshotStore::open(StoreConfig::at(path.clone()))?;
                info!(
                    "Snapshot store opened at {} ({} rooms persisted)",
                    path.display(),
                    store.list_rooms()?.len()
                );
                Arc::new(store)
            }
            None => {
                info!("No storage path configured; snapshots are kept in memory");
                Arc::new(MemorySnapshotStore::new())
            }
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let persistence = PersistenceService::new(store, config.flush_debounce);
        Self {
            config,
            registry: Arc::new(RoomRegistry::new(persistence)),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn router(&self) -> Router {
        gateway::router(self.registry.clone(), &self.config.default_room_type)
    }

    /// Serve on `listener` until `shutdown` resolves, then flush all rooms.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), CollabError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Collaboration server listening on {}", listener.local_addr()?);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        let rooms = self.registry.room_count().await;
        let flushed = self.registry.flush_all().await;
        info!("Shutdown complete: flushed {flushed}/{rooms} rooms");
        Ok(())
    }

    /// Bind `config.bind_addr` and serve until Ctrl-C.
    pub async fn run(&self) -> Result<(), CollabError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::RoomKey;

    #[tokio::test]
    async fn test_memory_server_by_default() {
        let server = CollabServer::new(ServerConfig::for_testing()).unwrap();
        assert!(server.config().storage_path.is_none());
        assert_eq!(server.registry().room_count().await, 0);
    }

    #[tokio::test]
    async fn test_rocks_server_with_storage_path() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::for_testing()
        };
        let server = CollabServer::new(config).unwrap();

        let key = RoomKey::new("page", "abc").unwrap();
        server.registry().get_or_create(&key).await.unwrap();
        assert_eq!(server.registry().room_count().await, 1);
        assert!(dir.path().join("db").exists());
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let server = CollabServer::new(ServerConfig::for_testing()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        server.serve(listener, async {}).await.unwrap();
    }
}
