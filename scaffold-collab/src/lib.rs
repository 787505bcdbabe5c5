//! # scaffold-collab: room-scoped real-time collaboration core
//!
//! Clients connect over WebSocket to a room addressed by `(room_type,
//! room_id)`. The server keeps one authoritative CRDT document per room,
//! relays every update to the room's other peers, fans out ephemeral
//! awareness state, and persists debounced snapshots.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket    ┌──────────────┐  get_or_create  ┌──────────────┐
//! │ Client      │ ◄────────────► │ gateway      │ ──────────────► │ RoomRegistry │
//! │ (CRDT doc)  │ binary + JSON  │ (axum)       │                 └──────┬───────┘
//! └─────────────┘                └──────┬───────┘                        │
//!                                       │ RoomHandle (commands)          ▼
//!                                       └──────────────────────► ┌──────────────┐
//!                                                                │ Room task    │
//!                                                                │ Document     │
//!                                                                │ Awareness    │
//!                                                                └──────┬───────┘
//!                                                                       │ debounced
//!                                                                       ▼
//!                                                                ┌──────────────┐
//!                                                                │ Persistence  │
//!                                                                │ (RocksDB)    │
//!                                                                └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`key`]: validated `(room_type, room_id)` identifiers
//! - [`document`]: Yrs-backed mergeable document
//! - [`awareness`]: per-client presence map
//! - [`protocol`]: frame classification and control messages
//! - [`room`]: per-room actor and its handle
//! - [`registry`]: one live room per key
//! - [`persistence`]: debounced snapshot flushing
//! - [`storage`]: snapshot stores (RocksDB, memory)
//! - [`gateway`]: HTTP/WebSocket routes
//! - [`server`]: wiring and graceful shutdown

pub mod awareness;
pub mod config;
pub mod document;
pub mod error;
pub mod gateway;
pub mod key;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod storage;
mod update_check;

// Re-exports for convenience
pub use awareness::AwarenessMap;
pub use config::ServerConfig;
pub use document::{Document, DocumentError};
pub use error::CollabError;
pub use key::{KeyError, RoomKey};
pub use persistence::{Debouncer, PersistenceService};
pub use protocol::{classify_frame, ControlMessage, Frame, Inbound, Outbound, ServerMessage};
pub use registry::RoomRegistry;
pub use room::{
    Joined, PeerId, RoomError, RoomHandle, RoomStats, PEER_QUEUE_CAPACITY,
};
pub use server::CollabServer;
pub use storage::{
    MemorySnapshotStore, PersistedSnapshot, RocksSnapshotStore, SnapshotStore, StoreConfig,
    StoreError,
};
