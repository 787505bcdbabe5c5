//! Room actor: the single writer for one collaborative document.
//!
//! Architecture:
//! ```text
//! Gateway (peer A) ──┐                       ┌──► Peer A outbound (mpsc)
//! Gateway (peer B) ──┼─► RoomCommand (mpsc) ─┤
//! Debouncer ─────────┤        │              └──► Peer B outbound (mpsc)
//! Flush task ────────┘        ▼
//!                      Room task (owns Document, peers, awareness)
//! ```
//!
//! Every mutation goes through the command channel and is handled to
//! completion before the next one starts, so the document, the peer set and
//! the awareness map never see interleaved writes. Fan-out enqueues into
//! bounded per-peer queues without waiting: a dead peer only loses its own
//! frames, and a peer whose queue fills up is dropped from the room.

use std::collections::HashMap;
use std::time::Instant;

use log::{debug, error, info, trace, warn};
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::awareness::AwarenessMap;
use crate::document::{Document, DocumentError};
use crate::key::RoomKey;
use crate::persistence::{Debouncer, PersistenceService};
use crate::protocol::{Outbound, ServerMessage};
use crate::storage::{PersistedSnapshot, StoreError};

/// Identifies one connection within the server.
pub type PeerId = Uuid;

/// Outbound queue of one peer, drained by its connection writer.
pub type PeerSender = mpsc::Sender<Outbound>;

/// Frames a peer may have queued before the room drops it.
pub const PEER_QUEUE_CAPACITY: usize = 256;

/// Room errors.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    /// The room task is gone; no further commands will be processed.
    #[error("Room is closed")]
    Closed,
    #[error("Flush failed: {0}")]
    Persistence(#[from] StoreError),
}

/// What a joining peer needs before it can relay.
#[derive(Debug, Clone)]
pub struct Joined {
    /// Full encoded document state (bootstrap frame).
    pub state: Vec<u8>,
    pub awareness: AwarenessMap,
}

/// Point-in-time room statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub peers: usize,
    pub awareness_entries: usize,
    /// Updates applied since the last flush hand-off.
    pub dirty: bool,
    /// 0 until the first successful flush.
    pub last_persisted_version: u64,
}

/// A connected peer, owned by its room.
struct Peer {
    sender: PeerSender,
    /// Awareness id bound by the peer's first awareness message.
    client_id: Option<String>,
    joined_at: Instant,
}

type FlushReply = oneshot::Sender<Result<(), StoreError>>;

enum RoomCommand {
    Join {
        peer_id: PeerId,
        sender: PeerSender,
        reply: oneshot::Sender<Joined>,
    },
    Leave {
        peer_id: PeerId,
        reply: oneshot::Sender<()>,
    },
    Update {
        peer_id: PeerId,
        update: Vec<u8>,
    },
    Awareness {
        peer_id: PeerId,
        client_id: String,
        state: Value,
    },
    Ping {
        peer_id: PeerId,
    },
    SyncRequest {
        peer_id: PeerId,
    },
    EncodeState {
        reply: oneshot::Sender<Vec<u8>>,
    },
    GetAwareness {
        reply: oneshot::Sender<AwarenessMap>,
    },
    Stats {
        reply: oneshot::Sender<RoomStats>,
    },
    Flush {
        reply: Option<FlushReply>,
    },
    FlushCompleted {
        version: u64,
        result: Result<(), StoreError>,
    },
}

/// Room state. Lives on its own task; reached only through [`RoomHandle`].
pub(crate) struct Room {
    key: RoomKey,
    document: Document,
    peers: HashMap<PeerId, Peer>,
    awareness: AwarenessMap,
    persistence: PersistenceService,
    debouncer: Debouncer,
    commands: mpsc::WeakUnboundedSender<RoomCommand>,
    dirty: bool,
    last_persisted_version: u64,
    flush_in_flight: bool,
    flush_pending: bool,
    flush_waiters: Vec<FlushReply>,
}

impl Room {
    /// Build a room from an optional persisted row and start its task.
    ///
    /// Hydration happens here, before the handle exists, so no peer can join
    /// an empty document that is about to be overwritten.
    pub(crate) fn spawn(
        key: RoomKey,
        snapshot: Option<PersistedSnapshot>,
        persistence: PersistenceService,
    ) -> Result<RoomHandle, DocumentError> {
        let (document, last_persisted_version) = match snapshot {
            Some(row) => (Document::from_state(&row.state)?, row.version),
            None => (Document::new(), 0),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let weak = tx.downgrade();
        let debouncer = Debouncer::spawn(persistence.debounce(), move || match weak.upgrade() {
            Some(tx) => tx.send(RoomCommand::Flush { reply: None }).is_ok(),
            None => false,
        });

        let room = Room {
            key: key.clone(),
            document,
            peers: HashMap::new(),
            awareness: AwarenessMap::new(),
            persistence,
            debouncer,
            commands: tx.downgrade(),
            dirty: false,
            last_persisted_version,
            flush_in_flight: false,
            flush_pending: false,
            flush_waiters: Vec::new(),
        };
        tokio::spawn(room.run(rx));

        Ok(RoomHandle { key, commands: tx })
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RoomCommand>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        debug!("Room {} stopped", self.key);
    }

    fn handle(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Join { peer_id, sender, reply } => self.join(peer_id, sender, reply),
            RoomCommand::Leave { peer_id, reply } => {
                self.leave(peer_id);
                let _ = reply.send(());
            }
            RoomCommand::Update { peer_id, update } => self.apply_update(peer_id, update),
            RoomCommand::Awareness { peer_id, client_id, state } => {
                self.set_awareness(peer_id, client_id, state)
            }
            RoomCommand::Ping { peer_id } => self.ping(peer_id),
            RoomCommand::SyncRequest { peer_id } => self.sync_request(peer_id),
            RoomCommand::EncodeState { reply } => {
                let _ = reply.send(self.document.encode_state());
            }
            RoomCommand::GetAwareness { reply } => {
                let _ = reply.send(self.awareness.clone());
            }
            RoomCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            RoomCommand::Flush { reply } => self.flush(reply),
            RoomCommand::FlushCompleted { version, result } => self.flush_completed(version, result),
        }
    }

    fn join(&mut self, peer_id: PeerId, sender: PeerSender, reply: oneshot::Sender<Joined>) {
        self.peers.insert(
            peer_id,
            Peer {
                sender,
                client_id: None,
                joined_at: Instant::now(),
            },
        );

        let joined = Joined {
            state: self.document.encode_state(),
            awareness: self.awareness.clone(),
        };
        if reply.send(joined).is_err() {
            // Joiner went away before it saw the state.
            self.peers.remove(&peer_id);
            return;
        }
        info!("Peer {peer_id} joined room {} ({} peers)", self.key, self.peers.len());
    }

    fn leave(&mut self, peer_id: PeerId) {
        let Some(peer) = self.peers.remove(&peer_id) else {
            return;
        };
        info!(
            "Peer {peer_id} left room {} after {:?} ({} peers)",
            self.key,
            peer.joined_at.elapsed(),
            self.peers.len()
        );

        if let Some(client_id) = peer.client_id {
            if self.awareness.remove(&client_id).is_some() {
                self.broadcast_awareness();
            }
        }
    }

    fn apply_update(&mut self, peer_id: PeerId, update: Vec<u8>) {
        if let Err(e) = self.document.apply_update(&update) {
            warn!("Dropping update from peer {peer_id} in room {}: {e}", self.key);
            return;
        }
        trace!("Relaying {} byte update from {peer_id} in room {}", update.len(), self.key);

        self.broadcast(&Outbound::binary(update), Some(peer_id));
        self.dirty = true;
        self.debouncer.schedule();
    }

    fn set_awareness(&mut self, peer_id: PeerId, client_id: String, state: Value) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            debug!("Awareness from unknown peer {peer_id} in room {}", self.key);
            return;
        };
        if peer.client_id.is_none() {
            peer.client_id = Some(client_id.clone());
        }

        self.awareness.upsert(client_id, state);
        self.broadcast_awareness();
    }

    fn ping(&mut self, peer_id: PeerId) {
        match ServerMessage::Pong.encode() {
            Ok(pong) => self.send_to(peer_id, Outbound::text(pong)),
            Err(e) => error!("Failed to encode pong: {e}"),
        }
    }

    fn sync_request(&mut self, peer_id: PeerId) {
        let state = Outbound::binary(self.document.encode_state());
        self.send_to(peer_id, state);
    }

    fn stats(&self) -> RoomStats {
        RoomStats {
            peers: self.peers.len(),
            awareness_entries: self.awareness.len(),
            dirty: self.dirty,
            last_persisted_version: self.last_persisted_version,
        }
    }

    fn send_to(&mut self, peer_id: PeerId, frame: Outbound) {
        let lagging = match self.peers.get(&peer_id) {
            Some(peer) => !self.enqueue(peer_id, peer, frame),
            None => false,
        };
        if lagging {
            self.drop_lagging(peer_id);
        }
    }

    fn broadcast(&mut self, frame: &Outbound, except: Option<PeerId>) {
        let mut lagging = Vec::new();
        for (peer_id, peer) in &self.peers {
            if Some(*peer_id) == except {
                continue;
            }
            if !self.enqueue(*peer_id, peer, frame.clone()) {
                lagging.push(*peer_id);
            }
        }
        for peer_id in lagging {
            self.drop_lagging(peer_id);
        }
    }

    /// Queue a frame without waiting. Returns false if the peer's queue is full.
    fn enqueue(&self, peer_id: PeerId, peer: &Peer, frame: Outbound) -> bool {
        match peer.sender.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Closed(_)) => {
                debug!("Peer {peer_id} in room {} is not receiving", self.key);
                true
            }
            Err(TrySendError::Full(_)) => false,
        }
    }

    /// Remove a peer that stopped draining its queue. Dropping its sender
    /// ends the connection's writer once the queued frames are written.
    fn drop_lagging(&mut self, peer_id: PeerId) {
        debug!("Peer {peer_id} in room {} is not draining its queue; dropping it", self.key);
        self.leave(peer_id);
    }

    fn broadcast_awareness(&mut self) {
        let message = ServerMessage::Awareness {
            users: self.awareness.users(),
        };
        match message.encode() {
            Ok(text) => self.broadcast(&Outbound::text(text), None),
            Err(e) => error!("Failed to encode awareness for room {}: {e}", self.key),
        }
    }

    fn flush(&mut self, reply: Option<FlushReply>) {
        self.flush_waiters.extend(reply);

        if self.flush_in_flight {
            self.flush_pending = true;
            return;
        }
        if !self.dirty {
            self.resolve_waiters(Ok(()));
            return;
        }
        self.start_flush();
    }

    /// Encode now, write elsewhere. The snapshot is consistent because
    /// nothing else runs on this task while it is encoded.
    fn start_flush(&mut self) {
        let version = self.last_persisted_version + 1;
        let snapshot = PersistedSnapshot::new(&self.key, self.document.encode_state(), version);
        self.dirty = false;
        self.flush_in_flight = true;

        let persistence = self.persistence.clone();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = persistence.save(snapshot).await;
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(RoomCommand::FlushCompleted { version, result });
            }
        });
    }

    fn flush_completed(&mut self, version: u64, result: Result<(), StoreError>) {
        self.flush_in_flight = false;

        match &result {
            Ok(()) => {
                self.last_persisted_version = version;
                debug!("Persisted room {} at version {version}", self.key);
            }
            Err(e) => {
                error!("Failed to persist room {} (version {version}): {e}", self.key);
                self.dirty = true;
                self.debouncer.schedule();
            }
        }

        if self.flush_pending {
            self.flush_pending = false;
            if self.dirty {
                self.start_flush();
                return;
            }
        }
        self.resolve_waiters(result);
    }

    fn resolve_waiters(&mut self, result: Result<(), StoreError>) {
        for waiter in self.flush_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }
}

/// Cheap, cloneable reference to a running room.
#[derive(Clone)]
pub struct RoomHandle {
    key: RoomKey,
    commands: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn key(&self) -> &RoomKey {
        &self.key
    }

    /// True once the room task has stopped; every command then fails.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Register a peer. Returns the full state and the awareness map; nothing
    /// is broadcast.
    pub async fn join(&self, peer_id: PeerId, sender: PeerSender) -> Result<Joined, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Join { peer_id, sender, reply })?;
        rx.await.map_err(|_| RoomError::Closed)
    }

    /// Remove a peer and its awareness entry. Safe to call more than once.
    pub async fn leave(&self, peer_id: PeerId) -> Result<(), RoomError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Leave { peer_id, reply })?;
        rx.await.map_err(|_| RoomError::Closed)
    }

    /// Merge an update and relay it to every other peer.
    pub fn apply_update(&self, peer_id: PeerId, update: Vec<u8>) -> Result<(), RoomError> {
        self.send(RoomCommand::Update { peer_id, update })
    }

    /// Upsert `client_id`'s awareness and broadcast the whole map.
    pub fn set_awareness(
        &self,
        peer_id: PeerId,
        client_id: String,
        state: Value,
    ) -> Result<(), RoomError> {
        self.send(RoomCommand::Awareness { peer_id, client_id, state })
    }

    pub fn ping(&self, peer_id: PeerId) -> Result<(), RoomError> {
        self.send(RoomCommand::Ping { peer_id })
    }

    /// Send the full state to `peer_id` only.
    pub fn sync_request(&self, peer_id: PeerId) -> Result<(), RoomError> {
        self.send(RoomCommand::SyncRequest { peer_id })
    }

    pub async fn encode_state(&self) -> Result<Vec<u8>, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::EncodeState { reply })?;
        rx.await.map_err(|_| RoomError::Closed)
    }

    pub async fn awareness(&self) -> Result<AwarenessMap, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::GetAwareness { reply })?;
        rx.await.map_err(|_| RoomError::Closed)
    }

    pub async fn stats(&self) -> Result<RoomStats, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Stats { reply })?;
        rx.await.map_err(|_| RoomError::Closed)
    }

    /// Flush now, bypassing the debounce window, and wait for the write.
    ///
    /// Returns immediately if nothing changed since the last flush.
    pub async fn flush(&self) -> Result<(), RoomError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Flush { reply: Some(reply) })?;
        rx.await.map_err(|_| RoomError::Closed)??;
        Ok(())
    }

    fn send(&self, command: RoomCommand) -> Result<(), RoomError> {
        self.commands.send(command).map_err(|_| RoomError::Closed)
    }
}

#[cfg(test)]
impl RoomHandle {
    /// Handle whose room task is already gone.
    pub(crate) fn stopped(key: RoomKey) -> Self {
        let (commands, _) = mpsc::unbounded_channel();
        Self { key, commands }
    }
}
