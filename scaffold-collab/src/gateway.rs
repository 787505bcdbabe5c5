//! HTTP and WebSocket surface.
//!
//! Routes:
//! - `GET /health`
//! - `GET /collab?type=` and `GET /collab/{room_id}?type=`: WebSocket
//! - `GET /collab/{room_id}/awareness?type=`: awareness map of a live room
//! - `GET /collab/{room_id}/state?type=`: full state of a live room
//!
//! Connection lifecycle:
//! ```text
//! upgrade ─► get_or_create ─► join ─► bootstrap (binary state, awareness)
//!                │                         │
//!          fail: close 1011                ▼
//!                             reader loop ──► classify_frame ──► RoomHandle
//!                             writer task ◄── peer outbound queue ◄── Room
//!                                  │             (bounded)
//!              close / error ─► leave ─► writer stops
//! ```
//!
//! A peer whose outbound queue fills up is dropped by its room. The writer
//! then drains what was queued and closes, which also ends the reader.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::key::RoomKey;
use crate::protocol::{classify_frame, ControlMessage, Frame, Inbound, Outbound, ServerMessage};
use crate::registry::RoomRegistry;
use crate::room::{Joined, PeerId, RoomError, RoomHandle, PEER_QUEUE_CAPACITY};

/// Shared state of all handlers.
#[derive(Clone)]
struct GatewayState {
    registry: Arc<RoomRegistry>,
    default_room_type: Arc<str>,
}

/// `?type=` on every room route.
#[derive(Debug, Default, Deserialize)]
pub struct RoomQuery {
    #[serde(rename = "type")]
    pub room_type: Option<String>,
}

/// Build the router over `registry`.
pub fn router(registry: Arc<RoomRegistry>, default_room_type: &str) -> Router {
    let state = GatewayState {
        registry,
        default_room_type: Arc::from(default_room_type),
    };

    Router::new()
        .route("/health", get(health))
        .route("/collab", get(connect_default))
        .route("/collab/{room_id}", get(connect_room))
        .route("/collab/{room_id}/awareness", get(room_awareness))
        .route("/collab/{room_id}/state", get(room_state))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

impl GatewayState {
    fn resolve(&self, room_id: Option<&str>, query: &RoomQuery) -> Result<RoomKey, Response> {
        RoomKey::resolve(query.room_type.as_deref(), room_id, &self.default_room_type).map_err(|e| {
            warn!("Rejected room key (id {room_id:?}, type {:?}): {e}", query.room_type);
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        })
    }

    /// A live room, or the response to send instead.
    async fn live_room(&self, room_id: &str, query: &RoomQuery) -> Result<RoomHandle, Response> {
        let key = self.resolve(Some(room_id), query)?;
        self.registry
            .get(&key)
            .await
            .ok_or_else(|| StatusCode::NOT_FOUND.into_response())
    }
}

async fn connect_default(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    Query(query): Query<RoomQuery>,
) -> Response {
    upgrade(ws, state, None, query)
}

async fn connect_room(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    Path(room_id): Path<String>,
    Query(query): Query<RoomQuery>,
) -> Response {
    upgrade(ws, state, Some(room_id), query)
}

/// Validate the key before upgrading; a bad key never reaches the registry.
fn upgrade(
    ws: WebSocketUpgrade,
    state: GatewayState,
    room_id: Option<String>,
    query: RoomQuery,
) -> Response {
    match state.resolve(room_id.as_deref(), &query) {
        Ok(key) => ws.on_upgrade(move |socket| handle_socket(socket, state.registry, key)),
        Err(rejection) => rejection,
    }
}

async fn room_awareness(
    State(state): State<GatewayState>,
    Path(room_id): Path<String>,
    Query(query): Query<RoomQuery>,
) -> Response {
    let room = match state.live_room(&room_id, &query).await {
        Ok(room) => room,
        Err(response) => return response,
    };
    match room.awareness().await {
        Ok(map) => Json(map.to_json()).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn room_state(
    State(state): State<GatewayState>,
    Path(room_id): Path<String>,
    Query(query): Query<RoomQuery>,
) -> Response {
    let room = match state.live_room(&room_id, &query).await {
        Ok(room) => room,
        Err(response) => return response,
    };
    match room.encode_state().await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "application/octet-stream")], bytes).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

type WsSink = SplitSink<WebSocket, Message>;

async fn handle_socket(mut socket: WebSocket, registry: Arc<RoomRegistry>, key: RoomKey) {
    let room = match registry.get_or_create(&key).await {
        Ok(room) => room,
        Err(e) => {
            error!("Failed to open room {key}: {e}");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: "room unavailable".into(),
                })))
                .await;
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();
    let peer_id: PeerId = Uuid::new_v4();
    let (tx, rx) = mpsc::channel(PEER_QUEUE_CAPACITY);

    let joined = match room.join(peer_id, tx).await {
        Ok(joined) => joined,
        Err(e) => {
            error!("Peer {peer_id} could not join room {key}: {e}");
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: "room unavailable".into(),
                })))
                .await;
            return;
        }
    };

    if let Err(e) = send_bootstrap(&mut sink, joined).await {
        debug!("Peer {peer_id} dropped during bootstrap: {e}");
        let _ = room.leave(peer_id).await;
        return;
    }

    let mut writer = tokio::spawn(write_outbound(sink, rx));

    loop {
        let message = tokio::select! {
            message = stream.next() => message,
            _ = &mut writer => {
                debug!("Outbound queue of peer {peer_id} closed");
                break;
            }
        };
        let Some(message) = message else {
            break;
        };
        let result = match message {
            Ok(Message::Binary(bytes)) => dispatch(&room, peer_id, Frame::Binary(&bytes)),
            Ok(Message::Text(text)) => dispatch(&room, peer_id, Frame::Text(text.as_str())),
            Ok(Message::Close(frame)) => {
                debug!("Peer {peer_id} closed: {frame:?}");
                break;
            }
            // Transport answers pings itself
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => Ok(()),
            Err(e) => {
                debug!("Peer {peer_id} transport error: {e}");
                break;
            }
        };
        if let Err(e) = result {
            warn!("Room {key} stopped while peer {peer_id} was connected: {e}");
            break;
        }
    }

    if let Err(e) = room.leave(peer_id).await {
        debug!("Leave for peer {peer_id} not delivered: {e}");
    }
    writer.abort();
    info!("Connection for peer {peer_id} in room {key} closed");
}

/// Full state first, then the awareness map.
async fn send_bootstrap(sink: &mut WsSink, joined: Joined) -> Result<(), axum::Error> {
    sink.send(Message::Binary(Bytes::from(joined.state))).await?;

    let awareness = ServerMessage::Awareness {
        users: joined.awareness.users(),
    };
    match awareness.encode() {
        Ok(text) => sink.send(Message::Text(text.into())).await,
        Err(e) => {
            error!("Failed to encode awareness bootstrap: {e}");
            Ok(())
        }
    }
}

async fn write_outbound(mut sink: WsSink, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(frame) = rx.recv().await {
        let message = match frame {
            Outbound::Binary(bytes) => Message::Binary(Bytes::copy_from_slice(&bytes)),
            Outbound::Text(text) => Message::Text(text.as_ref().into()),
        };
        if sink.send(message).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Route one inbound frame to the room. Malformed control frames are dropped.
fn dispatch(room: &RoomHandle, peer_id: PeerId, frame: Frame<'_>) -> Result<(), RoomError> {
    match classify_frame(frame) {
        Ok(Inbound::Update(update)) => room.apply_update(peer_id, update),
        Ok(Inbound::Control(ControlMessage::Awareness(update))) => {
            match update.resolved_client_id() {
                Some(client_id) => room.set_awareness(peer_id, client_id, update.state),
                None => {
                    debug!("Awareness from peer {peer_id} has no clientId or userId");
                    Ok(())
                }
            }
        }
        Ok(Inbound::Control(ControlMessage::SyncRequest)) => room.sync_request(peer_id),
        Ok(Inbound::Control(ControlMessage::Ping)) => room.ping(peer_id),
        Err(e) => {
            debug!("Dropping frame from peer {peer_id}: {e}");
            Ok(())
        }
    }
}
