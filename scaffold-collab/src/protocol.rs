//! Wire protocol for room connections.
//!
//! One WebSocket carries two payload kinds:
//!
//! ```text
//! ┌─────────────────────┬───────────────────────────────────────────┐
//! │ frame               │ meaning                                   │
//! ├─────────────────────┼───────────────────────────────────────────┤
//! │ binary, byte0 ∉ {[  │ raw CRDT update (opaque, never inspected) │
//! │ binary, byte0 ∈ {[  │ UTF-8 JSON control message                │
//! │ text                │ JSON control message                      │
//! └─────────────────────┴───────────────────────────────────────────┘
//! ```
//!
//! Client → server control messages:
//! `{type:"awareness", clientId|userId, state}`, `{type:"sync-request"}`,
//! `{type:"ping"}`.
//!
//! Server → client control messages:
//! `{type:"awareness", users:[...]}`, `{type:"pong"}`.
//!
//! On join the server also sends one binary frame holding the full document
//! state. There is no separate bootstrap message type.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// First bytes that mark a binary frame as JSON.
const JSON_OBJECT_START: u8 = b'{';
const JSON_ARRAY_START: u8 = b'[';

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Control frame is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("Malformed control message: {0}")]
    MalformedControl(#[from] serde_json::Error),
}

/// A raw inbound frame, as received from the transport.
#[derive(Debug, Clone, Copy)]
pub enum Frame<'a> {
    Binary(&'a [u8]),
    Text(&'a str),
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Opaque CRDT update.
    Update(Vec<u8>),
    /// Parsed control message.
    Control(ControlMessage),
}

/// Classify a frame into a typed message.
///
/// This is the only place that sniffs bytes; everything downstream deals in
/// [`Inbound`].
pub fn classify_frame(frame: Frame<'_>) -> Result<Inbound, ProtocolError> {
    match frame {
        Frame::Binary(bytes) => match bytes.first() {
            Some(&JSON_OBJECT_START) | Some(&JSON_ARRAY_START) => {
                let text = std::str::from_utf8(bytes)?;
                Ok(Inbound::Control(serde_json::from_str(text)?))
            }
            _ => Ok(Inbound::Update(bytes.to_vec())),
        },
        Frame::Text(text) => Ok(Inbound::Control(serde_json::from_str(text)?)),
    }
}

/// Client → server control message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    Awareness(AwarenessUpdate),
    SyncRequest,
    Ping,
}

/// Payload of an inbound awareness message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AwarenessUpdate {
    #[serde(rename = "clientId", default)]
    pub client_id: Option<Value>,
    #[serde(rename = "userId", default)]
    pub user_id: Option<Value>,
    #[serde(default)]
    pub state: Value,
}

impl AwarenessUpdate {
    /// The id this state is filed under: `clientId`, else `userId`.
    ///
    /// Numeric ids are accepted and stringified.
    pub fn resolved_client_id(&self) -> Option<String> {
        self.client_id
            .as_ref()
            .and_then(id_to_string)
            .or_else(|| self.user_id.as_ref().and_then(id_to_string))
    }
}

fn id_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Server → client control message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Full awareness map (values only).
    Awareness { users: Vec<Value> },
    Pong,
}

impl ServerMessage {
    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A frame queued for one peer.
///
/// Payloads are shared so a broadcast encodes once and fans out by refcount.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Binary(Arc<Vec<u8>>),
    Text(Arc<str>),
}

impl Outbound {
    pub fn binary(bytes: Vec<u8>) -> Self {
        Outbound::Binary(Arc::new(bytes))
    }

    pub fn text(text: impl Into<Arc<str>>) -> Self {
        Outbound::Text(text.into())
    }

    /// Parse a text frame back into JSON (tests and tooling).
    pub fn as_json(&self) -> Option<Value> {
        match self {
            Outbound::Text(text) => serde_json::from_str(text).ok(),
            Outbound::Binary(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_binary_update_passthrough() {
        let bytes = vec![1, 0, 5, 42];
        let inbound = classify_frame(Frame::Binary(&bytes)).unwrap();
        assert_eq!(inbound, Inbound::Update(bytes));
    }

    #[test]
    fn test_empty_binary_is_update() {
        let inbound = classify_frame(Frame::Binary(&[])).unwrap();
        assert_eq!(inbound, Inbound::Update(Vec::new()));
    }

    #[test]
    fn test_binary_json_sniffed() {
        let bytes = br#"{"type":"ping"}"#;
        let inbound = classify_frame(Frame::Binary(bytes)).unwrap();
        assert_eq!(inbound, Inbound::Control(ControlMessage::Ping));
    }

    #[test]
    fn test_binary_json_array_is_not_control() {
        let bytes = br#"[1,2,3]"#;
        assert!(matches!(
            classify_frame(Frame::Binary(bytes)),
            Err(ProtocolError::MalformedControl(_))
        ));
    }

    #[test]
    fn test_binary_json_invalid_utf8() {
        let bytes = [b'{', 0xFF, 0xFE];
        assert!(matches!(
            classify_frame(Frame::Binary(&bytes)),
            Err(ProtocolError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn test_text_control_messages() {
        let sync = classify_frame(Frame::Text(r#"{"type":"sync-request"}"#)).unwrap();
        assert_eq!(sync, Inbound::Control(ControlMessage::SyncRequest));

        let ping = classify_frame(Frame::Text(r#"{"type":"ping","ts":123}"#)).unwrap();
        assert_eq!(ping, Inbound::Control(ControlMessage::Ping));
    }

    #[test]
    fn test_text_garbage_rejected() {
        assert!(classify_frame(Frame::Text("not json")).is_err());
        assert!(classify_frame(Frame::Text(r#"{"type":"unknown"}"#)).is_err());
        assert!(classify_frame(Frame::Text(r#"{"no_type":true}"#)).is_err());
    }

    #[test]
    fn test_awareness_client_id() {
        let text = r#"{"type":"awareness","clientId":"u1","state":{"x":1}}"#;
        let Inbound::Control(ControlMessage::Awareness(update)) =
            classify_frame(Frame::Text(text)).unwrap()
        else {
            panic!("expected awareness");
        };
        assert_eq!(update.resolved_client_id().as_deref(), Some("u1"));
        assert_eq!(update.state, json!({"x": 1}));
    }

    #[test]
    fn test_awareness_user_id_fallback() {
        let text = r#"{"type":"awareness","userId":"alice","state":{}}"#;
        let Inbound::Control(ControlMessage::Awareness(update)) =
            classify_frame(Frame::Text(text)).unwrap()
        else {
            panic!("expected awareness");
        };
        assert_eq!(update.resolved_client_id().as_deref(), Some("alice"));
    }

    #[test]
    fn test_awareness_client_id_wins_and_numbers_accepted() {
        let text = r#"{"type":"awareness","clientId":42,"userId":"alice","state":null}"#;
        let Inbound::Control(ControlMessage::Awareness(update)) =
            classify_frame(Frame::Text(text)).unwrap()
        else {
            panic!("expected awareness");
        };
        assert_eq!(update.resolved_client_id().as_deref(), Some("42"));
    }

    #[test]
    fn test_awareness_without_id() {
        let text = r#"{"type":"awareness","state":{"x":1}}"#;
        let Inbound::Control(ControlMessage::Awareness(update)) =
            classify_frame(Frame::Text(text)).unwrap()
        else {
            panic!("expected awareness");
        };
        assert_eq!(update.resolved_client_id(), None);
    }

    #[test]
    fn test_server_message_shapes() {
        let awareness = ServerMessage::Awareness {
            users: vec![json!({"cursor": 5})],
        };
        let encoded: Value = serde_json::from_str(&awareness.encode().unwrap()).unwrap();
        assert_eq!(encoded, json!({"type": "awareness", "users": [{"cursor": 5}]}));

        let pong: Value = serde_json::from_str(&ServerMessage::Pong.encode().unwrap()).unwrap();
        assert_eq!(pong, json!({"type": "pong"}));
    }

    #[test]
    fn test_outbound_as_json() {
        let out = Outbound::text(ServerMessage::Pong.encode().unwrap());
        assert_eq!(out.as_json(), Some(json!({"type": "pong"})));
        assert_eq!(Outbound::binary(vec![1, 2]).as_json(), None);
    }
}
