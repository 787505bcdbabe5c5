//! Composite room identifier.
//!
//! A room is addressed by `(room_type, room_id)`, e.g. `("page", "abc")`.
//! Keys are only constructed through [`RoomKey::new`], which rejects anything
//! the gateway should never let through to the registry.

use std::fmt;

/// Room type used when a connection does not name one.
pub const DEFAULT_ROOM_TYPE: &str = "doc";

/// Room id used when the request path carries none.
pub const DEFAULT_ROOM_ID: &str = "default";

/// Upper bound on either key component, in bytes.
pub const MAX_KEY_PART_LEN: usize = 128;

/// Key validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Room {0} must not be empty")]
    Empty(&'static str),
    #[error("Room {part} exceeds {MAX_KEY_PART_LEN} bytes ({len})")]
    TooLong { part: &'static str, len: usize },
    #[error("Room {part} contains invalid character {ch:?}")]
    InvalidChar { part: &'static str, ch: char },
}

/// Identifies exactly one room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomKey {
    room_type: String,
    room_id: String,
}

impl RoomKey {
    /// Build a validated key.
    pub fn new(room_type: impl Into<String>, room_id: impl Into<String>) -> Result<Self, KeyError> {
        let room_type = room_type.into();
        let room_id = room_id.into();
        validate_part("type", &room_type)?;
        validate_part("id", &room_id)?;
        Ok(Self { room_type, room_id })
    }

    /// Resolve a key from optional request parts, applying the defaults.
    pub fn resolve(
        room_type: Option<&str>,
        room_id: Option<&str>,
        default_type: &str,
    ) -> Result<Self, KeyError> {
        let room_type = room_type.filter(|t| !t.is_empty()).unwrap_or(default_type);
        let room_id = room_id.filter(|id| !id.is_empty()).unwrap_or(DEFAULT_ROOM_ID);
        Self::new(room_type, room_id)
    }

    pub fn room_type(&self) -> &str {
        &self.room_type
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.room_type, self.room_id)
    }
}

/// Check one key component: non-empty, bounded, `[A-Za-z0-9_.:-]` only.
pub fn validate_part(part: &'static str, value: &str) -> Result<(), KeyError> {
    if value.is_empty() {
        return Err(KeyError::Empty(part));
    }
    if value.len() > MAX_KEY_PART_LEN {
        return Err(KeyError::TooLong { part, len: value.len() });
    }
    if let Some(ch) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')))
    {
        return Err(KeyError::InvalidChar { part, ch });
    }
    Ok(())
}
