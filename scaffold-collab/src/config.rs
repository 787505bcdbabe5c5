//! Server configuration.
//!
//! Defaults suit local development. Deployments override them through
//! environment variables:
//!
//! | variable                   | field               | default          |
//! |----------------------------|---------------------|------------------|
//! | `COLLAB_BIND_ADDR`         | `bind_addr`         | `127.0.0.1:9090` |
//! | `COLLAB_STORAGE_PATH`      | `storage_path`      | unset (memory)   |
//! | `COLLAB_FLUSH_DEBOUNCE_MS` | `flush_debounce`    | `1000`           |
//! | `COLLAB_DEFAULT_ROOM_TYPE` | `default_room_type` | `doc`            |

use std::path::PathBuf;
use std::time::Duration;

use crate::error::CollabError;
use crate::key::{validate_part, DEFAULT_ROOM_TYPE};
use crate::persistence::DEFAULT_FLUSH_DEBOUNCE;

pub const ENV_BIND_ADDR: &str = "COLLAB_BIND_ADDR";
pub const ENV_STORAGE_PATH: &str = "COLLAB_STORAGE_PATH";
pub const ENV_FLUSH_DEBOUNCE_MS: &str = "COLLAB_FLUSH_DEBOUNCE_MS";
pub const ENV_DEFAULT_ROOM_TYPE: &str = "COLLAB_DEFAULT_ROOM_TYPE";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Snapshot storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Quiet window before a dirty room is flushed
    pub flush_debounce: Duration,
    /// Room type for connections that do not pass `?type=`
    pub default_room_type: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            flush_debounce: DEFAULT_FLUSH_DEBOUNCE,
            default_room_type: DEFAULT_ROOM_TYPE.to_string(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `COLLAB_*` environment variables.
    pub fn from_env() -> Result<Self, CollabError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CollabError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup(ENV_STORAGE_PATH).filter(|p| !p.is_empty()) {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Some(ms) = lookup(ENV_FLUSH_DEBOUNCE_MS) {
            let ms: u64 = ms.trim().parse().map_err(|e| {
                CollabError::Config(format!("{ENV_FLUSH_DEBOUNCE_MS}={ms:?}: {e}"))
            })?;
            config.flush_debounce = Duration::from_millis(ms);
        }
        if let Some(room_type) = lookup(ENV_DEFAULT_ROOM_TYPE) {
            validate_part("type", &room_type)
                .map_err(|e| CollabError::Config(format!("{ENV_DEFAULT_ROOM_TYPE}: {e}")))?;
            config.default_room_type = room_type;
        }

        Ok(config)
    }

    /// In-memory config on an ephemeral port, with a short debounce.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            storage_path: None,
            flush_debounce: Duration::from_millis(100),
            default_room_type: DEFAULT_ROOM_TYPE.to_string(),
        }
    }
}
