//! Crate-level error type.

use thiserror::Error;

use crate::document::DocumentError;
use crate::key::KeyError;
use crate::room::RoomError;
use crate::storage::StoreError;

#[derive(Error, Debug)]
pub enum CollabError {
    #[error("Invalid room key: {0}")]
    Key(#[from] KeyError),
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Room error: {0}")]
    Room(#[from] RoomError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Config(String),
}
