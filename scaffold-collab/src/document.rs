//! Replicated document backed by a Yrs `Doc`.
//!
//! The collaboration core never interprets updates beyond a structural check
//! (see `update_check`). It only needs three operations from the CRDT:
//!
//! - encode the full state (bootstrap frames, snapshots)
//! - decode and merge an incremental update
//! - produce an incremental update from a local change
//!
//! Merges are commutative, associative and idempotent, so the room can apply
//! updates in arrival order without any coordination between peers.
//!
//! Reference: Shapiro et al., Conflict-free Replicated Data Types (2011)

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, TransactionMut, Update};

use crate::update_check::check_update_v1;

/// Document errors.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// The bytes are not a valid v1 update.
    #[error("Failed to decode update: {0}")]
    Decode(#[from] yrs::encoding::read::Error),
    /// The update decoded but could not be integrated.
    #[error("Failed to apply update: {0}")]
    Apply(String),
}

/// Mergeable state container for one room.
pub struct Document {
    doc: Doc,
}

impl Document {
    /// Create an empty document.
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Hydrate a document from a full encoded state (a persisted snapshot).
    pub fn from_state(state: &[u8]) -> Result<Self, DocumentError> {
        let document = Self::new();
        document.apply_update(state)?;
        Ok(document)
    }

    /// Encode the full document state as a single v1 update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encoded state vector, used to compare replicas.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Decode and merge an incremental update.
    ///
    /// Applying the same update twice is a no-op the second time. Bytes are
    /// checked structurally before Yrs decodes them.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError> {
        check_update_v1(update)?;
        let update = Update::decode_v1(update)?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocumentError::Apply(e.to_string()))
    }

    /// Run a local change and return the incremental update it produced.
    pub fn edit<F>(&self, change: F) -> Vec<u8>
    where
        F: FnOnce(&mut TransactionMut),
    {
        let mut txn = self.doc.transact_mut();
        change(&mut txn);
        txn.encode_update_v1()
    }

    /// Underlying Yrs document, for reading content.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text, WriteTxn};

    fn insert(doc: &Document, text: &str) -> Vec<u8> {
        doc.edit(|txn| {
            let content = txn.get_or_insert_text("content");
            let len = content.get_string(&*txn).len() as u32;
            content.insert(txn, len, text);
        })
    }

    fn content(doc: &Document) -> String {
        let txn = doc.doc().transact();
        txn.get_text("content")
            .map(|t| t.get_string(&txn))
            .unwrap_or_default()
    }

    #[test]
    fn test_empty_document_encodes() {
        let doc = Document::new();
        let state = doc.encode_state();
        assert!(!state.is_empty());
        let copy = Document::from_state(&state).unwrap();
        assert_eq!(copy.state_vector(), doc.state_vector());
    }

    #[test]
    fn test_apply_update_from_other_replica() {
        let alice = Document::new();
        let update = insert(&alice, "hello");

        let server = Document::new();
        server.apply_update(&update).unwrap();
        assert_eq!(content(&server), "hello");
    }

    #[test]
    fn test_convergence_any_order() {
        let a = Document::new();
        let b = Document::new();
        let c = Document::new();
        let u1 = insert(&a, "alpha ");
        let u2 = insert(&b, "beta ");
        let u3 = insert(&c, "gamma ");

        let forward = Document::new();
        for u in [&u1, &u2, &u3] {
            forward.apply_update(u).unwrap();
        }
        let backward = Document::new();
        for u in [&u3, &u2, &u1] {
            backward.apply_update(u).unwrap();
        }
        let interleaved = Document::new();
        for u in [&u2, &u1, &u3] {
            interleaved.apply_update(u).unwrap();
        }

        assert_eq!(content(&forward), content(&backward));
        assert_eq!(content(&forward), content(&interleaved));
        assert_eq!(forward.state_vector(), backward.state_vector());
        assert_eq!(forward.state_vector(), interleaved.state_vector());
    }

    #[test]
    fn test_idempotent_apply() {
        let source = Document::new();
        let update = insert(&source, "once");

        let target = Document::new();
        target.apply_update(&update).unwrap();
        let after_first = (content(&target), target.state_vector());
        target.apply_update(&update).unwrap();
        let after_second = (content(&target), target.state_vector());

        assert_eq!(after_first, after_second);
        assert_eq!(after_second.0, "once");
    }

    #[test]
    fn test_hydrate_from_state() {
        let source = Document::new();
        insert(&source, "persisted text");
        let state = source.encode_state();

        let restored = Document::from_state(&state).unwrap();
        assert_eq!(content(&restored), "persisted text");
        assert_eq!(restored.state_vector(), source.state_vector());
    }

    #[test]
    fn test_malformed_update_rejected() {
        let doc = Document::new();
        assert!(doc.apply_update(&[0xFF, 0xFE, 0xFD]).is_err());
        assert_eq!(content(&doc), "");
    }

    #[test]
    fn test_non_utf8_string_rejected() {
        let doc = Document::new();
        let update = [179, 12, 10, 190, 145, 46, 58, 4, 84, 34, 52, 2, 228, 121, 115, 127, 33];
        assert!(matches!(doc.apply_update(&update), Err(DocumentError::Decode(_))));

        // Well-formed item whose string payload is not UTF-8
        let update = [1, 1, 1, 0, 4, 1, 7, b'c', b'o', b'n', b't', b'e', b'n', b't', 2, 0xE4, 0x79, 0];
        assert!(matches!(doc.apply_update(&update), Err(DocumentError::Decode(_))));
        assert_eq!(content(&doc), "");

        insert(&doc, "still usable");
        assert_eq!(content(&doc), "still usable");
    }
}
