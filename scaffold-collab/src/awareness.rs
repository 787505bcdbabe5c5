//! Ephemeral per-client presence state.
//!
//! Awareness entries (user identity, cursor, selection, UI hints) are opaque
//! JSON blobs keyed by client id. They live only in memory and are rebuilt
//! from scratch by every session. The room always broadcasts the whole map,
//! never a diff.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Map of client id → awareness state.
///
/// Ordered by client id so broadcasts list users deterministically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AwarenessMap {
    entries: BTreeMap<String, Value>,
}

impl AwarenessMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the state of `client_id`. Returns the previous state.
    pub fn upsert(&mut self, client_id: impl Into<String>, state: Value) -> Option<Value> {
        self.entries.insert(client_id.into(), state)
    }

    /// Remove the state of `client_id`.
    pub fn remove(&mut self, client_id: &str) -> Option<Value> {
        self.entries.remove(client_id)
    }

    pub fn get(&self, client_id: &str) -> Option<&Value> {
        self.entries.get(client_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// States of all clients, as sent in `{type:"awareness", users:[...]}`.
    pub fn users(&self) -> Vec<Value> {
        self.entries.values().cloned().collect()
    }

    /// The map as a JSON object `{clientId: state}` (introspection).
    pub fn to_json(&self) -> Value {
        let object: Map<String, Value> = self
            .entries
            .iter()
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect();
        Value::Object(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_upsert_replaces() {
        let mut map = AwarenessMap::new();
        assert!(map.upsert("u1", json!({"x": 1})).is_none());
        let previous = map.upsert("u1", json!({"x": 2}));
        assert_eq!(previous, Some(json!({"x": 1})));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("u1"), Some(&json!({"x": 2})));
    }

    #[test]
    fn test_remove() {
        let mut map = AwarenessMap::new();
        map.upsert("u1", json!({"x": 1}));
        assert!(map.remove("u1").is_some());
        assert!(map.remove("u1").is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_users_ordered_by_client_id() {
        let mut map = AwarenessMap::new();
        map.upsert("b", json!({"name": "Bob"}));
        map.upsert("a", json!({"name": "Alice"}));
        assert_eq!(
            map.users(),
            vec![json!({"name": "Alice"}), json!({"name": "Bob"})]
        );
    }

    #[test]
    fn test_to_json_object() {
        let mut map = AwarenessMap::new();
        map.upsert("u1", json!({"cursor": 5}));
        assert_eq!(map.to_json(), json!({"u1": {"cursor": 5}}));
        assert_eq!(AwarenessMap::new().to_json(), json!({}));
    }
}
