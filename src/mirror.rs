//! The client-local copy of one backend database.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{KeyValue, Ttl};

/// Keys of one remote database as last observed, plus a key count estimate.
///
/// Keys are loaded lazily, so `key_count` may exceed the number of
/// materialized keys. Every mutation except [`DatabaseMirror::set_key_count`]
/// keeps it at or above that number.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DatabaseMirror {
    name: String,
    is_current: bool,
    keys: HashMap<String, KeyValue>,
    key_count: usize,
}

impl DatabaseMirror {
    /// An empty, non-current database.
    pub fn new(name: impl Into<String>) -> Self {
        DatabaseMirror {
            name: name.into(),
            is_current: false,
            keys: HashMap::new(),
            key_count: 0,
        }
    }

    /// Set the key count reported by the backend.
    pub fn with_key_count(mut self, key_count: usize) -> Self {
        self.key_count = key_count;
        self
    }

    /// Database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is the selected database of its connection.
    pub fn is_current(&self) -> bool {
        self.is_current
    }

    pub(crate) fn set_current(&mut self, current: bool) {
        self.is_current = current;
    }

    /// Total key count estimate.
    pub fn key_count(&self) -> usize {
        self.key_count
    }

    /// Materialized keys, in no particular order.
    pub fn keys(&self) -> impl Iterator<Item = &KeyValue> {
        self.keys.values()
    }

    /// Number of materialized keys.
    pub fn loaded_keys(&self) -> usize {
        self.keys.len()
    }

    /// Find a materialized key.
    pub fn key(&self, name: &str) -> Option<&KeyValue> {
        self.keys.get(name)
    }

    /// Insert a key. Returns `false` and refreshes the stored snapshot when a
    /// key with that name is already present.
    pub fn insert_key(&mut self, key: KeyValue) -> bool {
        let added = self.keys.insert(key.key.name.clone(), key).is_none();
        if added {
            self.key_count += 1;
        }
        self.key_count = self.key_count.max(self.keys.len());
        added
    }

    /// Remove a key, `false` if it was not present.
    pub fn remove_key(&mut self, name: &str) -> bool {
        if self.keys.remove(name).is_some() {
            self.key_count = self.key_count.saturating_sub(1).max(self.keys.len());
            true
        } else {
            false
        }
    }

    /// Rename a key, replacing any key already stored under `new_name`.
    pub fn rename_key(&mut self, name: &str, new_name: &str) -> bool {
        let Some(mut key) = self.keys.remove(name) else {
            return false;
        };
        key.key.name = new_name.to_string();
        if self.keys.insert(new_name.to_string(), key).is_some() {
            self.key_count = self.key_count.saturating_sub(1).max(self.keys.len());
        }
        true
    }

    /// Store a new ttl, `false` if the key is not present.
    pub fn update_key_ttl(&mut self, name: &str, ttl: Ttl) -> bool {
        match self.keys.get_mut(name) {
            Some(key) => {
                key.key.ttl = ttl;
                true
            }
            None => false,
        }
    }

    /// Replace all materialized keys.
    pub fn set_keys(&mut self, keys: Vec<KeyValue>) {
        self.keys = keys
            .into_iter()
            .map(|key| (key.key.name.clone(), key))
            .collect();
        self.key_count = self.key_count.max(self.keys.len());
    }

    /// Replace the key count estimate.
    pub fn set_key_count(&mut self, key_count: usize) {
        self.key_count = key_count;
    }

    /// Drop every materialized key.
    pub fn clear_keys(&mut self) {
        self.keys.clear();
    }
}
