//! In-memory entity store.

use crate::core::error::{WardenError, WardenResult};
use crate::storage::store::{Collection, EntityStore, Versioned};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Versioned contents shared by the memory and file backends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    /// Entries per collection.
    pub collections: BTreeMap<Collection, BTreeMap<String, Versioned>>,
    /// Last version handed out.
    pub last_version: u64,
}

/// The previous value of a key, kept so a failed flush can be undone.
#[derive(Debug, Clone)]
pub struct UndoEntry {
    pub collection: Collection,
    pub key: String,
    pub previous: Option<Versioned>,
}

impl StoreState {
    /// Fetch one entry.
    pub fn get(&self, collection: Collection, key: &str) -> Option<Versioned> {
        self.collections.get(&collection)?.get(key).cloned()
    }

    /// List one collection in key order.
    pub fn list(&self, collection: Collection) -> Vec<(String, Versioned)> {
        self.collections
            .get(&collection)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Apply a compare-and-swap, returning the new version and an undo entry.
    pub fn compare_and_swap(
        &mut self,
        collection: Collection,
        key: &str,
        expected: Option<u64>,
        value: Option<Vec<u8>>,
    ) -> WardenResult<(u64, UndoEntry)> {
        let entries = self.collections.entry(collection).or_default();
        let current = entries.get(key).map(|v| v.version);
        if current != expected {
            return Err(WardenError::Conflict {
                key: format!("{}/{}", collection, key),
                expected,
                found: current,
            });
        }

        let previous = entries.get(key).cloned();
        let version = match value {
            Some(value) => {
                self.last_version += 1;
                let version = self.last_version;
                entries.insert(key.to_string(), Versioned { version, value });
                version
            }
            None => {
                entries.remove(key);
                0
            }
        };

        Ok((
            version,
            UndoEntry {
                collection,
                key: key.to_string(),
                previous,
            },
        ))
    }

    /// Revert a write recorded by [`StoreState::compare_and_swap`].
    pub fn undo(&mut self, undo: UndoEntry) {
        let entries = self.collections.entry(undo.collection).or_default();
        match undo.previous {
            Some(previous) => {
                entries.insert(undo.key, previous);
            }
            None => {
                entries.remove(&undo.key);
            }
        }
    }
}

/// Memory-backed store for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with existing state.
    pub fn from_state(state: StoreState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Number of entries in a collection.
    pub fn len(&self, collection: Collection) -> usize {
        self.state
            .read()
            .collections
            .get(&collection)
            .map_or(0, |c| c.len())
    }

    /// Check if a collection is empty.
    pub fn is_empty(&self, collection: Collection) -> bool {
        self.len(collection) == 0
    }
}

impl EntityStore for MemoryStore {
    fn get(&self, collection: Collection, key: &str) -> WardenResult<Option<Versioned>> {
        Ok(self.state.read().get(collection, key))
    }

    fn list(&self, collection: Collection) -> WardenResult<Vec<(String, Versioned)>> {
        Ok(self.state.read().list(collection))
    }

    fn compare_and_swap(
        &self,
        collection: Collection,
        key: &str,
        expected: Option<u64>,
        value: Option<Vec<u8>>,
    ) -> WardenResult<u64> {
        let (version, _) = self
            .state
            .write()
            .compare_and_swap(collection, key, expected, value)?;
        Ok(version)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
