//! Abstract entity store.
//!
//! The allocator core persists pools, mappings and quota limits through
//! [`EntityStore`]. Values are opaque versioned byte strings; the only write
//! primitive is a conditional compare-and-swap, which is what the
//! exclusivity guarantees are built on.

use crate::core::error::{WardenError, WardenResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Entity collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Collection {
    /// Pool records keyed by pool ID.
    Pools,
    /// Mapping records keyed by external address.
    Mappings,
    /// Quota limits keyed by `tenant/quota-name`.
    QuotaLimits,
}

impl Collection {
    /// Collection name used in logs and error messages.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pools => "pools",
            Self::Mappings => "mappings",
            Self::QuotaLimits => "quota_limits",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored value with its version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned {
    /// Store-wide monotone version of the last write.
    pub version: u64,
    /// Encoded entity.
    pub value: Vec<u8>,
}

/// Persistence backend.
pub trait EntityStore: Send + Sync {
    /// Fetch one entry.
    fn get(&self, collection: Collection, key: &str) -> WardenResult<Option<Versioned>>;

    /// List all entries of a collection, ordered by key.
    fn list(&self, collection: Collection) -> WardenResult<Vec<(String, Versioned)>>;

    /// Conditionally write or delete an entry.
    ///
    /// `expected = None` requires the key to be absent; `Some(v)` requires the
    /// current version to be `v`. `value = None` deletes. Returns the new
    /// version (0 after a delete). A mismatch fails with `Conflict`.
    fn compare_and_swap(
        &self,
        collection: Collection,
        key: &str,
        expected: Option<u64>,
        value: Option<Vec<u8>>,
    ) -> WardenResult<u64>;

    /// Backend name for logs.
    fn backend_name(&self) -> &'static str;
}

/// Encode an entity for storage.
pub fn encode<T: Serialize>(entity: &T) -> WardenResult<Vec<u8>> {
    bincode::serialize(entity).map_err(|e| WardenError::storage(format!("encode failed: {}", e)))
}

/// Decode a stored entity.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> WardenResult<T> {
    bincode::deserialize(bytes).map_err(|e| WardenError::storage(format!("decode failed: {}", e)))
}

/// Decode every entry of a collection.
pub fn load_all<T: DeserializeOwned>(
    store: &dyn EntityStore,
    collection: Collection,
) -> WardenResult<Vec<(T, u64)>> {
    store
        .list(collection)?
        .into_iter()
        .map(|(_, v)| decode(&v.value).map(|entity| (entity, v.version)))
        .collect()
}
