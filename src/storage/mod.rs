//! Storage layer.
//!
//! Pools, mappings and quota limits are persisted through the
//! [`store::EntityStore`] trait, which offers a single conditional write
//! primitive (compare-and-swap on a per-key version).
//!
//! # Modules
//!
//! - [`store`] - Store trait, collections and entity encoding
//! - [`memory`] - Memory-backed store
//! - [`file`] - Snapshot-file-backed store
//!
//! # Invariants
//!
//! - Versions are store-wide and strictly increasing, so a deleted and
//!   re-created key never reuses a version
//! - Mapping records are keyed by external address; the store rejects a
//!   second mapping for the same address

pub mod file;
pub mod memory;
pub mod store;

pub use file::FileStore;
pub use memory::{MemoryStore, StoreState};
pub use store::{decode, encode, load_all, Collection, EntityStore, Versioned};
