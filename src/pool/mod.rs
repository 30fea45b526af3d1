//! External address pools.
//!
//! A pool is a named collection of subnets and standalone addresses from
//! which external IPs are handed out. Each pool owns an [`Allocator`] that
//! tracks which addresses are in use; the [`PoolRegistry`] is the directory
//! of all pools and coordinates lifecycle changes with the store.
//!
//! # Modules
//!
//! - [`model`] - Pool records, snapshots and selectors
//! - [`allocator`] - Per-pool address allocation
//! - [`registry`] - Pool directory and lifecycle
//!
//! # Invariants
//!
//! - No address is owned by two pools, and no two subnets anywhere overlap
//! - `free + allocated == total` for every pool at every observable instant
//! - A subnet, address or pool with mapped addresses cannot be removed

pub mod allocator;
pub mod model;
pub mod registry;

pub use allocator::Allocator;
pub use model::{
    AddressRecord, AddressSnapshot, Pool, PoolRecord, PoolSelector, PoolSnapshot, RangeRef,
    SubnetSnapshot,
};
pub use registry::{PoolRegistry, DEFAULT_CAS_RETRIES};
