//! Warden - external address pools, mappings and tenant quotas.
//!
//! Warden is the resource-allocation core of a multi-tenant cloud controller.
//! It manages pools of externally routable IPv4 addresses, maps them to
//! tenant workload instances, and enforces per-tenant quotas so that no two
//! tenants are ever handed the same address and no tenant exceeds its limit,
//! however many requests race.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Request layer (external)                    │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │  AddressService
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Controller                            │
//! │        PoolRegistry │ MappingTable │ QuotaLedger │ Metrics      │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Allocator (one per pool)                       │
//! │              AddressSpace │ standalone addresses                │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 EntityStore (compare-and-swap)                  │
//! │                  MemoryStore │ FileStore                        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A mapping request flows PoolRegistry → QuotaLedger (admission) →
//! Allocator (reservation) → store → MappingTable. Release runs in reverse.
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Main runtime orchestration
//! - [`core::error`] - Error types and outward mapping
//!
//! ## Allocation
//! - [`address`] - CIDR decomposition into allocatable addresses
//! - [`pool`] - Pools, per-pool allocators and the pool registry
//! - [`mapping`] - External address mappings
//! - [`quota`] - Per-tenant quota ledger
//!
//! ## Storage
//! - [`storage::store`] - Store trait and entity encoding
//! - [`storage::memory`] - Memory-backed store
//! - [`storage::file`] - Snapshot-file-backed store
//!
//! ## Service
//! - [`service::api`] - The service capability and its controller
//!
//! ## Operations
//! - [`ops::metrics`] - Metrics
//! - [`ops::audit`] - Consistency audit
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations
//!
//! # Key Invariants
//!
//! - An external address is allocated to at most one mapping at a time
//! - `free + allocated == total` for every pool at every observable instant
//! - Quota usage never exceeds a finite limit
//! - No lock is held across store I/O; allocator locks are never taken while
//!   holding a quota lock or the other way round

// Core infrastructure
pub mod core;

// Address inventory
pub mod address;
pub mod pool;

// Mappings and quotas
pub mod mapping;
pub mod quota;

// Storage layer
pub mod storage;

// Service capability
pub mod service;

// Operations and observability
pub mod ops;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime};
pub use self::core::error::{WardenError, WardenResult};
pub use service::{AddressService, Controller};
