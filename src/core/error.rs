//! Error types and outward mapping.
//!
//! Warden defines one error kind per failure the allocator core can report.
//! Kinds are transport-independent; the request layer maps them to status
//! codes through [`HttpErrorMapping`]. The identifiers returned by
//! [`ErrorKind::as_str`] are stable and part of the API contract.

use std::net::Ipv4Addr;
use thiserror::Error;

/// Common Warden error conditions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WardenError {
    /// A pool, subnet, address, mapping or quota does not exist.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// A pool with this name already exists.
    #[error("pool name already in use: {name}")]
    DuplicateName { name: String },

    /// The subnet is malformed or not acceptable as an address space.
    #[error("invalid subnet {subnet}: {reason}")]
    InvalidSubnet { subnet: String, reason: String },

    /// The address is malformed or not acceptable.
    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// The new range intersects a range already owned by some pool.
    #[error("{range} overlaps {existing} in pool {pool_name}")]
    Overlap {
        range: String,
        existing: String,
        pool_name: String,
    },

    /// The pool still has mapped addresses.
    #[error("pool {pool_id} has {mapped} mapped addresses")]
    PoolInUse { pool_id: String, mapped: usize },

    /// A subnet, standalone address or internal address is currently mapped.
    #[error("in use: {resource}")]
    InUse { resource: String },

    /// No free address is left in the pool.
    #[error("pool {pool} has no free addresses")]
    PoolExhausted { pool: String },

    /// Release of an address that is not currently reserved.
    #[error("address {address} is not allocated in pool {pool_id}")]
    NotAllocated { address: Ipv4Addr, pool_id: String },

    /// The tenant has no headroom left for this quota.
    #[error("quota {quota} exceeded for tenant {tenant_id}: limit {limit}, usage {usage}, requested {requested}")]
    QuotaExceeded {
        tenant_id: String,
        quota: String,
        limit: u64,
        usage: u64,
        requested: u64,
    },

    /// A quota update was rejected.
    #[error("invalid quota {name}: {reason}")]
    InvalidQuota { name: String, reason: String },

    /// The store rejected a conditional update.
    #[error("conflict on {key}: expected version {expected:?}, found {found:?}")]
    Conflict {
        key: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    /// The persistence backend failed.
    #[error("storage error: {message}")]
    Storage { message: String },

    /// A runtime invariant check failed.
    #[error("internal inconsistency: {message}")]
    InternalInconsistency { message: String },
}

/// Stable error kind identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    DuplicateName,
    InvalidSubnet,
    InvalidAddress,
    Overlap,
    PoolInUse,
    InUse,
    PoolExhausted,
    NotAllocated,
    QuotaExceeded,
    InvalidQuota,
    Conflict,
    Storage,
    InternalInconsistency,
}

impl ErrorKind {
    /// Stable string identifier for this kind.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::DuplicateName => "DuplicateName",
            Self::InvalidSubnet => "InvalidSubnet",
            Self::InvalidAddress => "InvalidAddress",
            Self::Overlap => "Overlap",
            Self::PoolInUse => "PoolInUse",
            Self::InUse => "InUse",
            Self::PoolExhausted => "PoolExhausted",
            Self::NotAllocated => "NotAllocated",
            Self::QuotaExceeded => "QuotaExceeded",
            Self::InvalidQuota => "InvalidQuota",
            Self::Conflict => "Conflict",
            Self::Storage => "Storage",
            Self::InternalInconsistency => "InternalInconsistency",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl WardenError {
    /// Create a NotFound error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create an InvalidSubnet error.
    pub fn invalid_subnet(subnet: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSubnet {
            subnet: subnet.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidAddress error.
    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create an InUse error.
    pub fn in_use(resource: impl Into<String>) -> Self {
        Self::InUse {
            resource: resource.into(),
        }
    }

    /// Create a Storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create an InternalInconsistency error.
    pub fn inconsistency(message: impl Into<String>) -> Self {
        Self::InternalInconsistency {
            message: message.into(),
        }
    }

    /// The stable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::DuplicateName { .. } => ErrorKind::DuplicateName,
            Self::InvalidSubnet { .. } => ErrorKind::InvalidSubnet,
            Self::InvalidAddress { .. } => ErrorKind::InvalidAddress,
            Self::Overlap { .. } => ErrorKind::Overlap,
            Self::PoolInUse { .. } => ErrorKind::PoolInUse,
            Self::InUse { .. } => ErrorKind::InUse,
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::NotAllocated { .. } => ErrorKind::NotAllocated,
            Self::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            Self::InvalidQuota { .. } => ErrorKind::InvalidQuota,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Storage { .. } => ErrorKind::Storage,
            Self::InternalInconsistency { .. } => ErrorKind::InternalInconsistency,
        }
    }

    /// Check if the caller may retry the same request later.
    ///
    /// Exhaustion clears when addresses are released; quota rejections
    /// only clear when the tenant's limit changes, so they are not retriable.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::Storage { .. } | Self::PoolExhausted { .. }
        )
    }

    /// Check if this error was raised by input validation, before any mutation.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidSubnet { .. }
                | Self::InvalidAddress { .. }
                | Self::DuplicateName { .. }
                | Self::Overlap { .. }
                | Self::InvalidQuota { .. }
        )
    }
}

/// Result type using WardenError.
pub type WardenResult<T> = Result<T, WardenError>;

// ============================================================================
// Outward error mapping
// ============================================================================

/// Trait for mapping WardenError to transport-specific representations.
pub trait TransportErrorMapping {
    /// The transport-specific error type.
    type Error;

    /// Map a WardenError to the transport-specific error type.
    fn map_error(error: &WardenError) -> Self::Error;
}

/// HTTP status mapping used by the REST request layer.
pub struct HttpErrorMapping;

impl HttpErrorMapping {
    /// Map a WardenError to an HTTP status code.
    pub fn to_status_code(error: &WardenError) -> u16 {
        match error {
            WardenError::NotFound { .. } => 404,
            WardenError::DuplicateName { .. } => 409,
            WardenError::InvalidSubnet { .. } => 400,
            WardenError::InvalidAddress { .. } => 400,
            WardenError::Overlap { .. } => 409,
            WardenError::PoolInUse { .. } => 409,
            WardenError::InUse { .. } => 409,
            WardenError::PoolExhausted { .. } => 503,
            WardenError::NotAllocated { .. } => 409,
            WardenError::QuotaExceeded { .. } => 403,
            WardenError::InvalidQuota { .. } => 400,
            WardenError::Conflict { .. } => 409,
            WardenError::Storage { .. } => 500,
            WardenError::InternalInconsistency { .. } => 500,
        }
    }
}

impl TransportErrorMapping for HttpErrorMapping {
    type Error = (u16, String);

    fn map_error(error: &WardenError) -> Self::Error {
        (
            Self::to_status_code(error),
            format!("{}: {}", error.kind(), error),
        )
    }
}
