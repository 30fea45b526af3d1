//! Pool records, snapshots and selectors.

use crate::address::AddressSpace;
use crate::pool::allocator::Allocator;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Durable pool record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRecord {
    /// Pool identifier.
    pub id: String,
    /// Unique pool name.
    pub name: String,
    /// Creation order, used for default pool selection.
    pub ordinal: u64,
    /// Address spaces in insertion order.
    pub subnets: Vec<AddressSpace>,
    /// Directly added addresses.
    pub addresses: Vec<AddressRecord>,
}

/// A standalone address owned by a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    /// Address identifier.
    pub id: String,
    /// The address.
    pub address: Ipv4Addr,
}

/// Point-in-time view of a pool.
///
/// Counts are taken under the pool's allocator lock, so `free` always equals
/// the number of addresses a `Reserve` could hand out at that instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub id: String,
    pub name: String,
    pub free: u64,
    pub total: u64,
    pub subnets: Vec<SubnetSnapshot>,
    pub addresses: Vec<AddressSnapshot>,
}

/// Per-subnet counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetSnapshot {
    pub id: String,
    pub cidr: Ipv4Net,
    pub free: u64,
    pub total: u64,
}

/// Standalone address state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSnapshot {
    pub id: String,
    pub address: Ipv4Addr,
    pub allocated: bool,
}

/// How a mapping request names its pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolSelector {
    /// Explicit pool ID.
    Id(String),
    /// First pool with this name that has free capacity.
    Name(String),
    /// First pool, in creation order, with free capacity.
    Any,
}

impl PoolSelector {
    /// Build a selector from an optional pool name.
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some(name) => Self::Name(name.to_string()),
            None => Self::Any,
        }
    }
}

impl std::fmt::Display for PoolSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id:{}", id),
            Self::Name(name) => write!(f, "name:{}", name),
            Self::Any => write!(f, "any"),
        }
    }
}

/// Target of a range removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeRef {
    /// A subnet by ID.
    Subnet(String),
    /// A standalone address by ID.
    Address(String),
}

/// A live pool: identity plus its allocator.
#[derive(Debug)]
pub struct Pool {
    id: String,
    name: String,
    ordinal: u64,
    allocator: Allocator,
}

impl Pool {
    /// Build a live pool from its durable record.
    pub fn from_record(record: &PoolRecord, version: u64) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            ordinal: record.ordinal,
            allocator: Allocator::new(
                record.id.clone(),
                record.subnets.clone(),
                record.addresses.clone(),
                version,
            ),
        }
    }

    /// Pool identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creation ordinal.
    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    /// The pool's allocator.
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> PoolSnapshot {
        self.allocator.snapshot(&self.id, &self.name)
    }

    /// Durable record for the current state, with the version it was read at.
    pub fn record(&self) -> (PoolRecord, u64) {
        let (subnets, addresses, version) = self.allocator.layout();
        (
            PoolRecord {
                id: self.id.clone(),
                name: self.name.clone(),
                ordinal: self.ordinal,
                subnets,
                addresses,
            },
            version,
        )
    }
}
