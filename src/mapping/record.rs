//! Mapping records and requests.

use crate::pool::PoolSelector;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// An external address mapped to a tenant instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedIp {
    pub id: String,
    pub external_ip: Ipv4Addr,
    pub internal_ip: Ipv4Addr,
    pub tenant_id: String,
    /// Empty when the address is reserved but not attached to an instance.
    pub instance_id: String,
    pub pool_id: String,
    pub pool_name: String,
}

/// Hyperlink attached to a listed mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub rel: String,
    pub href: String,
}

/// Who a mapping listing is rendered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkScope<'a> {
    /// Listing for one tenant; cross-tenant links are omitted.
    Tenant(&'a str),
    /// Administrative listing across all tenants.
    Global,
}

impl MappedIp {
    /// Links for this mapping as seen from `scope`.
    pub fn links(&self, scope: LinkScope<'_>) -> Vec<Link> {
        match scope {
            LinkScope::Tenant(tenant) => vec![Link {
                rel: "self".to_string(),
                href: format!("{}/external-ips/{}", tenant, self.id),
            }],
            LinkScope::Global => vec![
                Link {
                    rel: "self".to_string(),
                    href: format!("/external-ips/{}", self.id),
                },
                Link {
                    rel: "pool".to_string(),
                    href: format!("/pools/{}", self.pool_id),
                },
            ],
        }
    }
}

/// A request to map an external address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRequest {
    pub tenant_id: String,
    pub pool: PoolSelector,
    pub instance_id: String,
    /// Internal address to map to. Looked up from the instance when absent.
    pub internal_ip: Option<Ipv4Addr>,
}

impl MapRequest {
    /// Map an instance's address from any pool with capacity.
    pub fn new(tenant_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            pool: PoolSelector::Any,
            instance_id: instance_id.into(),
            internal_ip: None,
        }
    }

    /// Select the pool.
    pub fn pool(mut self, pool: PoolSelector) -> Self {
        self.pool = pool;
        self
    }

    /// Supply the internal address.
    pub fn internal_ip(mut self, addr: Ipv4Addr) -> Self {
        self.internal_ip = Some(addr);
        self
    }
}

/// How a mapping is named for deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKey<'a> {
    Id(&'a str),
    External(Ipv4Addr),
}

impl std::fmt::Display for MappingKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "mapping {}", id),
            Self::External(addr) => write!(f, "mapping for {}", addr),
        }
    }
}

/// Source of instance internal addresses.
///
/// Implemented by the workload store; the allocator core only asks for the
/// address an instance already has.
pub trait InstanceDirectory: Send + Sync {
    /// Internal address of an instance, if known.
    fn internal_address(&self, instance_id: &str) -> Option<Ipv4Addr>;
}

/// Directory that knows no instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInstances;

impl InstanceDirectory for NoInstances {
    fn internal_address(&self, _instance_id: &str) -> Option<Ipv4Addr> {
        None
    }
}
