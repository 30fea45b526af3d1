//! Consistency audit.
//!
//! A periodic sweep that cross-checks the allocator, the mapping table and
//! the quota ledger:
//!
//! - every mapped external address is allocated in the pool it names
//! - each pool's allocated count equals its live mapping count
//! - each tenant's external-IP quota usage equals its live mapping count
//!
//! Reservations in flight make these checks briefly disagree, so a finding
//! is only reported once it has been seen by two consecutive sweeps.

use crate::service::Controller;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// A discrepancy between components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Finding {
    /// A mapping whose external address is not allocated in its pool.
    UnallocatedMapping {
        mapping_id: String,
        pool_id: String,
        external_ip: String,
    },
    /// A mapping that references a pool the registry does not have.
    MissingPool { mapping_id: String, pool_id: String },
    /// Allocated addresses and live mappings of a pool disagree.
    AllocationMismatch {
        pool_id: String,
        allocated: usize,
        mapped: usize,
    },
    /// Quota usage and live mappings of a tenant disagree.
    UsageMismatch {
        tenant_id: String,
        usage: u64,
        mapped: u64,
    },
}

impl std::fmt::Display for Finding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnallocatedMapping {
                mapping_id,
                pool_id,
                external_ip,
            } => write!(
                f,
                "mapping {} holds {} which pool {} has not allocated",
                mapping_id, external_ip, pool_id
            ),
            Self::MissingPool {
                mapping_id,
                pool_id,
            } => write!(f, "mapping {} references missing pool {}", mapping_id, pool_id),
            Self::AllocationMismatch {
                pool_id,
                allocated,
                mapped,
            } => write!(
                f,
                "pool {} has {} allocated addresses but {} mappings",
                pool_id, allocated, mapped
            ),
            Self::UsageMismatch {
                tenant_id,
                usage,
                mapped,
            } => write!(
                f,
                "tenant {} quota usage {} but {} mappings",
                tenant_id, usage, mapped
            ),
        }
    }
}

/// Result of one sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditReport {
    pub pools_checked: usize,
    pub mappings_checked: usize,
    /// Findings seen by this sweep and the one before.
    pub confirmed: Vec<Finding>,
    /// Findings seen by this sweep only.
    pub suspected: usize,
}

impl AuditReport {
    /// Whether the sweep confirmed nothing.
    pub fn is_clean(&self) -> bool {
        self.confirmed.is_empty()
    }
}

/// Consistency auditor. Remembers the previous sweep's findings.
#[derive(Debug, Default)]
pub struct ConsistencyAudit {
    previous: Mutex<HashSet<Finding>>,
}

impl ConsistencyAudit {
    /// Create an auditor with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one sweep over the controller's state.
    pub fn sweep(&self, controller: &Controller) -> AuditReport {
        let current = Self::inspect(controller);
        let pools_checked = controller.registry().pools().len();
        let mappings_checked = controller.mappings().len();

        let mut previous = self.previous.lock();
        let confirmed: Vec<Finding> = current
            .iter()
            .filter(|f| previous.contains(*f))
            .cloned()
            .collect();
        let suspected = current.len() - confirmed.len();
        *previous = current.into_iter().collect();
        drop(previous);

        for finding in &confirmed {
            tracing::error!(finding = %finding, "internal inconsistency");
        }
        controller
            .metrics()
            .record_inconsistencies(confirmed.len() as u64);
        controller.refresh_gauges();

        tracing::debug!(
            pools = pools_checked,
            mappings = mappings_checked,
            confirmed = confirmed.len(),
            suspected,
            "consistency sweep complete"
        );
        AuditReport {
            pools_checked,
            mappings_checked,
            confirmed,
            suspected,
        }
    }

    fn inspect(controller: &Controller) -> BTreeSet<Finding> {
        let mut findings = BTreeSet::new();
        let registry = controller.registry();
        let mappings = controller.mappings();

        for mapping in mappings.list_mappings(None) {
            match registry.pool(&mapping.pool_id) {
                Ok(pool) => {
                    if !pool.allocator().is_allocated(mapping.external_ip) {
                        findings.insert(Finding::UnallocatedMapping {
                            mapping_id: mapping.id.clone(),
                            pool_id: mapping.pool_id.clone(),
                            external_ip: mapping.external_ip.to_string(),
                        });
                    }
                }
                Err(_) => {
                    findings.insert(Finding::MissingPool {
                        mapping_id: mapping.id.clone(),
                        pool_id: mapping.pool_id.clone(),
                    });
                }
            }
        }

        let by_pool = mappings.counts_by_pool();
        for pool in registry.pools() {
            let allocated = pool.allocator().allocated_count();
            let mapped = by_pool.get(pool.id()).copied().unwrap_or(0);
            if allocated != mapped {
                findings.insert(Finding::AllocationMismatch {
                    pool_id: pool.id().to_string(),
                    allocated,
                    mapped,
                });
            }
        }

        let by_tenant = mappings.counts_by_tenant();
        let ledger = controller.ledger();
        let mut tenants: BTreeSet<String> = ledger.tenants().into_iter().collect();
        tenants.extend(by_tenant.keys().cloned());
        for tenant_id in tenants {
            let usage = ledger.usage(&tenant_id, mappings.quota_name());
            let mapped = by_tenant.get(&tenant_id).copied().unwrap_or(0);
            if usage != mapped {
                findings.insert(Finding::UsageMismatch {
                    tenant_id,
                    usage,
                    mapped,
                });
            }
        }

        findings
    }
}
