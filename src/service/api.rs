//! Address service capability.
//!
//! [`AddressService`] is the seam the request layer routes to. The request
//! layer authenticates, parses payloads and renders results; everything it
//! needs from the allocator core goes through this trait. [`Controller`] is
//! the production implementation.

use crate::address::ReservationPolicy;
use crate::core::error::{WardenError, WardenResult};
use crate::mapping::{InstanceDirectory, MapRequest, MappedIp, MappingKey, MappingTable};
use crate::ops::metrics::WardenMetrics;
use crate::pool::{PoolRegistry, PoolSnapshot, RangeRef, DEFAULT_CAS_RETRIES};
use crate::quota::{QuotaDetails, QuotaLedger, QuotaPolicy, EXTERNAL_IP_QUOTA};
use crate::storage::EntityStore;
use std::sync::Arc;
use std::time::Instant;

/// Operations the request layer can invoke.
pub trait AddressService: Send + Sync {
    /// All pools, in creation order.
    fn list_pools(&self) -> WardenResult<Vec<PoolSnapshot>>;

    /// Create a pool with an optional subnet and standalone addresses.
    fn add_pool(&self, name: &str, subnet: Option<&str>, ips: &[String]) -> WardenResult<PoolSnapshot>;

    /// One pool.
    fn show_pool(&self, pool_id: &str) -> WardenResult<PoolSnapshot>;

    /// Delete a pool with no mapped addresses.
    fn delete_pool(&self, pool_id: &str) -> WardenResult<()>;

    /// Add a subnet and/or standalone addresses to a pool.
    fn add_address(&self, pool_id: &str, subnet: Option<&str>, ips: &[String]) -> WardenResult<()>;

    /// Remove a subnet or standalone address from a pool.
    fn remove_address(&self, pool_id: &str, target: &RangeRef) -> WardenResult<()>;

    /// Live mappings, optionally for one tenant.
    fn list_mapped_addresses(&self, tenant_id: Option<&str>) -> WardenResult<Vec<MappedIp>>;

    /// Map an external address to an instance.
    fn map_address(&self, request: &MapRequest) -> WardenResult<MappedIp>;

    /// Remove a mapping.
    fn unmap_address(&self, key: MappingKey<'_>) -> WardenResult<()>;

    /// A tenant's quotas with usage.
    fn list_quotas(&self, tenant_id: &str) -> WardenResult<Vec<QuotaDetails>>;

    /// Replace limits for the named quotas.
    fn update_quotas(&self, tenant_id: &str, quotas: &[QuotaDetails]) -> WardenResult<()>;
}

/// Controller construction options.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub reservation: ReservationPolicy,
    pub quotas: QuotaPolicy,
    /// Quota charged for each mapped external address.
    pub external_ip_quota: String,
    pub cas_retries: u32,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            reservation: ReservationPolicy::default(),
            quotas: QuotaPolicy::default(),
            external_ip_quota: EXTERNAL_IP_QUOTA.to_string(),
            cas_retries: DEFAULT_CAS_RETRIES,
        }
    }
}

/// What a restore loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub pools: usize,
    pub limits: usize,
    pub mappings: usize,
}

/// Production [`AddressService`].
pub struct Controller {
    store: Arc<dyn EntityStore>,
    registry: Arc<PoolRegistry>,
    ledger: Arc<QuotaLedger>,
    mappings: Arc<MappingTable>,
    metrics: Arc<WardenMetrics>,
}

impl Controller {
    /// Wire the components over a store.
    pub fn new(
        store: Arc<dyn EntityStore>,
        directory: Arc<dyn InstanceDirectory>,
        options: ControllerOptions,
    ) -> Self {
        let registry = Arc::new(
            PoolRegistry::new(store.clone(), options.reservation)
                .with_cas_retries(options.cas_retries),
        );
        let ledger = Arc::new(QuotaLedger::new(store.clone(), options.quotas));
        let mappings = Arc::new(MappingTable::new(
            registry.clone(),
            ledger.clone(),
            store.clone(),
            directory,
            options.external_ip_quota,
        ));

        Self {
            store,
            registry,
            ledger,
            mappings,
            metrics: Arc::new(WardenMetrics::new()),
        }
    }

    /// Load pools, quota limits and mappings, in that order.
    pub fn restore(&self) -> WardenResult<RestoreSummary> {
        let summary = RestoreSummary {
            pools: self.registry.restore()?,
            limits: self.ledger.restore_limits()?,
            mappings: self.mappings.restore()?,
        };
        self.refresh_gauges();
        tracing::info!(
            backend = self.store.backend_name(),
            pools = summary.pools,
            limits = summary.limits,
            mappings = summary.mappings,
            "state restored"
        );
        Ok(summary)
    }

    /// Create a pool unless one with this name exists. Returns whether it was created.
    pub fn ensure_pool(&self, name: &str, subnets: &[String], addresses: &[String]) -> WardenResult<bool> {
        if self.registry.pool_by_name(name).is_some() {
            return Ok(false);
        }
        let (first, rest) = match subnets.split_first() {
            Some((first, rest)) => (Some(first.as_str()), rest),
            None => (None, subnets),
        };
        let pool = match self.registry.create_pool(name, first, addresses) {
            Ok(pool) => pool,
            Err(WardenError::DuplicateName { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        for subnet in rest {
            self.registry
                .add_subnet_or_addresses(&pool.id, Some(subnet), &[])?;
        }
        self.refresh_gauges();
        Ok(true)
    }

    /// Pool registry.
    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    /// Quota ledger.
    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    /// Mapping table.
    pub fn mappings(&self) -> &Arc<MappingTable> {
        &self.mappings
    }

    /// Metrics.
    pub fn metrics(&self) -> &Arc<WardenMetrics> {
        &self.metrics
    }

    /// Recompute inventory gauges from current state.
    pub fn refresh_gauges(&self) {
        let pools = self.registry.list_pools();
        self.metrics
            .reset_inventory(pools.len() as u64, self.mappings.len() as u64);
        for pool in &pools {
            self.metrics.set_pool_counts(&pool.id, pool.free, pool.total);
        }
    }

    fn observe<T>(&self, operation: &str, f: impl FnOnce() -> WardenResult<T>) -> WardenResult<T> {
        let started = Instant::now();
        let result = f();
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics
            .record_request(operation, latency_ms, result.as_ref().err().map(WardenError::kind));
        if let Err(ref e) = result {
            tracing::debug!(operation, error = %e, kind = %e.kind(), "request failed");
        }
        result
    }
}

impl AddressService for Controller {
    fn list_pools(&self) -> WardenResult<Vec<PoolSnapshot>> {
        self.observe("list_pools", || Ok(self.registry.list_pools()))
    }

    fn add_pool(&self, name: &str, subnet: Option<&str>, ips: &[String]) -> WardenResult<PoolSnapshot> {
        self.observe("add_pool", || {
            let pool = self.registry.create_pool(name, subnet, ips)?;
            self.refresh_gauges();
            Ok(pool)
        })
    }

    fn show_pool(&self, pool_id: &str) -> WardenResult<PoolSnapshot> {
        self.observe("show_pool", || self.registry.show_pool(pool_id))
    }

    fn delete_pool(&self, pool_id: &str) -> WardenResult<()> {
        self.observe("delete_pool", || {
            self.registry.delete_pool(pool_id)?;
            self.refresh_gauges();
            Ok(())
        })
    }

    fn add_address(&self, pool_id: &str, subnet: Option<&str>, ips: &[String]) -> WardenResult<()> {
        self.observe("add_address", || {
            self.registry.add_subnet_or_addresses(pool_id, subnet, ips)?;
            self.refresh_gauges();
            Ok(())
        })
    }

    fn remove_address(&self, pool_id: &str, target: &RangeRef) -> WardenResult<()> {
        self.observe("remove_address", || {
            self.registry.remove_range(pool_id, target)?;
            self.refresh_gauges();
            Ok(())
        })
    }

    fn list_mapped_addresses(&self, tenant_id: Option<&str>) -> WardenResult<Vec<MappedIp>> {
        self.observe("list_mapped_addresses", || Ok(self.mappings.list_mappings(tenant_id)))
    }

    fn map_address(&self, request: &MapRequest) -> WardenResult<MappedIp> {
        self.observe("map_address", || match self.mappings.create_mapping(request) {
            Ok(mapping) => {
                self.metrics.record_reserved();
                self.refresh_gauges();
                Ok(mapping)
            }
            Err(e) => {
                match &e {
                    WardenError::QuotaExceeded { tenant_id, quota, .. } => {
                        self.metrics.record_quota_rejection(tenant_id, quota)
                    }
                    WardenError::PoolExhausted { .. } => self.metrics.record_exhausted(),
                    WardenError::Storage { .. } | WardenError::Conflict { .. } => {
                        self.metrics.record_rollback()
                    }
                    _ => {}
                }
                Err(e)
            }
        })
    }

    fn unmap_address(&self, key: MappingKey<'_>) -> WardenResult<()> {
        self.observe("unmap_address", || {
            let result = self.mappings.delete_mapping(key);
            if matches!(result, Ok(_) | Err(WardenError::InternalInconsistency { .. })) {
                self.metrics.record_released();
                self.refresh_gauges();
            }
            result.map(|_| ())
        })
    }

    fn list_quotas(&self, tenant_id: &str) -> WardenResult<Vec<QuotaDetails>> {
        self.observe("list_quotas", || Ok(self.ledger.list(tenant_id)))
    }

    fn update_quotas(&self, tenant_id: &str, quotas: &[QuotaDetails]) -> WardenResult<()> {
        self.observe("update_quotas", || self.ledger.update(tenant_id, quotas))
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("backend", &self.store.backend_name())
            .field("mappings", &self.mappings.len())
            .finish()
    }
}
