//! Mapping table.
//!
//! Creating a mapping walks the reservation state machine:
//!
//! ```text
//! Unmapped -> Reserving -> Mapped -> Releasing -> Unmapped
//! ```
//!
//! While `Reserving`, the internal address claim, the quota increment and the
//! external address are held by a [`Reservation`] guard. Dropping the guard
//! without committing it gives all three back, so an error, a panic or an
//! abandoned caller can never leak capacity.
//!
//! The table's index lock is never held while calling into the allocator, the
//! quota ledger or the store.

use crate::core::error::{WardenError, WardenResult};
use crate::core::new_id;
use crate::mapping::record::{InstanceDirectory, MapRequest, MappedIp, MappingKey};
use crate::pool::{Pool, PoolRegistry};
use crate::quota::QuotaLedger;
use crate::storage::{encode, load_all, Collection, EntityStore};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Indexed {
    mapping: MappedIp,
    version: u64,
}

#[derive(Debug, Default)]
struct MappingIndex {
    by_external: BTreeMap<Ipv4Addr, Indexed>,
    by_id: HashMap<String, Ipv4Addr>,
    /// (tenant, internal address) pairs mapped or being mapped.
    internal: HashSet<(String, Ipv4Addr)>,
    /// External addresses with a delete in flight.
    releasing: HashSet<Ipv4Addr>,
}

impl MappingIndex {
    fn resolve(&self, key: MappingKey<'_>) -> Option<Ipv4Addr> {
        match key {
            MappingKey::Id(id) => self.by_id.get(id).copied(),
            MappingKey::External(addr) => self.by_external.contains_key(&addr).then_some(addr),
        }
    }

    fn insert(&mut self, mapping: MappedIp, version: u64) {
        self.by_id.insert(mapping.id.clone(), mapping.external_ip);
        self.internal
            .insert((mapping.tenant_id.clone(), mapping.internal_ip));
        self.by_external
            .insert(mapping.external_ip, Indexed { mapping, version });
    }

    fn remove(&mut self, external: Ipv4Addr) -> Option<MappedIp> {
        self.releasing.remove(&external);
        let indexed = self.by_external.remove(&external)?;
        self.by_id.remove(&indexed.mapping.id);
        self.internal
            .remove(&(indexed.mapping.tenant_id.clone(), indexed.mapping.internal_ip));
        Some(indexed.mapping)
    }
}

/// Resources held while a mapping is being created.
struct Reservation<'a> {
    table: &'a MappingTable,
    tenant_id: String,
    internal_ip: Ipv4Addr,
    quota_held: bool,
    address: Option<(Arc<Pool>, Ipv4Addr)>,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Some((pool, addr)) = self.address.take() {
            if let Err(e) = pool.allocator().release(addr) {
                tracing::error!(
                    pool_id = pool.id(),
                    external_ip = %addr,
                    error = %e,
                    "rollback could not release reserved address"
                );
            }
        }
        if self.quota_held {
            self.table
                .ledger
                .release(&self.tenant_id, &self.table.quota_name, 1);
        }
        self.table
            .index
            .write()
            .internal
            .remove(&(self.tenant_id.clone(), self.internal_ip));
        tracing::debug!(tenant_id = %self.tenant_id, "mapping reservation rolled back");
    }
}

/// Live mappings of external addresses to tenant instances.
pub struct MappingTable {
    registry: Arc<PoolRegistry>,
    ledger: Arc<QuotaLedger>,
    store: Arc<dyn EntityStore>,
    directory: Arc<dyn InstanceDirectory>,
    quota_name: String,
    index: RwLock<MappingIndex>,
}

impl MappingTable {
    /// Create an empty table.
    pub fn new(
        registry: Arc<PoolRegistry>,
        ledger: Arc<QuotaLedger>,
        store: Arc<dyn EntityStore>,
        directory: Arc<dyn InstanceDirectory>,
        quota_name: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            ledger,
            store,
            directory,
            quota_name: quota_name.into(),
            index: RwLock::new(MappingIndex::default()),
        }
    }

    /// Name of the quota charged for each mapping.
    pub fn quota_name(&self) -> &str {
        &self.quota_name
    }

    /// Load mappings from the store, marking each external address allocated
    /// and counting it against the tenant's quota.
    pub fn restore(&self) -> WardenResult<usize> {
        let records: Vec<(MappedIp, u64)> = load_all(self.store.as_ref(), Collection::Mappings)?;
        for (mapping, version) in &records {
            let pool = self.registry.pool(&mapping.pool_id).map_err(|_| {
                WardenError::inconsistency(format!(
                    "mapping {} references missing pool {}",
                    mapping.id, mapping.pool_id
                ))
            })?;
            pool.allocator()
                .reserve_specific(mapping.external_ip)
                .map_err(|e| {
                    WardenError::inconsistency(format!(
                        "mapping {} cannot claim {}: {}",
                        mapping.id, mapping.external_ip, e
                    ))
                })?;
            self.ledger
                .restore_usage(&mapping.tenant_id, &self.quota_name, 1);
            self.index.write().insert(mapping.clone(), *version);
        }
        tracing::info!(mappings = records.len(), "restored mappings");
        Ok(records.len())
    }

    /// Map an external address to an instance.
    pub fn create_mapping(&self, request: &MapRequest) -> WardenResult<MappedIp> {
        let internal_ip = match request.internal_ip {
            Some(addr) => addr,
            None => self
                .directory
                .internal_address(&request.instance_id)
                .ok_or_else(|| {
                    WardenError::invalid_address(
                        request.instance_id.as_str(),
                        "instance has no internal address",
                    )
                })?,
        };
        if internal_ip.is_unspecified() || internal_ip.is_broadcast() {
            return Err(WardenError::invalid_address(
                internal_ip.to_string(),
                "not a host address",
            ));
        }

        let mut reservation = self.claim_internal(&request.tenant_id, internal_ip)?;

        self.ledger
            .check_and_reserve(&request.tenant_id, &self.quota_name, 1)?;
        reservation.quota_held = true;

        let (pool, external_ip) = self.registry.select_and_reserve(&request.pool)?;
        reservation.address = Some((pool.clone(), external_ip));

        let mapping = MappedIp {
            id: new_id(),
            external_ip,
            internal_ip,
            tenant_id: request.tenant_id.clone(),
            instance_id: request.instance_id.clone(),
            pool_id: pool.id().to_string(),
            pool_name: pool.name().to_string(),
        };
        let version = self.store.compare_and_swap(
            Collection::Mappings,
            &external_ip.to_string(),
            None,
            Some(encode(&mapping)?),
        )?;

        self.index.write().insert(mapping.clone(), version);
        reservation.commit();

        tracing::info!(
            mapping_id = %mapping.id,
            tenant_id = %mapping.tenant_id,
            pool_id = %mapping.pool_id,
            external_ip = %external_ip,
            internal_ip = %internal_ip,
            "address mapped"
        );
        Ok(mapping)
    }

    /// Remove a mapping and return its address to the pool.
    pub fn delete_mapping(&self, key: MappingKey<'_>) -> WardenResult<MappedIp> {
        let (mapping, version) = {
            let mut index = self.index.write();
            let external = index
                .resolve(key)
                .filter(|addr| !index.releasing.contains(addr))
                .ok_or_else(|| WardenError::not_found(key.to_string()))?;
            index.releasing.insert(external);
            let indexed = &index.by_external[&external];
            (indexed.mapping.clone(), indexed.version)
        };

        if let Err(e) = self.store.compare_and_swap(
            Collection::Mappings,
            &mapping.external_ip.to_string(),
            Some(version),
            None,
        ) {
            self.index.write().releasing.remove(&mapping.external_ip);
            return Err(e);
        }

        // The entry must leave the index before the address is reservable
        // again, or a new mapping of the same address would be removed here.
        self.index.write().remove(mapping.external_ip);
        let released = self
            .registry
            .release(&mapping.pool_id, mapping.external_ip);
        self.ledger
            .release(&mapping.tenant_id, &self.quota_name, 1);

        if let Err(e) = released {
            tracing::error!(
                mapping_id = %mapping.id,
                pool_id = %mapping.pool_id,
                external_ip = %mapping.external_ip,
                error = %e,
                "mapped address was not allocated in its pool"
            );
            return Err(WardenError::inconsistency(format!(
                "mapping {} held {} but its pool did not: {}",
                mapping.id, mapping.external_ip, e
            )));
        }

        tracing::info!(
            mapping_id = %mapping.id,
            tenant_id = %mapping.tenant_id,
            external_ip = %mapping.external_ip,
            "address unmapped"
        );
        Ok(mapping)
    }

    /// Mappings ordered by external address, optionally for one tenant.
    pub fn list_mappings(&self, tenant_id: Option<&str>) -> Vec<MappedIp> {
        self.index
            .read()
            .by_external
            .values()
            .filter(|i| tenant_id.map_or(true, |t| i.mapping.tenant_id == t))
            .map(|i| i.mapping.clone())
            .collect()
    }

    /// Look up one mapping.
    pub fn get(&self, key: MappingKey<'_>) -> Option<MappedIp> {
        let index = self.index.read();
        index
            .resolve(key)
            .and_then(|addr| index.by_external.get(&addr))
            .map(|i| i.mapping.clone())
    }

    /// Number of live mappings per pool ID.
    pub fn counts_by_pool(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for indexed in self.index.read().by_external.values() {
            *counts.entry(indexed.mapping.pool_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Number of live mappings per tenant.
    pub fn counts_by_tenant(&self) -> HashMap<String, u64> {
        let mut counts = HashMap::new();
        for indexed in self.index.read().by_external.values() {
            *counts.entry(indexed.mapping.tenant_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        self.index.read().by_external.len()
    }

    /// Whether there are no live mappings.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn claim_internal(&self, tenant_id: &str, internal_ip: Ipv4Addr) -> WardenResult<Reservation<'_>> {
        let key = (tenant_id.to_string(), internal_ip);
        if !self.index.write().internal.insert(key) {
            return Err(WardenError::in_use(format!(
                "internal address {} of tenant {}",
                internal_ip, tenant_id
            )));
        }
        Ok(Reservation {
            table: self,
            tenant_id: tenant_id.to_string(),
            internal_ip,
            quota_held: false,
            address: None,
            committed: false,
        })
    }
}

impl std::fmt::Debug for MappingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingTable")
            .field("mappings", &self.len())
            .field("quota_name", &self.quota_name)
            .finish()
    }
}
