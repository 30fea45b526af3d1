//! Pool registry.
//!
//! The registry is the directory of all pools and the entry point for pool
//! lifecycle. Structural changes follow a two-phase protocol so that no lock
//! is held while the store is written:
//!
//! 1. validate and claim (registry write lock): names and ranges are checked
//!    against every pool and against claims of in-flight operations
//! 2. persist (no locks): compare-and-swap of the pool record
//! 3. apply (registry or allocator lock), then release the claim
//!
//! Removals run the other way round: the allocator withdraws the range
//! (refusing if anything in it is mapped), the shrunken record is persisted,
//! and the range is dropped, or put back into service if persisting failed.
//!
//! Lock order is always registry → allocator. The reservation path only
//! holds the registry read lock long enough to clone the pool handle.

use crate::address::{parse_address, AddressSpace, ReservationPolicy};
use crate::core::error::{WardenError, WardenResult};
use crate::core::new_id;
use crate::pool::model::{AddressRecord, Pool, PoolRecord, PoolSelector, PoolSnapshot, RangeRef};
use crate::storage::{encode, load_all, Collection, EntityStore};
use ipnet::Ipv4Net;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default number of attempts for an operation that hits store version conflicts.
pub const DEFAULT_CAS_RETRIES: u32 = 8;

#[derive(Debug, Default)]
struct RegistryState {
    pools: HashMap<String, Arc<Pool>>,
    claimed_names: HashSet<String>,
    claimed_ranges: Vec<Ipv4Net>,
    claimed_addresses: HashSet<Ipv4Addr>,
}

impl RegistryState {
    fn name_taken(&self, name: &str) -> bool {
        self.claimed_names.contains(name) || self.pools.values().any(|p| p.name() == name)
    }

    fn check_subnet(&self, net: &Ipv4Net) -> WardenResult<()> {
        for pool in self.pools.values() {
            if let Some(existing) = pool.allocator().overlapping(net) {
                return Err(WardenError::Overlap {
                    range: net.to_string(),
                    existing,
                    pool_name: pool.name().to_string(),
                });
            }
        }
        let pending = self
            .claimed_ranges
            .iter()
            .find(|c| c.contains(net) || net.contains(*c))
            .map(|c| c.to_string())
            .or_else(|| {
                self.claimed_addresses
                    .iter()
                    .find(|a| net.contains(*a))
                    .map(|a| a.to_string())
            });
        match pending {
            Some(existing) => Err(WardenError::Overlap {
                range: net.to_string(),
                existing,
                pool_name: "<pending>".to_string(),
            }),
            None => Ok(()),
        }
    }

    fn check_address(&self, addr: Ipv4Addr) -> WardenResult<()> {
        for pool in self.pools.values() {
            if let Some(existing) = pool.allocator().owner_of(addr) {
                return Err(WardenError::Overlap {
                    range: addr.to_string(),
                    existing,
                    pool_name: pool.name().to_string(),
                });
            }
        }
        let pending = self
            .claimed_ranges
            .iter()
            .find(|c| c.contains(&addr))
            .map(|c| c.to_string())
            .or_else(|| {
                self.claimed_addresses
                    .contains(&addr)
                    .then(|| addr.to_string())
            });
        match pending {
            Some(existing) => Err(WardenError::Overlap {
                range: addr.to_string(),
                existing,
                pool_name: "<pending>".to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Names and ranges held by an in-flight operation between validation and commit.
struct Claim<'a> {
    registry: &'a PoolRegistry,
    name: Option<String>,
    ranges: Vec<Ipv4Net>,
    addresses: Vec<Ipv4Addr>,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let mut state = self.registry.state.write();
        if let Some(name) = self.name.take() {
            state.claimed_names.remove(&name);
        }
        state
            .claimed_ranges
            .retain(|r| !self.ranges.contains(r));
        for addr in &self.addresses {
            state.claimed_addresses.remove(addr);
        }
    }
}

/// Validated input of a create or extend request.
struct ParsedRanges {
    subnet: Option<AddressSpace>,
    addresses: Vec<Ipv4Addr>,
}

/// Directory of all pools.
pub struct PoolRegistry {
    state: RwLock<RegistryState>,
    store: Arc<dyn EntityStore>,
    policy: ReservationPolicy,
    cas_retries: u32,
    next_ordinal: AtomicU64,
}

impl PoolRegistry {
    /// Create an empty registry over a store.
    pub fn new(store: Arc<dyn EntityStore>, policy: ReservationPolicy) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            store,
            policy,
            cas_retries: DEFAULT_CAS_RETRIES,
            next_ordinal: AtomicU64::new(1),
        }
    }

    /// Set the number of attempts on store version conflicts.
    pub fn with_cas_retries(mut self, retries: u32) -> Self {
        self.cas_retries = retries.max(1);
        self
    }

    /// Reservation policy applied to new subnets.
    pub fn policy(&self) -> ReservationPolicy {
        self.policy
    }

    /// Load all pools from the store. Returns the number of pools loaded.
    pub fn restore(&self) -> WardenResult<usize> {
        let records: Vec<(PoolRecord, u64)> = load_all(self.store.as_ref(), Collection::Pools)?;
        let mut state = self.state.write();
        let mut max_ordinal = 0;
        for (record, version) in &records {
            max_ordinal = max_ordinal.max(record.ordinal);
            state
                .pools
                .insert(record.id.clone(), Arc::new(Pool::from_record(record, *version)));
        }
        self.next_ordinal.store(max_ordinal + 1, Ordering::Release);
        tracing::info!(pools = records.len(), "restored pools");
        Ok(records.len())
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Get a pool by ID.
    pub fn pool(&self, pool_id: &str) -> WardenResult<Arc<Pool>> {
        self.state
            .read()
            .pools
            .get(pool_id)
            .cloned()
            .ok_or_else(|| WardenError::not_found(format!("pool {}", pool_id)))
    }

    /// Get a pool by name.
    pub fn pool_by_name(&self, name: &str) -> Option<Arc<Pool>> {
        self.pools().into_iter().find(|p| p.name() == name)
    }

    /// All pools in creation order.
    pub fn pools(&self) -> Vec<Arc<Pool>> {
        let mut pools: Vec<_> = self.state.read().pools.values().cloned().collect();
        pools.sort_by_key(|p| p.ordinal());
        pools
    }

    /// Snapshots of all pools, in creation order.
    pub fn list_pools(&self) -> Vec<PoolSnapshot> {
        self.pools().iter().map(|p| p.snapshot()).collect()
    }

    /// Snapshot of one pool.
    pub fn show_pool(&self, pool_id: &str) -> WardenResult<PoolSnapshot> {
        Ok(self.pool(pool_id)?.snapshot())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Create a pool, optionally seeded with a subnet and standalone addresses.
    pub fn create_pool(
        &self,
        name: &str,
        subnet: Option<&str>,
        addresses: &[String],
    ) -> WardenResult<PoolSnapshot> {
        let parsed = self.parse_ranges(subnet, addresses)?;

        let claim = {
            let mut state = self.state.write();
            if state.name_taken(name) {
                return Err(WardenError::DuplicateName {
                    name: name.to_string(),
                });
            }
            if let Some(ref space) = parsed.subnet {
                state.check_subnet(&space.cidr()).map_err(|e| {
                    WardenError::invalid_subnet(space.cidr().to_string(), e.to_string())
                })?;
            }
            for addr in &parsed.addresses {
                state
                    .check_address(*addr)
                    .map_err(|e| WardenError::invalid_address(addr.to_string(), e.to_string()))?;
            }
            self.claim(&mut state, Some(name), &parsed)
        };

        let record = PoolRecord {
            id: new_id(),
            name: name.to_string(),
            ordinal: self.next_ordinal.fetch_add(1, Ordering::AcqRel),
            subnets: parsed.subnet.into_iter().collect(),
            addresses: parsed
                .addresses
                .iter()
                .map(|a| AddressRecord {
                    id: new_id(),
                    address: *a,
                })
                .collect(),
        };
        let version =
            self.store
                .compare_and_swap(Collection::Pools, &record.id, None, Some(encode(&record)?))?;

        let pool = Arc::new(Pool::from_record(&record, version));
        let snapshot = pool.snapshot();
        self.state.write().pools.insert(record.id.clone(), pool);
        drop(claim);

        tracing::info!(
            pool_id = %record.id,
            name = %record.name,
            total = snapshot.total,
            "pool created"
        );
        Ok(snapshot)
    }

    /// Delete a pool that has no mapped addresses.
    pub fn delete_pool(&self, pool_id: &str) -> WardenResult<()> {
        let pool = self.pool(pool_id)?;

        self.with_retries(|| {
            let version = pool.allocator().begin_retire()?;
            if let Err(e) = self
                .store
                .compare_and_swap(Collection::Pools, pool_id, Some(version), None)
            {
                pool.allocator().abort_retire();
                return Err(e);
            }
            Ok(())
        })?;

        self.state.write().pools.remove(pool_id);
        tracing::info!(pool_id = pool_id, name = pool.name(), "pool deleted");
        Ok(())
    }

    /// Extend a pool with a subnet and/or standalone addresses.
    pub fn add_subnet_or_addresses(
        &self,
        pool_id: &str,
        subnet: Option<&str>,
        addresses: &[String],
    ) -> WardenResult<()> {
        let pool = self.pool(pool_id)?;
        let parsed = self.parse_ranges(subnet, addresses)?;
        if parsed.subnet.is_none() && parsed.addresses.is_empty() {
            return Ok(());
        }

        let _claim = {
            let mut state = self.state.write();
            if let Some(ref space) = parsed.subnet {
                state.check_subnet(&space.cidr())?;
            }
            for addr in &parsed.addresses {
                state.check_address(*addr)?;
            }
            self.claim(&mut state, None, &parsed)
        };

        let new_subnets: Vec<AddressSpace> = parsed.subnet.iter().cloned().collect();
        let new_addresses: Vec<AddressRecord> = parsed
            .addresses
            .iter()
            .map(|a| AddressRecord {
                id: new_id(),
                address: *a,
            })
            .collect();

        self.with_retries(|| {
            let (mut record, version) = pool.record();
            record.subnets.extend(new_subnets.iter().cloned());
            record.addresses.extend(new_addresses.iter().cloned());
            let new_version = self
                .store
                .compare_and_swap(Collection::Pools, pool_id, Some(version), Some(encode(&record)?))
                .map_err(|e| match e {
                    WardenError::Conflict { found: None, .. } => {
                        WardenError::not_found(format!("pool {}", pool_id))
                    }
                    other => other,
                })?;
            pool.allocator()
                .apply_additions(new_subnets.clone(), new_addresses.clone(), new_version);
            Ok(())
        })?;

        tracing::info!(
            pool_id = pool_id,
            subnets = new_subnets.len(),
            addresses = new_addresses.len(),
            "pool extended"
        );
        Ok(())
    }

    /// Remove a subnet or standalone address that has nothing mapped.
    pub fn remove_range(&self, pool_id: &str, target: &RangeRef) -> WardenResult<()> {
        let pool = self.pool(pool_id)?;

        self.with_retries(|| {
            pool.allocator().begin_removal(target)?;
            let (mut record, version) = pool.record();
            match target {
                RangeRef::Subnet(id) => record.subnets.retain(|s| s.id() != id),
                RangeRef::Address(id) => record.addresses.retain(|a| a.id != *id),
            }

            let persisted = encode(&record).and_then(|bytes| {
                self.store
                    .compare_and_swap(Collection::Pools, pool_id, Some(version), Some(bytes))
            });
            match persisted {
                Ok(new_version) => {
                    pool.allocator().finish_removal(target, new_version);
                    Ok(())
                }
                Err(e) => {
                    pool.allocator().abort_removal(target);
                    Err(e)
                }
            }
        })?;

        tracing::info!(pool_id = pool_id, target = ?target, "range removed");
        Ok(())
    }

    /// Remove a subnet by ID.
    pub fn remove_subnet(&self, pool_id: &str, subnet_id: &str) -> WardenResult<()> {
        self.remove_range(pool_id, &RangeRef::Subnet(subnet_id.to_string()))
    }

    /// Remove a standalone address by ID.
    pub fn remove_address(&self, pool_id: &str, address_id: &str) -> WardenResult<()> {
        self.remove_range(pool_id, &RangeRef::Address(address_id.to_string()))
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Reserve one address from a pool.
    pub fn reserve(&self, pool_id: &str) -> WardenResult<Ipv4Addr> {
        self.pool(pool_id)?.allocator().reserve()
    }

    /// Release an address back to its pool.
    pub fn release(&self, pool_id: &str, addr: Ipv4Addr) -> WardenResult<()> {
        self.pool(pool_id)?.allocator().release(addr)
    }

    /// Resolve a selector and reserve an address from the first pool with capacity.
    ///
    /// Candidates are tried in creation order; a candidate that runs dry
    /// between the check and the reservation falls through to the next.
    pub fn select_and_reserve(&self, selector: &PoolSelector) -> WardenResult<(Arc<Pool>, Ipv4Addr)> {
        let candidates = match selector {
            PoolSelector::Id(id) => {
                let pool = self.pool(id)?;
                let addr = pool.allocator().reserve()?;
                return Ok((pool, addr));
            }
            PoolSelector::Name(name) => {
                let pools: Vec<_> = self
                    .pools()
                    .into_iter()
                    .filter(|p| p.name() == name)
                    .collect();
                if pools.is_empty() {
                    return Err(WardenError::not_found(format!("pool named {}", name)));
                }
                pools
            }
            PoolSelector::Any => self.pools(),
        };

        for pool in candidates {
            match pool.allocator().reserve() {
                Ok(addr) => return Ok((pool, addr)),
                Err(WardenError::PoolExhausted { .. }) | Err(WardenError::NotFound { .. }) => {
                    continue
                }
                Err(e) => return Err(e),
            }
        }
        Err(WardenError::PoolExhausted {
            pool: selector.to_string(),
        })
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn parse_ranges(&self, subnet: Option<&str>, addresses: &[String]) -> WardenResult<ParsedRanges> {
        let subnet = subnet
            .map(|s| AddressSpace::parse(new_id(), s, self.policy))
            .transpose()?;

        let mut parsed: Vec<Ipv4Addr> = Vec::with_capacity(addresses.len());
        for text in addresses {
            let addr = parse_address(text)?;
            if parsed.contains(&addr) {
                return Err(WardenError::invalid_address(text.as_str(), "listed twice"));
            }
            if let Some(ref space) = subnet {
                if space.contains(addr) {
                    return Err(WardenError::Overlap {
                        range: addr.to_string(),
                        existing: space.cidr().to_string(),
                        pool_name: "<request>".to_string(),
                    });
                }
            }
            parsed.push(addr);
        }

        Ok(ParsedRanges {
            subnet,
            addresses: parsed,
        })
    }

    fn claim(&self, state: &mut RegistryState, name: Option<&str>, parsed: &ParsedRanges) -> Claim<'_> {
        if let Some(name) = name {
            state.claimed_names.insert(name.to_string());
        }
        let ranges: Vec<Ipv4Net> = parsed.subnet.iter().map(|s| s.cidr()).collect();
        state.claimed_ranges.extend(ranges.iter().copied());
        state.claimed_addresses.extend(parsed.addresses.iter().copied());

        Claim {
            registry: self,
            name: name.map(str::to_string),
            ranges,
            addresses: parsed.addresses.clone(),
        }
    }

    fn with_retries<T>(&self, mut op: impl FnMut() -> WardenResult<T>) -> WardenResult<T> {
        let mut attempt = 1;
        loop {
            match op() {
                Err(WardenError::Conflict { .. }) if attempt < self.cas_retries => {
                    attempt += 1;
                    tracing::debug!(attempt, "store version conflict, retrying");
                    std::thread::yield_now();
                }
                other => return other,
            }
        }
    }
}
