//! Per-pool address allocator.
//!
//! The allocator is the only writer of a pool's free set. All of its state
//! sits behind one short-held mutex, so:
//!
//! - an address handed out by [`Allocator::reserve`] is never handed out
//!   again until [`Allocator::release`] returns it
//! - releasing an address that is not reserved fails with `NotAllocated`
//! - free/total counts are computed under the same lock as reservations and
//!   can never disagree with the reservable set
//!
//! Different pools have different allocators and never contend.
//!
//! # Selection
//!
//! Next-fit: each subnet keeps a cursor just past its last reservation and
//! takes the first free offset at or after it, wrapping once. Free offsets
//! are kept as runs, so finding one is a map lookup rather than a scan. Subnets are tried in insertion order, then
//! standalone addresses in ascending order. A just-released address is
//! therefore not immediately handed to the next tenant.

use crate::address::AddressSpace;
use crate::core::error::{WardenError, WardenResult};
use crate::pool::model::{AddressRecord, AddressSnapshot, PoolSnapshot, RangeRef, SubnetSnapshot};
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

#[derive(Debug)]
struct SubnetSlot {
    space: AddressSpace,
    /// Offsets currently reserved.
    allocated: BTreeSet<u32>,
    /// Free allocatable offsets as disjoint runs, start to exclusive end.
    free_runs: BTreeMap<u64, u64>,
    /// Offset at which the next scan starts.
    cursor: u32,
    /// Pending removal; not reservable.
    draining: bool,
}

impl SubnetSlot {
    fn new(space: AddressSpace) -> Self {
        let mut free_runs = BTreeMap::new();
        let mut start = 0u64;
        for &reserved in space.reserved_offsets() {
            let reserved = u64::from(reserved);
            if reserved > start {
                free_runs.insert(start, reserved);
            }
            start = reserved + 1;
        }
        if space.size() > start {
            free_runs.insert(start, space.size());
        }
        Self {
            space,
            allocated: BTreeSet::new(),
            free_runs,
            cursor: 0,
            draining: false,
        }
    }

    fn free(&self) -> u64 {
        self.space.total() - self.allocated.len() as u64
    }

    /// First free offset at or after the cursor, wrapping to the lowest.
    fn next_free(&self) -> Option<u64> {
        let cursor = u64::from(self.cursor);
        if let Some((_, &end)) = self.free_runs.range(..=cursor).next_back() {
            if end > cursor {
                return Some(cursor);
            }
        }
        self.free_runs
            .range(cursor..)
            .next()
            .or_else(|| self.free_runs.iter().next())
            .map(|(&start, _)| start)
    }

    fn take_next(&mut self) -> Option<Ipv4Addr> {
        if self.draining || self.free() == 0 {
            return None;
        }
        let offset = u32::try_from(self.next_free()?).ok()?;
        let found = self.space.address_at(offset)?;
        if !self.take(offset) {
            return None;
        }
        self.cursor = offset.wrapping_add(1);
        if u64::from(self.cursor) >= self.space.size() {
            self.cursor = 0;
        }
        Some(found)
    }

    /// Move a free offset into the allocated set.
    fn take(&mut self, offset: u32) -> bool {
        let at = u64::from(offset);
        let Some((&start, &end)) = self.free_runs.range(..=at).next_back() else {
            return false;
        };
        if end <= at {
            return false;
        }
        self.free_runs.remove(&start);
        if start < at {
            self.free_runs.insert(start, at);
        }
        if at + 1 < end {
            self.free_runs.insert(at + 1, end);
        }
        self.allocated.insert(offset)
    }

    /// Return an allocated offset to the free runs, merging neighbours.
    fn give_back(&mut self, offset: u32) -> bool {
        if !self.allocated.remove(&offset) {
            return false;
        }
        let mut start = u64::from(offset);
        let mut end = start + 1;
        if let Some((&prev_start, &prev_end)) = self.free_runs.range(..start).next_back() {
            if prev_end == start {
                self.free_runs.remove(&prev_start);
                start = prev_start;
            }
        }
        if let Some(next_end) = self.free_runs.remove(&end) {
            end = next_end;
        }
        self.free_runs.insert(start, end);
        true
    }
}

#[derive(Debug)]
struct StandaloneSlot {
    id: String,
    allocated: bool,
    draining: bool,
}

#[derive(Debug)]
struct Inventory {
    subnets: Vec<SubnetSlot>,
    standalone: BTreeMap<Ipv4Addr, StandaloneSlot>,
    /// Set once the pool is being deleted; nothing can be reserved after.
    retired: bool,
    /// Store version of the pool record this inventory corresponds to.
    version: u64,
}

impl Inventory {
    fn counts(&self) -> (u64, u64) {
        let mut free = 0;
        let mut total = 0;
        for slot in self.subnets.iter().filter(|s| !s.draining) {
            free += slot.free();
            total += slot.space.total();
        }
        for slot in self.standalone.values().filter(|s| !s.draining) {
            total += 1;
            if !slot.allocated {
                free += 1;
            }
        }
        (free, total)
    }

    fn allocated_count(&self) -> usize {
        self.subnets.iter().map(|s| s.allocated.len()).sum::<usize>()
            + self.standalone.values().filter(|s| s.allocated).count()
    }
}

/// Mutual-exclusion authority over one pool's address inventory.
#[derive(Debug)]
pub struct Allocator {
    pool_id: String,
    inventory: Mutex<Inventory>,
}

impl Allocator {
    /// Create an allocator with nothing reserved.
    pub fn new(
        pool_id: impl Into<String>,
        subnets: Vec<AddressSpace>,
        addresses: Vec<AddressRecord>,
        version: u64,
    ) -> Self {
        let standalone = addresses
            .into_iter()
            .map(|a| {
                (
                    a.address,
                    StandaloneSlot {
                        id: a.id,
                        allocated: false,
                        draining: false,
                    },
                )
            })
            .collect();

        Self {
            pool_id: pool_id.into(),
            inventory: Mutex::new(Inventory {
                subnets: subnets.into_iter().map(SubnetSlot::new).collect(),
                standalone,
                retired: false,
                version,
            }),
        }
    }

    /// Pool this allocator serves.
    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    /// Reserve one free address.
    pub fn reserve(&self) -> WardenResult<Ipv4Addr> {
        let mut inv = self.inventory.lock();
        if inv.retired {
            return Err(WardenError::not_found(format!("pool {}", self.pool_id)));
        }

        for slot in inv.subnets.iter_mut() {
            if let Some(addr) = slot.take_next() {
                return Ok(addr);
            }
        }
        for (addr, slot) in inv.standalone.iter_mut() {
            if !slot.allocated && !slot.draining {
                slot.allocated = true;
                return Ok(*addr);
            }
        }

        Err(WardenError::PoolExhausted {
            pool: self.pool_id.clone(),
        })
    }

    /// Reserve a specific address, used when restoring persisted mappings.
    pub fn reserve_specific(&self, addr: Ipv4Addr) -> WardenResult<()> {
        let mut inv = self.inventory.lock();
        if let Some(slot) = inv.standalone.get_mut(&addr) {
            if slot.allocated {
                return Err(WardenError::in_use(format!("address {}", addr)));
            }
            slot.allocated = true;
            return Ok(());
        }

        for slot in inv.subnets.iter_mut() {
            if !slot.space.is_allocatable(addr) {
                continue;
            }
            let offset = slot
                .space
                .offset_of(addr)
                .ok_or_else(|| WardenError::inconsistency(format!("{} has no offset", addr)))?;
            if !slot.take(offset) {
                return Err(WardenError::in_use(format!("address {}", addr)));
            }
            return Ok(());
        }

        Err(WardenError::invalid_address(
            addr.to_string(),
            format!("not allocatable from pool {}", self.pool_id),
        ))
    }

    /// Return a reserved address to the free set.
    pub fn release(&self, addr: Ipv4Addr) -> WardenResult<()> {
        let mut inv = self.inventory.lock();
        let not_allocated = || WardenError::NotAllocated {
            address: addr,
            pool_id: self.pool_id.clone(),
        };

        if let Some(slot) = inv.standalone.get_mut(&addr) {
            if !slot.allocated {
                return Err(not_allocated());
            }
            slot.allocated = false;
            return Ok(());
        }

        for slot in inv.subnets.iter_mut() {
            if let Some(offset) = slot.space.offset_of(addr) {
                if slot.give_back(offset) {
                    return Ok(());
                }
                return Err(not_allocated());
            }
        }
        Err(not_allocated())
    }

    /// Check if an address is currently reserved.
    pub fn is_allocated(&self, addr: Ipv4Addr) -> bool {
        let inv = self.inventory.lock();
        if let Some(slot) = inv.standalone.get(&addr) {
            return slot.allocated;
        }
        inv.subnets.iter().any(|slot| {
            slot.space
                .offset_of(addr)
                .is_some_and(|offset| slot.allocated.contains(&offset))
        })
    }

    /// `(free, total)` at this instant.
    pub fn counts(&self) -> (u64, u64) {
        self.inventory.lock().counts()
    }

    /// Number of reserved addresses.
    pub fn allocated_count(&self) -> usize {
        self.inventory.lock().allocated_count()
    }

    /// Snapshot of the pool's ranges and counts.
    pub fn snapshot(&self, id: &str, name: &str) -> PoolSnapshot {
        let inv = self.inventory.lock();
        let (free, total) = inv.counts();
        PoolSnapshot {
            id: id.to_string(),
            name: name.to_string(),
            free,
            total,
            subnets: inv
                .subnets
                .iter()
                .filter(|s| !s.draining)
                .map(|s| SubnetSnapshot {
                    id: s.space.id().to_string(),
                    cidr: s.space.cidr(),
                    free: s.free(),
                    total: s.space.total(),
                })
                .collect(),
            addresses: inv
                .standalone
                .iter()
                .filter(|(_, s)| !s.draining)
                .map(|(addr, s)| AddressSnapshot {
                    id: s.id.clone(),
                    address: *addr,
                    allocated: s.allocated,
                })
                .collect(),
        }
    }

    /// Ranges owned by the pool (pending removals included) and the record version.
    pub fn layout(&self) -> (Vec<AddressSpace>, Vec<AddressRecord>, u64) {
        let inv = self.inventory.lock();
        (
            inv.subnets.iter().map(|s| s.space.clone()).collect(),
            inv.standalone
                .iter()
                .map(|(addr, s)| AddressRecord {
                    id: s.id.clone(),
                    address: *addr,
                })
                .collect(),
            inv.version,
        )
    }

    /// Describe the range owning `addr`, if any.
    pub fn owner_of(&self, addr: Ipv4Addr) -> Option<String> {
        let inv = self.inventory.lock();
        if inv.standalone.contains_key(&addr) {
            return Some(addr.to_string());
        }
        inv.subnets
            .iter()
            .find(|s| s.space.contains(addr))
            .map(|s| s.space.cidr().to_string())
    }

    /// Describe the first owned range intersecting `net`, if any.
    pub fn overlapping(&self, net: &Ipv4Net) -> Option<String> {
        let inv = self.inventory.lock();
        if let Some(slot) = inv.subnets.iter().find(|s| s.space.overlaps(net)) {
            return Some(slot.space.cidr().to_string());
        }
        inv.standalone
            .keys()
            .find(|addr| net.contains(*addr))
            .map(|addr| addr.to_string())
    }

    // ------------------------------------------------------------------
    // Structural changes, driven by the registry's two-phase protocol.
    // ------------------------------------------------------------------

    /// Add ranges that have already been persisted at `version`.
    pub fn apply_additions(&self, subnets: Vec<AddressSpace>, addresses: Vec<AddressRecord>, version: u64) {
        let mut inv = self.inventory.lock();
        inv.subnets.extend(subnets.into_iter().map(SubnetSlot::new));
        for a in addresses {
            inv.standalone.insert(
                a.address,
                StandaloneSlot {
                    id: a.id,
                    allocated: false,
                    draining: false,
                },
            );
        }
        inv.version = version;
    }

    /// Withdraw a range from allocation ahead of removing it.
    ///
    /// Fails with `InUse` if any of its addresses is reserved.
    pub fn begin_removal(&self, target: &RangeRef) -> WardenResult<()> {
        let mut inv = self.inventory.lock();
        match target {
            RangeRef::Subnet(id) => {
                let slot = inv
                    .subnets
                    .iter_mut()
                    .find(|s| s.space.id() == id && !s.draining)
                    .ok_or_else(|| WardenError::not_found(format!("subnet {}", id)))?;
                if !slot.allocated.is_empty() {
                    return Err(WardenError::in_use(format!(
                        "subnet {} has {} mapped addresses",
                        slot.space.cidr(),
                        slot.allocated.len()
                    )));
                }
                slot.draining = true;
            }
            RangeRef::Address(id) => {
                let (addr, slot) = inv
                    .standalone
                    .iter_mut()
                    .find(|(_, s)| s.id == *id && !s.draining)
                    .ok_or_else(|| WardenError::not_found(format!("address {}", id)))?;
                if slot.allocated {
                    return Err(WardenError::in_use(format!("address {} is mapped", addr)));
                }
                slot.draining = true;
            }
        }
        Ok(())
    }

    /// Put a withdrawn range back into service.
    pub fn abort_removal(&self, target: &RangeRef) {
        let mut inv = self.inventory.lock();
        match target {
            RangeRef::Subnet(id) => {
                if let Some(slot) = inv.subnets.iter_mut().find(|s| s.space.id() == id) {
                    slot.draining = false;
                }
            }
            RangeRef::Address(id) => {
                if let Some(slot) = inv.standalone.values_mut().find(|s| s.id == *id) {
                    slot.draining = false;
                }
            }
        }
    }

    /// Drop a withdrawn range once its removal is persisted at `version`.
    pub fn finish_removal(&self, target: &RangeRef, version: u64) {
        let mut inv = self.inventory.lock();
        match target {
            RangeRef::Subnet(id) => inv.subnets.retain(|s| s.space.id() != id),
            RangeRef::Address(id) => inv.standalone.retain(|_, s| s.id != *id),
        }
        inv.version = version;
    }

    /// Stop all future reservations ahead of deleting the pool.
    ///
    /// Fails with `PoolInUse` while any address is reserved.
    pub fn begin_retire(&self) -> WardenResult<u64> {
        let mut inv = self.inventory.lock();
        if inv.retired {
            return Err(WardenError::not_found(format!("pool {}", self.pool_id)));
        }
        let mapped = inv.allocated_count();
        if mapped > 0 {
            return Err(WardenError::PoolInUse {
                pool_id: self.pool_id.clone(),
                mapped,
            });
        }
        inv.retired = true;
        Ok(inv.version)
    }

    /// Undo [`Allocator::begin_retire`].
    pub fn abort_retire(&self) {
        self.inventory.lock().retired = false;
    }
}
