//! CIDR address spaces.
//!
//! An [`AddressSpace`] is one subnet's worth of allocatable addresses: every
//! address inside the CIDR except the reserved offsets. With the default
//! policy a /24 yields 254 addresses:
//!
//! ```text
//! 192.168.0.0/24
//!   offset 0    192.168.0.0     network    (reserved)
//!   offset 1    192.168.0.1     first host (reserved only with reserve_gateway)
//!   ...
//!   offset 255  192.168.0.255   broadcast  (reserved)
//! ```
//!
//! /31 and /32 spaces are point-to-point and reserve nothing.
//!
//! Expansion is lazy: [`AddressSpace::addresses`] walks offsets on demand, so
//! a /8 never materializes sixteen million entries.

use crate::core::error::{WardenError, WardenResult};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// Which offsets of a subnet are withheld from allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationPolicy {
    /// Also reserve the first host address (network + 1).
    pub reserve_gateway: bool,
    /// Smallest accepted prefix length (largest accepted subnet).
    pub min_prefix_len: u8,
}

impl Default for ReservationPolicy {
    fn default() -> Self {
        Self {
            reserve_gateway: false,
            min_prefix_len: 8,
        }
    }
}

/// One subnet of individually allocatable addresses.
///
/// Immutable once created; a pool adds or removes whole spaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpace {
    id: String,
    cidr: Ipv4Net,
    reserved_offsets: BTreeSet<u32>,
}

impl AddressSpace {
    /// Parse a CIDR string into an address space.
    pub fn parse(id: impl Into<String>, cidr: &str, policy: ReservationPolicy) -> WardenResult<Self> {
        let net: Ipv4Net = cidr
            .trim()
            .parse()
            .map_err(|_| WardenError::invalid_subnet(cidr, "not an IPv4 CIDR"))?;
        Self::from_net(id, net, policy)
    }

    /// Build an address space from a parsed network.
    pub fn from_net(id: impl Into<String>, cidr: Ipv4Net, policy: ReservationPolicy) -> WardenResult<Self> {
        if cidr.addr() != cidr.network() {
            return Err(WardenError::invalid_subnet(
                cidr.to_string(),
                format!("host bits set, network is {}", cidr.trunc()),
            ));
        }
        if cidr.prefix_len() < policy.min_prefix_len {
            return Err(WardenError::invalid_subnet(
                cidr.to_string(),
                format!("prefix shorter than /{}", policy.min_prefix_len),
            ));
        }

        let size = 1u64 << (32 - u32::from(cidr.prefix_len()));
        let mut reserved_offsets = BTreeSet::new();
        if cidr.prefix_len() <= 30 {
            reserved_offsets.insert(0);
            reserved_offsets.insert((size - 1) as u32);
            if policy.reserve_gateway {
                reserved_offsets.insert(1);
            }
        }

        Ok(Self {
            id: id.into(),
            cidr,
            reserved_offsets,
        })
    }

    /// Subnet identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The network prefix.
    pub fn cidr(&self) -> Ipv4Net {
        self.cidr
    }

    /// Offsets withheld from allocation.
    pub fn reserved_offsets(&self) -> &BTreeSet<u32> {
        &self.reserved_offsets
    }

    /// Number of addresses covered by the prefix, reserved ones included.
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.cidr.prefix_len()))
    }

    /// Number of allocatable addresses.
    pub fn total(&self) -> u64 {
        self.size() - self.reserved_offsets.len() as u64
    }

    /// Check if an address falls inside the prefix.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.cidr.contains(&addr)
    }

    /// Offset of an address from the network address.
    pub fn offset_of(&self, addr: Ipv4Addr) -> Option<u32> {
        if !self.contains(addr) {
            return None;
        }
        Some(u32::from(addr) - u32::from(self.cidr.network()))
    }

    /// Address at the given offset.
    pub fn address_at(&self, offset: u32) -> Option<Ipv4Addr> {
        if u64::from(offset) >= self.size() {
            return None;
        }
        Some(Ipv4Addr::from(u32::from(self.cidr.network()) + offset))
    }

    /// Check if an address can be handed out from this space.
    pub fn is_allocatable(&self, addr: Ipv4Addr) -> bool {
        self.offset_of(addr)
            .is_some_and(|offset| !self.reserved_offsets.contains(&offset))
    }

    /// Check if another prefix intersects this one.
    pub fn overlaps(&self, other: &Ipv4Net) -> bool {
        self.cidr.contains(other) || other.contains(&self.cidr)
    }

    /// Lazily iterate the allocatable addresses in ascending order.
    pub fn addresses(&self) -> AddressIter<'_> {
        self.addresses_from(0)
    }

    /// Lazily iterate allocatable addresses starting at `offset`.
    pub fn addresses_from(&self, offset: u32) -> AddressIter<'_> {
        AddressIter {
            space: self,
            next: u64::from(offset),
        }
    }
}

/// Restartable iterator over the allocatable addresses of a space.
#[derive(Debug, Clone)]
pub struct AddressIter<'a> {
    space: &'a AddressSpace,
    next: u64,
}

impl AddressIter<'_> {
    /// Offset the iterator will examine next.
    pub fn position(&self) -> u64 {
        self.next
    }

    /// Rewind to the first address.
    pub fn restart(&mut self) {
        self.next = 0;
    }
}

impl Iterator for AddressIter<'_> {
    type Item = Ipv4Addr;

    fn next(&mut self) -> Option<Self::Item> {
        let size = self.space.size();
        while self.next < size {
            let offset = self.next as u32;
            self.next += 1;
            if !self.space.reserved_offsets.contains(&offset) {
                return self.space.address_at(offset);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let size = self.space.size();
        let remaining = size.saturating_sub(self.next);
        let reserved_ahead = self
            .space
            .reserved_offsets
            .iter()
            .filter(|o| u64::from(**o) >= self.next)
            .count() as u64;
        let exact = (remaining - reserved_ahead) as usize;
        (exact, Some(exact))
    }
}

/// Parse a standalone address.
///
/// Unspecified, broadcast, multicast and loopback addresses are rejected;
/// none of them is externally routable.
pub fn parse_address(text: &str) -> WardenResult<Ipv4Addr> {
    let addr: Ipv4Addr = text
        .trim()
        .parse()
        .map_err(|_| WardenError::invalid_address(text, "not an IPv4 address"))?;

    if addr.is_unspecified() || addr.is_broadcast() || addr.is_multicast() || addr.is_loopback() {
        return Err(WardenError::invalid_address(text, "not a routable unicast address"));
    }
    Ok(addr)
}
