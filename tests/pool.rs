//! Pool, allocator and registry tests.

mod common;

use common::{registry, strings};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use warden::address::{AddressSpace, ReservationPolicy};
use warden::error::WardenError;
use warden::pool::{AddressRecord, Allocator, PoolRegistry, PoolSelector, RangeRef};
use warden::storage::{Collection, MemoryStore};

fn subnet(cidr: &str) -> AddressSpace {
    AddressSpace::parse(format!("subnet-{}", cidr), cidr, ReservationPolicy::default()).unwrap()
}

fn standalone(id: &str, addr: Ipv4Addr) -> AddressRecord {
    AddressRecord {
        id: id.to_string(),
        address: addr,
    }
}

// ============================================================================
// Allocator
// ============================================================================

#[test]
fn allocator_hands_out_addresses_in_order() {
    let allocator = Allocator::new("p1", vec![subnet("10.0.0.0/29")], vec![], 1);

    assert_eq!(allocator.reserve().unwrap(), Ipv4Addr::new(10, 0, 0, 1));
    assert_eq!(allocator.reserve().unwrap(), Ipv4Addr::new(10, 0, 0, 2));
    assert_eq!(allocator.counts(), (4, 6));
    assert_eq!(allocator.allocated_count(), 2);
}

#[test]
fn allocator_does_not_reuse_released_address_immediately() {
    let allocator = Allocator::new("p1", vec![subnet("10.0.0.0/29")], vec![], 1);

    let first = allocator.reserve().unwrap();
    allocator.release(first).unwrap();
    let second = allocator.reserve().unwrap();

    assert_ne!(first, second);
    assert_eq!(second, Ipv4Addr::new(10, 0, 0, 2));
}

#[test]
fn allocator_wraps_to_released_addresses() {
    let allocator = Allocator::new("p1", vec![subnet("10.0.0.0/29")], vec![], 1);
    for _ in 0..6 {
        allocator.reserve().unwrap();
    }

    allocator.release(Ipv4Addr::new(10, 0, 0, 3)).unwrap();
    assert_eq!(allocator.reserve().unwrap(), Ipv4Addr::new(10, 0, 0, 3));
}

#[test]
fn allocator_finds_gaps_in_a_full_large_subnet() {
    let allocator = Allocator::new("p1", vec![subnet("10.0.0.0/16")], vec![], 1);
    for _ in 0..65534 {
        allocator.reserve().unwrap();
    }
    assert_eq!(allocator.counts(), (0, 65534));

    // Adjacent releases merge into one gap.
    for addr in [
        Ipv4Addr::new(10, 0, 200, 8),
        Ipv4Addr::new(10, 0, 0, 5),
        Ipv4Addr::new(10, 0, 200, 7),
    ] {
        allocator.release(addr).unwrap();
    }
    assert_eq!(allocator.counts(), (3, 65534));

    assert_eq!(allocator.reserve().unwrap(), Ipv4Addr::new(10, 0, 0, 5));
    assert_eq!(allocator.reserve().unwrap(), Ipv4Addr::new(10, 0, 200, 7));
    assert_eq!(allocator.reserve().unwrap(), Ipv4Addr::new(10, 0, 200, 8));
    assert!(matches!(
        allocator.reserve(),
        Err(WardenError::PoolExhausted { .. })
    ));
}

#[test]
fn allocator_exhaustion() {
    let allocator = Allocator::new("p1", vec![subnet("10.0.0.0/30")], vec![], 1);
    allocator.reserve().unwrap();
    allocator.reserve().unwrap();

    let err = allocator.reserve().unwrap_err();
    assert_eq!(
        err,
        WardenError::PoolExhausted {
            pool: "p1".to_string()
        }
    );
    assert_eq!(allocator.counts(), (0, 2));
}

#[test]
fn allocator_subnets_before_standalone_addresses() {
    let allocator = Allocator::new(
        "p1",
        vec![subnet("10.0.0.0/31")],
        vec![
            standalone("a2", Ipv4Addr::new(198, 51, 100, 9)),
            standalone("a1", Ipv4Addr::new(198, 51, 100, 7)),
        ],
        1,
    );

    let order: Vec<_> = (0..4).map(|_| allocator.reserve().unwrap()).collect();
    assert_eq!(
        order,
        vec![
            Ipv4Addr::new(10, 0, 0, 0),
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(198, 51, 100, 7),
            Ipv4Addr::new(198, 51, 100, 9),
        ]
    );
}

#[test]
fn allocator_release_of_unallocated_address() {
    let allocator = Allocator::new(
        "p1",
        vec![subnet("10.0.0.0/29")],
        vec![standalone("a1", Ipv4Addr::new(198, 51, 100, 7))],
        1,
    );

    for addr in [
        Ipv4Addr::new(10, 0, 0, 1),
        Ipv4Addr::new(198, 51, 100, 7),
        Ipv4Addr::new(192, 0, 2, 1),
    ] {
        let err = allocator.release(addr).unwrap_err();
        assert_eq!(
            err,
            WardenError::NotAllocated {
                address: addr,
                pool_id: "p1".to_string()
            }
        );
    }

    let addr = allocator.reserve().unwrap();
    allocator.release(addr).unwrap();
    assert!(matches!(
        allocator.release(addr),
        Err(WardenError::NotAllocated { .. })
    ));
}

#[test]
fn allocator_reserve_specific() {
    let allocator = Allocator::new("p1", vec![subnet("10.0.0.0/29")], vec![], 1);
    let addr = Ipv4Addr::new(10, 0, 0, 4);

    allocator.reserve_specific(addr).unwrap();
    assert!(allocator.is_allocated(addr));
    assert!(matches!(
        allocator.reserve_specific(addr),
        Err(WardenError::InUse { .. })
    ));
    assert!(matches!(
        allocator.reserve_specific(Ipv4Addr::new(10, 0, 0, 7)),
        Err(WardenError::InvalidAddress { .. })
    ));
}

#[test]
fn allocator_counts_always_sum_to_total() {
    let allocator = Arc::new(Allocator::new("p1", vec![subnet("10.0.0.0/26")], vec![], 1));

    std::thread::scope(|s| {
        for _ in 0..4 {
            let allocator = allocator.clone();
            s.spawn(move || {
                for _ in 0..200 {
                    if let Ok(addr) = allocator.reserve() {
                        allocator.release(addr).unwrap();
                    }
                }
            });
        }
        for _ in 0..200 {
            let (free, total) = allocator.counts();
            assert_eq!(total, 62);
            assert!(free <= total);
        }
    });

    assert_eq!(allocator.counts(), (62, 62));
}

// ============================================================================
// Registry lifecycle
// ============================================================================

#[test]
fn create_list_and_show_pool() {
    let registry = registry();

    let pool = registry
        .create_pool("testpool", Some("192.168.0.0/24"), &[])
        .unwrap();
    assert_eq!(pool.name, "testpool");
    assert_eq!(pool.free, 254);
    assert_eq!(pool.total, 254);
    assert_eq!(pool.subnets.len(), 1);
    assert_eq!(pool.subnets[0].cidr.to_string(), "192.168.0.0/24");

    let shown = registry.show_pool(&pool.id).unwrap();
    assert_eq!(shown, pool);
    assert_eq!(registry.list_pools(), vec![pool]);
}

#[test]
fn pools_are_listed_in_creation_order() {
    let registry = registry();
    for name in ["zeta", "alpha", "mid"] {
        registry.create_pool(name, None, &[]).unwrap();
    }

    let names: Vec<_> = registry.list_pools().into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["zeta", "alpha", "mid"]);
}

#[test]
fn empty_pool_has_no_capacity() {
    let registry = registry();
    let pool = registry.create_pool("empty", None, &[]).unwrap();

    assert_eq!((pool.free, pool.total), (0, 0));
    assert!(matches!(
        registry.reserve(&pool.id),
        Err(WardenError::PoolExhausted { .. })
    ));
}

#[test]
fn duplicate_pool_name_is_rejected() {
    let registry = registry();
    registry.create_pool("public", None, &[]).unwrap();

    let err = registry.create_pool("public", Some("10.0.0.0/24"), &[]).unwrap_err();
    assert_eq!(
        err,
        WardenError::DuplicateName {
            name: "public".to_string()
        }
    );
    assert_eq!(registry.list_pools().len(), 1);
}

#[test]
fn overlapping_subnet_is_rejected_on_create() {
    let registry = registry();
    registry
        .create_pool("a", Some("192.168.0.0/24"), &[])
        .unwrap();

    let err = registry
        .create_pool("b", Some("192.168.0.128/25"), &[])
        .unwrap_err();
    assert!(matches!(err, WardenError::InvalidSubnet { .. }));
    assert!(registry.pool_by_name("b").is_none());
}

#[test]
fn address_owned_by_another_pool_is_rejected_on_create() {
    let registry = registry();
    registry
        .create_pool("a", Some("192.168.0.0/24"), &strings(&["198.51.100.7"]))
        .unwrap();

    for addr in ["192.168.0.10", "198.51.100.7"] {
        let err = registry.create_pool("b", None, &strings(&[addr])).unwrap_err();
        assert!(matches!(err, WardenError::InvalidAddress { .. }), "{:?}", err);
    }
}

#[test]
fn overlapping_range_is_rejected_on_add() {
    let registry = registry();
    registry
        .create_pool("a", Some("192.168.0.0/24"), &[])
        .unwrap();
    let b = registry.create_pool("b", Some("10.0.0.0/24"), &[]).unwrap();

    let err = registry
        .add_subnet_or_addresses(&b.id, Some("192.168.0.0/16"), &[])
        .unwrap_err();
    match err {
        WardenError::Overlap {
            existing,
            pool_name,
            ..
        } => {
            assert_eq!(existing, "192.168.0.0/24");
            assert_eq!(pool_name, "a");
        }
        other => panic!("expected Overlap, got {:?}", other),
    }

    let err = registry
        .add_subnet_or_addresses(&b.id, None, &strings(&["10.0.0.5"]))
        .unwrap_err();
    assert!(matches!(err, WardenError::Overlap { .. }));
    assert_eq!(registry.show_pool(&b.id).unwrap().total, 254);
}

#[test]
fn request_address_inside_its_own_subnet_is_rejected() {
    let registry = registry();
    let err = registry
        .create_pool("a", Some("10.0.0.0/24"), &strings(&["10.0.0.9"]))
        .unwrap_err();
    match err {
        WardenError::Overlap { pool_name, .. } => assert_eq!(pool_name, "<request>"),
        other => panic!("expected Overlap, got {:?}", other),
    }
}

#[test]
fn address_listed_twice_is_rejected() {
    let registry = registry();
    let err = registry
        .create_pool("a", None, &strings(&["198.51.100.7", "198.51.100.7"]))
        .unwrap_err();
    assert!(matches!(err, WardenError::InvalidAddress { .. }));
}

#[test]
fn add_subnet_and_addresses() {
    let registry = registry();
    let pool = registry.create_pool("a", Some("10.0.0.0/29"), &[]).unwrap();

    registry
        .add_subnet_or_addresses(
            &pool.id,
            Some("10.0.1.0/29"),
            &strings(&["198.51.100.7", "198.51.100.8"]),
        )
        .unwrap();

    let shown = registry.show_pool(&pool.id).unwrap();
    assert_eq!(shown.total, 14);
    assert_eq!(shown.free, 14);
    assert_eq!(shown.subnets.len(), 2);
    assert_eq!(shown.addresses.len(), 2);

    // Nothing to add is a no-op.
    registry.add_subnet_or_addresses(&pool.id, None, &[]).unwrap();
    assert_eq!(registry.show_pool(&pool.id).unwrap().total, 14);
}

#[test]
fn add_to_missing_pool() {
    let registry = registry();
    let err = registry
        .add_subnet_or_addresses("nope", Some("10.0.0.0/24"), &[])
        .unwrap_err();
    assert!(matches!(err, WardenError::NotFound { .. }));
}

#[test]
fn remove_subnet_in_use_then_free() {
    let registry = registry();
    let pool = registry.create_pool("a", Some("10.0.0.0/29"), &[]).unwrap();
    let subnet_id = pool.subnets[0].id.clone();
    let addr = registry.reserve(&pool.id).unwrap();

    let err = registry.remove_subnet(&pool.id, &subnet_id).unwrap_err();
    assert!(matches!(err, WardenError::InUse { .. }));
    // The failed removal left the subnet in service.
    assert_eq!(registry.show_pool(&pool.id).unwrap().free, 5);

    registry.release(&pool.id, addr).unwrap();
    registry.remove_subnet(&pool.id, &subnet_id).unwrap();

    let shown = registry.show_pool(&pool.id).unwrap();
    assert_eq!((shown.free, shown.total), (0, 0));
    assert!(shown.subnets.is_empty());
    assert!(matches!(
        registry.remove_subnet(&pool.id, &subnet_id),
        Err(WardenError::NotFound { .. })
    ));
}

#[test]
fn remove_standalone_address() {
    let registry = registry();
    let pool = registry
        .create_pool("a", None, &strings(&["198.51.100.7"]))
        .unwrap();
    let address_id = pool.addresses[0].id.clone();

    let addr = registry.reserve(&pool.id).unwrap();
    assert_eq!(addr, Ipv4Addr::new(198, 51, 100, 7));
    assert!(matches!(
        registry.remove_range(&pool.id, &RangeRef::Address(address_id.clone())),
        Err(WardenError::InUse { .. })
    ));

    registry.release(&pool.id, addr).unwrap();
    registry.remove_address(&pool.id, &address_id).unwrap();
    assert_eq!(registry.show_pool(&pool.id).unwrap().total, 0);

    // The address can now join another pool.
    registry
        .create_pool("b", None, &strings(&["198.51.100.7"]))
        .unwrap();
}

#[test]
fn delete_pool_with_and_without_reservations() {
    let registry = registry();
    let pool = registry.create_pool("a", Some("10.0.0.0/29"), &[]).unwrap();
    let addr = registry.reserve(&pool.id).unwrap();

    let err = registry.delete_pool(&pool.id).unwrap_err();
    assert_eq!(
        err,
        WardenError::PoolInUse {
            pool_id: pool.id.clone(),
            mapped: 1
        }
    );
    // Still serving after the refused delete.
    registry.reserve(&pool.id).unwrap();

    registry.release(&pool.id, addr).unwrap();
    registry
        .release(&pool.id, Ipv4Addr::new(10, 0, 0, 2))
        .unwrap();
    registry.delete_pool(&pool.id).unwrap();

    assert!(matches!(
        registry.show_pool(&pool.id),
        Err(WardenError::NotFound { .. })
    ));
    assert!(matches!(
        registry.delete_pool(&pool.id),
        Err(WardenError::NotFound { .. })
    ));

    // Its name and subnet are free again.
    registry.create_pool("a", Some("10.0.0.0/29"), &[]).unwrap();
}

// ============================================================================
// Reservation
// ============================================================================

#[test]
fn testpool_reserves_every_address_once() {
    let registry = registry();
    let pool = registry
        .create_pool("testpool", Some("192.168.0.0/24"), &[])
        .unwrap();

    let mut seen = HashSet::new();
    for _ in 0..254 {
        let addr = registry.reserve(&pool.id).unwrap();
        assert!(seen.insert(addr), "{} handed out twice", addr);
    }
    assert!(!seen.contains(&Ipv4Addr::new(192, 168, 0, 0)));
    assert!(!seen.contains(&Ipv4Addr::new(192, 168, 0, 255)));

    assert!(matches!(
        registry.reserve(&pool.id),
        Err(WardenError::PoolExhausted { .. })
    ));
    assert_eq!(registry.show_pool(&pool.id).unwrap().free, 0);

    let addr = Ipv4Addr::new(192, 168, 0, 77);
    registry.release(&pool.id, addr).unwrap();
    assert_eq!(registry.show_pool(&pool.id).unwrap().free, 1);
    assert_eq!(registry.reserve(&pool.id).unwrap(), addr);
}

#[test]
fn concurrent_reservations_are_unique() {
    let registry = registry();
    let pool = registry
        .create_pool("testpool", Some("192.168.0.0/24"), &[])
        .unwrap();

    let handed_out: Vec<Ipv4Addr> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    let mut mine = Vec::new();
                    loop {
                        match registry.reserve(&pool.id) {
                            Ok(addr) => mine.push(addr),
                            Err(WardenError::PoolExhausted { .. }) => break mine,
                            Err(e) => panic!("unexpected error: {:?}", e),
                        }
                    }
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect()
    });

    let unique: HashSet<_> = handed_out.iter().collect();
    assert_eq!(handed_out.len(), 254);
    assert_eq!(unique.len(), 254);
    assert!(matches!(
        registry.reserve(&pool.id),
        Err(WardenError::PoolExhausted { .. })
    ));
}

#[test]
fn select_by_id() {
    let registry = registry();
    let pool = registry.create_pool("a", Some("10.0.0.0/30"), &[]).unwrap();

    let (chosen, addr) = registry
        .select_and_reserve(&PoolSelector::Id(pool.id.clone()))
        .unwrap();
    assert_eq!(chosen.id(), pool.id);
    assert_eq!(addr, Ipv4Addr::new(10, 0, 0, 1));

    registry
        .select_and_reserve(&PoolSelector::Id(pool.id.clone()))
        .unwrap();
    assert_eq!(
        registry
            .select_and_reserve(&PoolSelector::Id(pool.id.clone()))
            .unwrap_err(),
        WardenError::PoolExhausted {
            pool: pool.id.clone()
        }
    );
    assert!(matches!(
        registry.select_and_reserve(&PoolSelector::Id("missing".to_string())),
        Err(WardenError::NotFound { .. })
    ));
}

#[test]
fn select_any_falls_through_to_next_pool() {
    let registry = registry();
    let small = registry
        .create_pool("small", None, &strings(&["198.51.100.7"]))
        .unwrap();
    let big = registry.create_pool("big", Some("10.0.0.0/29"), &[]).unwrap();

    let (first, _) = registry.select_and_reserve(&PoolSelector::Any).unwrap();
    let (second, _) = registry.select_and_reserve(&PoolSelector::Any).unwrap();
    assert_eq!(first.id(), small.id);
    assert_eq!(second.id(), big.id);
}

#[test]
fn select_by_name() {
    let registry = registry();
    registry.create_pool("a", Some("10.0.0.0/30"), &[]).unwrap();
    let b = registry.create_pool("b", Some("10.0.1.0/30"), &[]).unwrap();

    let (chosen, addr) = registry
        .select_and_reserve(&PoolSelector::from_name(Some("b")))
        .unwrap();
    assert_eq!(chosen.id(), b.id);
    assert_eq!(addr, Ipv4Addr::new(10, 0, 1, 1));

    assert!(matches!(
        registry.select_and_reserve(&PoolSelector::Name("missing".to_string())),
        Err(WardenError::NotFound { .. })
    ));
}

#[test]
fn select_any_without_capacity() {
    let registry = registry();
    assert_eq!(
        registry.select_and_reserve(&PoolSelector::Any).unwrap_err(),
        WardenError::PoolExhausted {
            pool: "any".to_string()
        }
    );

    registry.create_pool("empty", None, &[]).unwrap();
    assert_eq!(
        registry.select_and_reserve(&PoolSelector::Any).unwrap_err(),
        WardenError::PoolExhausted {
            pool: "any".to_string()
        }
    );
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn registry_restores_pools_from_store() {
    let store = Arc::new(MemoryStore::new());
    let first = PoolRegistry::new(store.clone(), ReservationPolicy::default());
    let a = first
        .create_pool("a", Some("10.0.0.0/29"), &strings(&["198.51.100.7"]))
        .unwrap();
    first.create_pool("b", Some("10.0.1.0/29"), &[]).unwrap();
    assert_eq!(store.len(Collection::Pools), 2);

    let second = PoolRegistry::new(store.clone(), ReservationPolicy::default());
    assert_eq!(second.restore().unwrap(), 2);
    assert_eq!(second.show_pool(&a.id).unwrap(), a);

    // Restored ordinals keep creation order for new pools.
    second.create_pool("c", None, &[]).unwrap();
    let names: Vec<_> = second.list_pools().into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["a", "b", "c"]);

    // Restored ranges still claim their addresses.
    assert!(second.create_pool("d", Some("10.0.0.0/24"), &[]).is_err());
}

#[test]
fn removals_are_persisted() {
    let store = Arc::new(MemoryStore::new());
    let first = PoolRegistry::new(store.clone(), ReservationPolicy::default());
    let pool = first
        .create_pool("a", Some("10.0.0.0/29"), &strings(&["198.51.100.7"]))
        .unwrap();
    first
        .remove_subnet(&pool.id, &pool.subnets[0].id)
        .unwrap();

    let second = PoolRegistry::new(store, ReservationPolicy::default());
    second.restore().unwrap();
    let shown = second.show_pool(&pool.id).unwrap();
    assert!(shown.subnets.is_empty());
    assert_eq!(shown.total, 1);
}
