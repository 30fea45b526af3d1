//! Storage tests.

mod common;

use common::{internal, store_path, strings, temp_test_dir};
use std::sync::Arc;
use warden::error::WardenError;
use warden::mapping::{MapRequest, MappedIp, NoInstances};
use warden::quota::{QuotaDetails, QuotaLimit, EXTERNAL_IP_QUOTA};
use warden::service::{AddressService, Controller, ControllerOptions, RestoreSummary};
use warden::storage::{decode, encode, Collection, EntityStore, FileStore, MemoryStore};

fn bytes(text: &str) -> Option<Vec<u8>> {
    Some(text.as_bytes().to_vec())
}

fn file_controller(path: &std::path::Path) -> Controller {
    let store = FileStore::open(path).unwrap();
    Controller::new(Arc::new(store), Arc::new(NoInstances), ControllerOptions::default())
}

// ============================================================================
// Compare-and-swap
// ============================================================================

fn check_cas_semantics(store: &dyn EntityStore) {
    let v1 = store
        .compare_and_swap(Collection::Pools, "p1", None, bytes("one"))
        .unwrap();
    assert!(v1 > 0);

    // Create requires absence.
    let err = store
        .compare_and_swap(Collection::Pools, "p1", None, bytes("again"))
        .unwrap_err();
    assert!(matches!(
        err,
        WardenError::Conflict {
            expected: None,
            found: Some(v),
            ..
        } if v == v1
    ));

    // Update requires the current version.
    let v2 = store
        .compare_and_swap(Collection::Pools, "p1", Some(v1), bytes("two"))
        .unwrap();
    assert!(v2 > v1);
    assert!(store
        .compare_and_swap(Collection::Pools, "p1", Some(v1), bytes("stale"))
        .is_err());
    let current = store.get(Collection::Pools, "p1").unwrap().unwrap();
    assert_eq!(current.version, v2);
    assert_eq!(current.value, b"two".to_vec());

    // Delete returns 0 and a re-created key never reuses a version.
    assert_eq!(
        store
            .compare_and_swap(Collection::Pools, "p1", Some(v2), None)
            .unwrap(),
        0
    );
    assert!(store.get(Collection::Pools, "p1").unwrap().is_none());
    let v3 = store
        .compare_and_swap(Collection::Pools, "p1", None, bytes("three"))
        .unwrap();
    assert!(v3 > v2);

    // Deleting something absent is a conflict.
    assert!(matches!(
        store.compare_and_swap(Collection::Pools, "ghost", Some(1), None),
        Err(WardenError::Conflict { found: None, .. })
    ));
}

#[test]
fn memory_store_cas() {
    check_cas_semantics(&MemoryStore::new());
}

#[test]
fn file_store_cas() {
    let dir = temp_test_dir();
    check_cas_semantics(&FileStore::open(store_path(&dir)).unwrap());
}

#[test]
fn collections_are_separate_and_ordered() {
    let store = MemoryStore::new();
    for key in ["b", "c", "a"] {
        store
            .compare_and_swap(Collection::Mappings, key, None, bytes(key))
            .unwrap();
    }
    store
        .compare_and_swap(Collection::Pools, "a", None, bytes("pool"))
        .unwrap();

    let keys: Vec<_> = store
        .list(Collection::Mappings)
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec!["a", "b", "c"]);
    assert_eq!(store.len(Collection::Pools), 1);
    assert!(store.is_empty(Collection::QuotaLimits));
}

#[test]
fn entity_encoding() {
    let mapping = MappedIp {
        id: "m1".to_string(),
        external_ip: "203.0.113.5".parse().unwrap(),
        internal_ip: internal(9),
        tenant_id: "t1".to_string(),
        instance_id: "i1".to_string(),
        pool_id: "p1".to_string(),
        pool_name: "public".to_string(),
    };
    let decoded: MappedIp = decode(&encode(&mapping).unwrap()).unwrap();
    assert_eq!(decoded, mapping);

    assert!(matches!(
        decode::<MappedIp>(b"\x01"),
        Err(WardenError::Storage { .. })
    ));
}

// ============================================================================
// File store
// ============================================================================

#[test]
fn file_store_survives_reopen() {
    let dir = temp_test_dir();
    let path = store_path(&dir);

    let last = {
        let store = FileStore::open(&path).unwrap();
        store
            .compare_and_swap(Collection::Pools, "p1", None, bytes("one"))
            .unwrap();
        store
            .compare_and_swap(Collection::QuotaLimits, "t1/cores", None, bytes("4"))
            .unwrap()
    };
    assert!(path.exists());

    let store = FileStore::open(&path).unwrap();
    assert_eq!(store.path(), path.as_path());
    let pool = store.get(Collection::Pools, "p1").unwrap().unwrap();
    assert_eq!(pool.value, b"one".to_vec());
    assert_eq!(store.list(Collection::QuotaLimits).unwrap().len(), 1);

    let next = store
        .compare_and_swap(Collection::Pools, "p2", None, bytes("two"))
        .unwrap();
    assert!(next > last);
}

#[test]
fn corrupt_snapshot_is_rejected() {
    let dir = temp_test_dir();
    let path = dir.path().join("warden.db");
    std::fs::write(&path, b"definitely not a snapshot").unwrap();

    let err = FileStore::open(&path).unwrap_err();
    assert!(matches!(err, WardenError::Storage { .. }));
}

// ============================================================================
// Controller restore
// ============================================================================

#[test]
fn controller_restores_state_from_file() {
    let dir = temp_test_dir();
    let path = store_path(&dir);

    let (pool_id, mapped) = {
        let controller = file_controller(&path);
        let pool = controller
            .add_pool("public", Some("10.0.0.0/29"), &strings(&["198.51.100.7"]))
            .unwrap();
        controller
            .update_quotas(
                "t1",
                &[QuotaDetails::limit(EXTERNAL_IP_QUOTA, QuotaLimit::Finite(3))],
            )
            .unwrap();
        let a = controller
            .map_address(&MapRequest::new("t1", "i1").internal_ip(internal(1)))
            .unwrap();
        let b = controller
            .map_address(&MapRequest::new("t1", "i2").internal_ip(internal(2)))
            .unwrap();
        (pool.id, vec![a, b])
    };

    let controller = file_controller(&path);
    assert_eq!(
        controller.restore().unwrap(),
        RestoreSummary {
            pools: 1,
            limits: 1,
            mappings: 2,
        }
    );

    let pool = controller.show_pool(&pool_id).unwrap();
    assert_eq!((pool.free, pool.total), (5, 7));
    assert_eq!(controller.list_mapped_addresses(None).unwrap(), mapped);
    assert_eq!(controller.ledger().usage("t1", EXTERNAL_IP_QUOTA), 2);
    assert_eq!(
        controller.ledger().limit("t1", EXTERNAL_IP_QUOTA),
        QuotaLimit::Finite(3)
    );

    // Restored mappings keep their addresses and their quota charge.
    let third = controller
        .map_address(&MapRequest::new("t1", "i3").internal_ip(internal(3)))
        .unwrap();
    assert!(mapped.iter().all(|m| m.external_ip != third.external_ip));
    assert!(matches!(
        controller.map_address(&MapRequest::new("t1", "i4").internal_ip(internal(4))),
        Err(WardenError::QuotaExceeded { .. })
    ));
    assert!(matches!(
        controller.map_address(&MapRequest::new("t1", "i1").internal_ip(internal(1))),
        Err(WardenError::InUse { .. })
    ));
}

#[test]
fn restore_rejects_mapping_without_pool() {
    let store = Arc::new(MemoryStore::new());
    let orphan = MappedIp {
        id: "m1".to_string(),
        external_ip: "203.0.113.5".parse().unwrap(),
        internal_ip: internal(1),
        tenant_id: "t1".to_string(),
        instance_id: "i1".to_string(),
        pool_id: "gone".to_string(),
        pool_name: "gone".to_string(),
    };
    store
        .compare_and_swap(
            Collection::Mappings,
            "203.0.113.5",
            None,
            Some(encode(&orphan).unwrap()),
        )
        .unwrap();

    let controller = Controller::new(store, Arc::new(NoInstances), ControllerOptions::default());
    assert!(matches!(
        controller.restore(),
        Err(WardenError::InternalInconsistency { .. })
    ));
}
