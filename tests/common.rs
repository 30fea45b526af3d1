//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::NamedTempFile;
use warden::address::ReservationPolicy;
use warden::core::config::Config;
use warden::error::{WardenError, WardenResult};
use warden::mapping::{InstanceDirectory, NoInstances};
use warden::pool::PoolRegistry;
use warden::service::{Controller, ControllerOptions};
use warden::storage::{Collection, EntityStore, MemoryStore, Versioned};

/// Create a minimal valid configuration file.
pub fn create_minimal_config() -> NamedTempFile {
    write_config("[storage]\nbackend = \"memory\"\n")
}

/// Create a configuration with custom settings.
pub fn create_config_with_settings(
    backend: &str,
    log_level: &str,
    audit_interval_seconds: u64,
) -> NamedTempFile {
    let config_content = format!(
        r#"
[storage]
backend = "{}"
path = "/tmp/warden-test.db"

[telemetry]
log_level = "{}"

[runtime]
audit_interval_seconds = {}
"#,
        backend, log_level, audit_interval_seconds
    );
    write_config(&config_content)
}

/// Write configuration text to a temporary file.
pub fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Load config from a temp file.
pub fn load_config(file: &NamedTempFile) -> Config {
    Config::from_file(file.path()).expect("Failed to load config")
}

/// Create a temporary directory for test storage.
pub fn temp_test_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

/// Snapshot path inside a temp dir.
pub fn store_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("state").join("warden.db")
}

/// Pool registry over an empty memory store with the default policy.
pub fn registry() -> PoolRegistry {
    PoolRegistry::new(Arc::new(MemoryStore::new()), ReservationPolicy::default())
}

/// Controller over an empty memory store with default options.
pub fn controller() -> Controller {
    controller_with(Arc::new(MemoryStore::new()), Arc::new(NoInstances))
}

/// Controller over the given store and instance directory.
pub fn controller_with(store: Arc<dyn EntityStore>, directory: Arc<dyn InstanceDirectory>) -> Controller {
    Controller::new(store, directory, ControllerOptions::default())
}

/// Owned strings from literals.
pub fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// The `n`th internal address of a tenant network.
pub fn internal(n: u8) -> Ipv4Addr {
    Ipv4Addr::new(172, 16, 0, n)
}

/// Assert a result is Ok and return the value.
pub fn assert_ok<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
}

/// Assert a result is Err and return the error.
pub fn assert_err<T: std::fmt::Debug, E>(result: Result<T, E>) -> E {
    match result {
        Ok(v) => panic!("Expected Err, got Ok: {:?}", v),
        Err(e) => e,
    }
}

// ============================================================================
// Test doubles
// ============================================================================

/// Instance directory backed by a fixed table.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    instances: HashMap<String, Ipv4Addr>,
}

impl StaticDirectory {
    pub fn new(entries: &[(&str, Ipv4Addr)]) -> Self {
        Self {
            instances: entries
                .iter()
                .map(|(id, addr)| (id.to_string(), *addr))
                .collect(),
        }
    }
}

impl InstanceDirectory for StaticDirectory {
    fn internal_address(&self, instance_id: &str) -> Option<Ipv4Addr> {
        self.instances.get(instance_id).copied()
    }
}

/// Memory store whose writes to selected collections can be made to fail.
#[derive(Debug, Default)]
pub struct FailingStore {
    inner: MemoryStore,
    failing: Mutex<HashSet<Collection>>,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every subsequent write to `collection`.
    pub fn fail_writes(&self, collection: Collection) {
        self.failing.lock().insert(collection);
    }

    /// Let writes to every collection succeed again.
    pub fn heal(&self) {
        self.failing.lock().clear();
    }

    /// Entries currently stored in a collection.
    pub fn len(&self, collection: Collection) -> usize {
        self.inner.len(collection)
    }
}

impl EntityStore for FailingStore {
    fn get(&self, collection: Collection, key: &str) -> WardenResult<Option<Versioned>> {
        self.inner.get(collection, key)
    }

    fn list(&self, collection: Collection) -> WardenResult<Vec<(String, Versioned)>> {
        self.inner.list(collection)
    }

    fn compare_and_swap(
        &self,
        collection: Collection,
        key: &str,
        expected: Option<u64>,
        value: Option<Vec<u8>>,
    ) -> WardenResult<u64> {
        if self.failing.lock().contains(&collection) {
            return Err(WardenError::storage(format!(
                "injected write failure on {}/{}",
                collection, key
            )));
        }
        self.inner.compare_and_swap(collection, key, expected, value)
    }

    fn backend_name(&self) -> &'static str {
        "failing"
    }
}
