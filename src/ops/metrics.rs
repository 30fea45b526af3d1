//! Metrics.
//!
//! Metrics namespaces:
//! - warden.alloc.*
//! - warden.quota.*
//! - warden.pool.*
//! - warden.request.*

use crate::core::error::ErrorKind;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Metric names.
pub mod names {
    /// Addresses handed out.
    pub const ALLOC_RESERVED_TOTAL: &str = "warden.alloc.reserved_total";
    /// Addresses returned to their pool.
    pub const ALLOC_RELEASED_TOTAL: &str = "warden.alloc.released_total";
    /// Reservations refused because no pool had capacity.
    pub const ALLOC_EXHAUSTED_TOTAL: &str = "warden.alloc.exhausted_total";
    /// Mapping attempts rolled back after a partial reservation.
    pub const ALLOC_ROLLBACK_TOTAL: &str = "warden.alloc.rollback_total";
    /// Admissions refused by a quota.
    pub const QUOTA_REJECTED_TOTAL: &str = "warden.quota.rejected_total";
    /// Number of pools.
    pub const POOL_COUNT: &str = "warden.pool.count";
    /// Number of live mappings.
    pub const MAPPING_COUNT: &str = "warden.mapping.count";
    /// Inconsistencies confirmed by the consistency audit.
    pub const AUDIT_INCONSISTENCIES_TOTAL: &str = "warden.audit.inconsistencies_total";
}

/// Metrics registry.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: RwLock<HashMap<String, AtomicU64>>,
    gauges: RwLock<HashMap<String, AtomicU64>>,
    histograms: RwLock<HashMap<String, HistogramData>>,
}

impl MetricsRegistry {
    /// Create a new metrics registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter.
    pub fn counter_inc(&self, name: &str) {
        self.counter_add(name, 1);
    }

    /// Add to a counter.
    pub fn counter_add(&self, name: &str, value: u64) {
        if let Some(counter) = self.counters.read().get(name) {
            counter.fetch_add(value, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    /// Get counter value.
    pub fn counter_get(&self, name: &str) -> u64 {
        self.counters
            .read()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Set a gauge value.
    pub fn gauge_set(&self, name: &str, value: u64) {
        if let Some(gauge) = self.gauges.read().get(name) {
            gauge.store(value, Ordering::Relaxed);
            return;
        }
        self.gauges
            .write()
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(value, Ordering::Relaxed);
    }

    /// Get gauge value.
    pub fn gauge_get(&self, name: &str) -> u64 {
        self.gauges
            .read()
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Drop gauges whose name starts with `prefix`.
    pub fn gauge_clear_prefix(&self, prefix: &str) {
        self.gauges.write().retain(|name, _| !name.starts_with(prefix));
    }

    /// Record a histogram observation.
    pub fn histogram_observe(&self, name: &str, value: f64) {
        self.histograms
            .write()
            .entry(name.to_string())
            .or_insert_with(HistogramData::new)
            .observe(value);
    }

    /// Get histogram data.
    pub fn histogram_get(&self, name: &str) -> Option<HistogramSnapshot> {
        self.histograms.read().get(name).map(|h| h.snapshot())
    }

    /// Export metrics in Prometheus text format, sorted by name.
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        let counters = self.counters.read();
        let mut names: Vec<_> = counters.keys().collect();
        names.sort();
        for name in names {
            let prometheus_name = prometheus_name(name);
            output.push_str(&format!(
                "# TYPE {} counter\n{} {}\n",
                prometheus_name,
                prometheus_name,
                counters[name].load(Ordering::Relaxed)
            ));
        }

        let gauges = self.gauges.read();
        let mut names: Vec<_> = gauges.keys().collect();
        names.sort();
        for name in names {
            let prometheus_name = prometheus_name(name);
            output.push_str(&format!(
                "# TYPE {} gauge\n{} {}\n",
                prometheus_name,
                prometheus_name,
                gauges[name].load(Ordering::Relaxed)
            ));
        }

        let histograms = self.histograms.read();
        let mut names: Vec<_> = histograms.keys().collect();
        names.sort();
        for name in names {
            let prometheus_name = prometheus_name(name);
            let snapshot = histograms[name].snapshot();
            output.push_str(&format!(
                "# TYPE {} histogram\n{}_count {}\n{}_sum {}\n",
                prometheus_name, prometheus_name, snapshot.count, prometheus_name, snapshot.sum
            ));
        }

        output
    }
}

fn prometheus_name(name: &str) -> String {
    name.replace(['.', '-'], "_")
}

/// Histogram data storage.
#[derive(Debug)]
struct HistogramData {
    count: AtomicU64,
    stats: Mutex<(f64, f64, f64)>,
}

impl HistogramData {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            stats: Mutex::new((0.0, f64::MAX, f64::MIN)),
        }
    }

    fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let mut stats = self.stats.lock();
        stats.0 += value;
        stats.1 = stats.1.min(value);
        stats.2 = stats.2.max(value);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let (sum, min, max) = *self.stats.lock();
        HistogramSnapshot {
            count: self.count.load(Ordering::Relaxed),
            sum,
            min,
            max,
        }
    }
}

/// Histogram snapshot.
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl HistogramSnapshot {
    /// Calculate mean.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Warden metrics collector.
#[derive(Debug, Default)]
pub struct WardenMetrics {
    registry: MetricsRegistry,
}

impl WardenMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the underlying registry.
    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    // === Requests ===

    /// Record a completed service call.
    pub fn record_request(&self, operation: &str, latency_ms: f64, error: Option<ErrorKind>) {
        self.registry
            .counter_inc(&format!("warden.request.total.{}", operation));
        self.registry
            .histogram_observe(&format!("warden.request.latency_ms.{}", operation), latency_ms);
        if let Some(kind) = error {
            self.registry
                .counter_inc(&format!("warden.request.errors.{}", kind.as_str()));
        }
    }

    // === Allocation ===

    /// Record an address handed out.
    pub fn record_reserved(&self) {
        self.registry.counter_inc(names::ALLOC_RESERVED_TOTAL);
    }

    /// Record an address returned.
    pub fn record_released(&self) {
        self.registry.counter_inc(names::ALLOC_RELEASED_TOTAL);
    }

    /// Record a refused reservation.
    pub fn record_exhausted(&self) {
        self.registry.counter_inc(names::ALLOC_EXHAUSTED_TOTAL);
    }

    /// Record a rolled back mapping attempt.
    pub fn record_rollback(&self) {
        self.registry.counter_inc(names::ALLOC_ROLLBACK_TOTAL);
    }

    // === Quotas ===

    /// Record a quota rejection.
    pub fn record_quota_rejection(&self, tenant_id: &str, quota: &str) {
        self.registry.counter_inc(names::QUOTA_REJECTED_TOTAL);
        self.registry
            .counter_inc(&format!("warden.quota.rejected.{}.{}", tenant_id, quota));
    }

    // === Inventory ===

    /// Update per-pool gauges.
    pub fn set_pool_counts(&self, pool_id: &str, free: u64, total: u64) {
        self.registry
            .gauge_set(&format!("warden.pool.{}.free", pool_id), free);
        self.registry
            .gauge_set(&format!("warden.pool.{}.total", pool_id), total);
    }

    /// Replace all inventory gauges.
    pub fn reset_inventory(&self, pools: u64, mappings: u64) {
        self.registry.gauge_clear_prefix("warden.pool.");
        self.registry.gauge_set(names::POOL_COUNT, pools);
        self.registry.gauge_set(names::MAPPING_COUNT, mappings);
    }

    /// Record inconsistencies confirmed by an audit sweep.
    pub fn record_inconsistencies(&self, count: u64) {
        self.registry
            .counter_add(names::AUDIT_INCONSISTENCIES_TOTAL, count);
    }

    /// Export all metrics.
    pub fn export(&self) -> String {
        self.registry.export_prometheus()
    }
}
