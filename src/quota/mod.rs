//! Tenant quotas.
//!
//! - [`limit`] - Limit values, quota details and durable limit records
//! - [`ledger`] - Per-tenant usage accounting and admission
//!
//! A quota is either counted (usage is tracked against the limit) or
//! limit-only (names ending in `-limit`, checked per request value).

pub mod ledger;
pub mod limit;

pub use ledger::{QuotaLedger, QuotaPolicy};
pub use limit::{LimitRecord, QuotaDetails, QuotaKind, QuotaLimit, LIMIT_ONLY_SUFFIX, UNLIMITED_SENTINEL};

/// Default name of the quota counting a tenant's external addresses.
pub const EXTERNAL_IP_QUOTA: &str = "tenant-external-ips-quota";
