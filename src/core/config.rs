//! Configuration parsing and validation.
//!
//! Warden configuration is loaded from TOML files with CLI overrides.
//! Every section except `[storage]` has defaults.

use crate::address::{AddressSpace, ReservationPolicy};
use crate::quota::{QuotaLimit, QuotaPolicy, EXTERNAL_IP_QUOTA};
use crate::service::ControllerOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level Warden configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Persistence backend.
    pub storage: StorageConfig,

    /// Logging configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Address pool behaviour.
    #[serde(default)]
    pub pools: PoolsConfig,

    /// Quota policy.
    #[serde(default)]
    pub quotas: QuotasConfig,

    /// Background task timing.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Pools created at startup when absent.
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

/// Persistence backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend: "memory" or "file".
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Snapshot file for the file backend.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Address pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolsConfig {
    /// Also reserve the first host address (gateway) of every subnet.
    #[serde(default)]
    pub reserve_gateway: bool,

    /// Shortest accepted prefix length, i.e. the largest subnet.
    #[serde(default = "default_min_prefix_len")]
    pub min_prefix_len: u8,

    /// Attempts for operations that hit store version conflicts.
    #[serde(default = "default_cas_retries")]
    pub cas_retries: u32,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            reserve_gateway: false,
            min_prefix_len: default_min_prefix_len(),
            cas_retries: default_cas_retries(),
        }
    }
}

/// Quota configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotasConfig {
    /// Create quotas with unknown names on update instead of rejecting them.
    #[serde(default = "default_true")]
    pub allow_custom_names: bool,

    /// Quota charged for each mapped external address.
    #[serde(default = "default_external_ip_quota")]
    pub external_ip_quota: String,

    /// Limits for quotas a tenant has not configured.
    #[serde(default)]
    pub defaults: BTreeMap<String, QuotaLimit>,
}

impl Default for QuotasConfig {
    fn default() -> Self {
        Self {
            allow_custom_names: true,
            external_ip_quota: default_external_ip_quota(),
            defaults: BTreeMap::new(),
        }
    }
}

/// Background task configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Consistency audit period in seconds. 0 disables the audit.
    #[serde(default = "default_audit_interval_seconds")]
    pub audit_interval_seconds: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            audit_interval_seconds: default_audit_interval_seconds(),
        }
    }
}

/// Startup pools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub pools: Vec<BootstrapPool>,
}

/// A pool created at startup if no pool has its name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapPool {
    pub name: String,
    #[serde(default)]
    pub subnets: Vec<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
}

// Default value functions

fn default_backend() -> String {
    "memory".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_min_prefix_len() -> u8 {
    8
}

fn default_cas_retries() -> u32 {
    8
}

fn default_true() -> bool {
    true
}

fn default_external_ip_quota() -> String {
    EXTERNAL_IP_QUOTA.to_string()
}

fn default_audit_interval_seconds() -> u64 {
    60
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// In-memory configuration with all defaults.
    pub fn in_memory() -> Self {
        Self {
            storage: StorageConfig {
                backend: default_backend(),
                path: None,
            },
            telemetry: TelemetryConfig::default(),
            pools: PoolsConfig::default(),
            quotas: QuotasConfig::default(),
            runtime: RuntimeConfig::default(),
            bootstrap: BootstrapConfig::default(),
        }
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref path) = overrides.storage_path {
            self.storage.backend = "file".to_string();
            self.storage.path = Some(path.clone());
        }
        if let Some(seconds) = overrides.audit_interval_seconds {
            self.runtime.audit_interval_seconds = seconds;
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_storage()?;
        self.validate_telemetry()?;
        self.validate_pools()?;
        self.validate_quotas()?;
        self.validate_bootstrap()?;
        Ok(())
    }

    /// Address reservation policy for new subnets.
    pub fn reservation_policy(&self) -> ReservationPolicy {
        ReservationPolicy {
            reserve_gateway: self.pools.reserve_gateway,
            min_prefix_len: self.pools.min_prefix_len,
        }
    }

    /// Quota ledger policy.
    pub fn quota_policy(&self) -> QuotaPolicy {
        QuotaPolicy {
            allow_custom_names: self.quotas.allow_custom_names,
            defaults: self.quotas.defaults.clone(),
        }
    }

    /// Controller options derived from this configuration.
    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            reservation: self.reservation_policy(),
            quotas: self.quota_policy(),
            external_ip_quota: self.quotas.external_ip_quota.clone(),
            cas_retries: self.pools.cas_retries,
        }
    }

    fn validate_storage(&self) -> Result<()> {
        match self.storage.backend.as_str() {
            "memory" => Ok(()),
            "file" => {
                if self.storage.path.is_none() {
                    anyhow::bail!("storage.path required for the file backend");
                }
                Ok(())
            }
            other => anyhow::bail!("storage.backend must be 'memory' or 'file', got: {}", other),
        }
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }

    fn validate_pools(&self) -> Result<()> {
        if self.pools.min_prefix_len > 32 {
            anyhow::bail!(
                "pools.min_prefix_len must be within 0..=32, got: {}",
                self.pools.min_prefix_len
            );
        }
        if self.pools.cas_retries == 0 {
            anyhow::bail!("pools.cas_retries must be > 0");
        }
        Ok(())
    }

    fn validate_quotas(&self) -> Result<()> {
        if self.quotas.external_ip_quota.is_empty() {
            anyhow::bail!("quotas.external_ip_quota must not be empty");
        }
        if self.quotas.external_ip_quota.ends_with(crate::quota::LIMIT_ONLY_SUFFIX) {
            anyhow::bail!(
                "quotas.external_ip_quota must be a counted quota, got limit-only name: {}",
                self.quotas.external_ip_quota
            );
        }
        Ok(())
    }

    fn validate_bootstrap(&self) -> Result<()> {
        let policy = self.reservation_policy();
        let mut names = std::collections::HashSet::new();
        for pool in &self.bootstrap.pools {
            if pool.name.is_empty() {
                anyhow::bail!("bootstrap pool name must not be empty");
            }
            if !names.insert(pool.name.as_str()) {
                anyhow::bail!("bootstrap pool {} listed twice", pool.name);
            }
            for subnet in &pool.subnets {
                AddressSpace::parse("bootstrap", subnet, policy)
                    .with_context(|| format!("bootstrap pool {}", pool.name))?;
            }
            for address in &pool.addresses {
                crate::address::parse_address(address)
                    .with_context(|| format!("bootstrap pool {}", pool.name))?;
            }
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Use the file backend at this path.
    pub storage_path: Option<PathBuf>,
    /// Override the audit period.
    pub audit_interval_seconds: Option<u64>,
}
