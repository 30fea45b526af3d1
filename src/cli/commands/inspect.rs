//! Inspect command implementation.
//!
//! Reads a file-backed store the same way the runtime does at startup and
//! prints the restored state as JSON.

use crate::core::config::{Config, ConfigOverrides};
use crate::mapping::{LinkScope, NoInstances};
use crate::service::{AddressService, Controller};
use crate::storage::FileStore;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

/// Inspect stored state.
#[derive(Args, Debug)]
pub struct InspectArgs {
    #[command(subcommand)]
    pub command: InspectCommand,
}

/// Inspect subcommands.
#[derive(Subcommand, Debug)]
pub enum InspectCommand {
    /// List pools with free and total counts.
    Pools,
    /// List mappings.
    Mappings {
        /// Only this tenant's mappings.
        #[arg(short, long)]
        tenant: Option<String>,
    },
    /// List a tenant's quotas with usage.
    Quotas {
        /// Tenant ID.
        tenant: String,
    },
}

/// Run the inspect command.
pub fn run_inspect(args: InspectArgs, config_path: &Path, overrides: &ConfigOverrides) -> Result<()> {
    let mut config = if config_path.exists() {
        Config::from_file(config_path)?
    } else {
        Config::in_memory()
    };
    config.apply_overrides(overrides);

    let path = match (config.storage.backend.as_str(), config.storage.path.as_ref()) {
        ("file", Some(path)) => path.clone(),
        _ => anyhow::bail!("inspect needs a file backend; pass --store or configure storage.path"),
    };
    if !path.exists() {
        anyhow::bail!("Store not found: {:?}", path);
    }

    let store = FileStore::open(&path).with_context(|| format!("failed to open {:?}", path))?;
    let controller = Controller::new(
        Arc::new(store),
        Arc::new(NoInstances),
        config.controller_options(),
    );
    controller.restore().context("failed to restore state")?;

    let output = match args.command {
        InspectCommand::Pools => serde_json::to_value(controller.list_pools()?)?,
        InspectCommand::Mappings { tenant } => {
            let scope = match tenant.as_deref() {
                Some(tenant) => LinkScope::Tenant(tenant),
                None => LinkScope::Global,
            };
            let mappings: Vec<_> = controller
                .list_mapped_addresses(tenant.as_deref())?
                .into_iter()
                .map(|m| {
                    let links = m.links(scope);
                    json!({ "mapping": m, "links": links })
                })
                .collect();
            serde_json::Value::Array(mappings)
        }
        InspectCommand::Quotas { tenant } => serde_json::to_value(controller.list_quotas(&tenant)?)?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
