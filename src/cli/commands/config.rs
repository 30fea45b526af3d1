//! Config command implementation.

use crate::core::config::{Config, ConfigOverrides};
use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::Path;

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate the configuration file.
    Validate,
    /// Print configuration with defaults and overrides applied.
    Show {
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
}

/// Run the config command.
pub fn run_config(args: ConfigArgs, config_path: &Path, overrides: &ConfigOverrides) -> Result<()> {
    match args.command {
        ConfigCommand::Validate => validate_config(config_path, overrides),
        ConfigCommand::Show { format } => show_config(config_path, overrides, &format),
    }
}

fn load(path: &Path, overrides: &ConfigOverrides) -> Result<Config> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {:?}", path);
    }
    let mut config = Config::from_file(path)?;
    config.apply_overrides(overrides);
    config.validate()?;
    Ok(config)
}

fn validate_config(path: &Path, overrides: &ConfigOverrides) -> Result<()> {
    let config = load(path, overrides)?;

    println!("✓ Configuration is valid");
    println!("  storage backend: {}", config.storage.backend);
    if let Some(ref store) = config.storage.path {
        println!("  storage path: {}", store.display());
    }
    println!("  bootstrap pools: {}", config.bootstrap.pools.len());
    if config.quotas.defaults.is_empty() {
        println!("  ⚠ Warning: no quota defaults, every quota is unlimited until set");
    }
    if config.storage.backend == "memory" {
        println!("  ⚠ Warning: memory backend, state is lost on restart");
    }
    Ok(())
}

fn show_config(path: &Path, overrides: &ConfigOverrides, format: &str) -> Result<()> {
    let config = load(path, overrides)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        "toml" => println!("{}", toml::to_string_pretty(&config)?),
        other => anyhow::bail!("unknown format '{}', expected toml or json", other),
    }
    Ok(())
}
