//! Warden - unified CLI entrypoint.
//!
//! Usage:
//!   warden start --config config/warden.toml
//!   warden config validate --config config/warden.toml
//!   warden config show --format json
//!   warden inspect pools --store data/warden.db
//!   warden inspect mappings --tenant <tenant-id> --store data/warden.db
//!   warden inspect quotas <tenant-id> --store data/warden.db

use anyhow::Result;
use clap::Parser;
use warden::cli::commands::{run_config, run_inspect, run_start};
use warden::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config_path();
    let overrides = cli.overrides();

    match cli.command {
        Commands::Start(args) => run_start(args, &config_path, overrides).await,
        Commands::Config(args) => run_config(args, &config_path, &overrides),
        Commands::Inspect(args) => run_inspect(args, &config_path, &overrides),
    }
}
