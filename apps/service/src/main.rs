mod bus;
mod config;
mod database;
mod inventory;
mod orchestrator;
mod pool;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use logger::LevelFilter;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;

/// Device liveness service
#[derive(Parser)]
#[command(name = "pingwatch", version, about = "Probes network devices and publishes up/down transitions")]
struct Cli {
    /// Configuration file (TOML); created with defaults when missing
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Device inventory file, overrides `inventory.path`
    #[arg(short, long, value_name = "FILE")]
    inventory: Option<PathBuf>,

    /// Log level, overrides `logging.level`
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::from_config(cli.config.as_ref())?;
    if let Some(inventory) = &cli.inventory {
        config.inventory.path = inventory.clone();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    if cli.print_config {
        print!("{config}");
        return Ok(());
    }

    let level = config.logging.level.parse().unwrap_or(LevelFilter::INFO);
    logger::init_with(level, config.logging.format.parse().ok());

    info!(version = env!("CARGO_PKG_VERSION"), "Starting pingwatch");

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            return;
        }
        shutdown.cancel();
    });

    if let Err(e) = orchestrator::run(config, cancel).await {
        error!(error = ?e, "Service failed");
        return Err(e);
    }
    Ok(())
}
