//! wkcore - multi-chain wallet engine core
//!
//! Lists the configured networks, looks up sync checkpoints and replays recorded
//! chain data through a wallet manager, printing every listener event.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

// Use the library crate
use wkcore::cli::commands;
use wkcore::config::Config;

/// wkcore - multi-chain wallet engine core
#[derive(Parser)]
#[command(name = "wkcore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "wkcore.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured networks and their handler capabilities
    Networks,

    /// Block height of the last checkpoint at or before a timestamp
    Checkpoint {
        /// Network uids, e.g. bitcoin-mainnet
        #[arg(long)]
        network: String,

        /// Unix timestamp in seconds
        #[arg(long)]
        timestamp: u64,
    },

    /// Run a wallet manager against recorded client answers
    Replay {
        /// Network uids, e.g. tezos-mainnet
        #[arg(long)]
        network: String,

        /// JSON file with the recorded block number and bundles
        #[arg(long)]
        bundles: PathBuf,

        /// Account address on the network
        #[arg(long)]
        address: String,

        /// JSON file with recorded fee estimates, answered in order
        #[arg(long)]
        fee_estimates: Option<PathBuf>,
    },

    /// Show current configuration
    Config,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.filter.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    init_tracing(&config);

    // Execute command
    let result = match cli.command {
        Commands::Networks => commands::networks(&config),
        Commands::Checkpoint { network, timestamp } => {
            commands::checkpoint(&config, &network, timestamp)
        }
        Commands::Replay {
            network,
            bundles,
            address,
            fee_estimates,
        } => {
            commands::replay(
                &config,
                &network,
                &bundles,
                &address,
                fee_estimates.as_deref(),
            )
            .await
        }
        Commands::Config => commands::show_config(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
