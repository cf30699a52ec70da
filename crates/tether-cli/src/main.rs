mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tether_types::DEFAULT_CONFIG_PATH;
use tracing_subscriber::EnvFilter;

/// tether -- host agent for the management plane backhaul.
#[derive(Parser, Debug)]
#[command(name = "tether", version, about)]
struct Cli {
    /// Log filter used when RUST_LOG is not set (e.g. "debug", "tether_control=trace")
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to the management plane and serve until told to quit
    Run {
        /// Path to the agent configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Load and validate the configuration, then print a summary
    CheckConfig {
        /// Path to the agent configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log-level when both are present.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run { config } => commands::run::run(&config),
        Commands::CheckConfig { config } => commands::check_config::run(&config),
    }
}
