// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Shipyard CLI
//!
//! The `shipyard` binary drives the sequence engine locally.
//!
//! ## Commands
//!
//! - `shipyard config show|validate|generate` - Configuration management
//! - `shipyard simulate` - Run one sequence end to end against simulated executors

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use shipyard_cli::commands::{self, ConfigCommand, SimulateArgs};
use shipyard_cli::observability;
use shipyard_core::domain::engine_config::{EngineConfigManifest, ObservabilityConfig};

/// Shipyard sequence engine
#[derive(Parser)]
#[command(name = "shipyard")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "SHIPYARD_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to the configured level
    #[arg(long, global = true, env = "SHIPYARD_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Trigger one sequence and answer its tasks with simulated executors
    #[command(name = "simulate")]
    Simulate(SimulateArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Logging settings come from the config file when it loads; the command reports load errors itself
    let settings = EngineConfigManifest::load_or_default(cli.config.clone())
        .map(|manifest| manifest.spec.observability)
        .unwrap_or_else(|_| ObservabilityConfig::default());
    let level = cli.log_level.clone().unwrap_or_else(|| settings.log_level.clone());
    observability::init_logging(&level, &settings.log_format)?;
    if let Some(port) = settings.metrics_port {
        observability::init_metrics(port)?;
    }

    match cli.command {
        Some(Commands::Config { command }) => commands::config::handle_command(command, cli.config).await,
        Some(Commands::Simulate(args)) => commands::simulate::execute(args, cli.config).await,
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}
