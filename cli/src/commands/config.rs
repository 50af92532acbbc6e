// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use shipyard_core::domain::engine_config::EngineConfigManifest;
use shipyard_core::domain::repository::StorageBackend;

const SAMPLE_CONFIG: &str = include_str!("../../templates/shipyard-config.yaml");

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./shipyard-config.yaml)
        #[arg(short, long, default_value = "./shipyard-config.yaml")]
        output: PathBuf,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output } => generate(output).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = EngineConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. SHIPYARD_CONFIG_PATH: {}",
            std::env::var("SHIPYARD_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./shipyard-config.yaml");
        println!("  4. ~/.shipyard/config.yaml");
        println!("  5. /etc/shipyard/config.yaml");
        println!();
    }

    let spec = &config.spec;
    println!("{} {}", "Current configuration:".bold(), config.metadata.name);
    println!();

    println!("{}", "Correlation:".bold());
    println!("  Max retries: {}", spec.correlation.max_retries);
    println!("  Retry interval: {:?}", spec.correlation.retry_interval());
    println!();

    println!("{}", "Ingestion:".bold());
    for subject in &spec.ingestion.subjects {
        println!("  - {}", subject);
    }
    println!("  Batch size: {}", spec.ingestion.batch_size);
    println!();

    println!("{}", "Storage:".bold());
    match &spec.storage {
        StorageBackend::InMemory => println!("  Backend: in-memory"),
        StorageBackend::Postgres(pg) => {
            println!("  Backend: postgres");
            println!("  Max connections: {}", pg.max_connections);
        }
    }
    println!();

    println!("{}", "Observability:".bold());
    println!("  Log level: {}", spec.observability.log_level);
    println!("  Log format: {:?}", spec.observability.log_format);
    match spec.observability.metrics_port {
        Some(port) => println!("  Metrics: 0.0.0.0:{}", port),
        None => println!("  Metrics: {}", "(disabled)".dimmed()),
    }
    println!();

    println!("{}", "Sequences:".bold());
    if spec.shipyard.sequences.is_empty() {
        println!("  {}", "(none)".dimmed());
    }
    for entry in &spec.shipyard.sequences {
        let tasks: Vec<&str> = entry.sequence.tasks.iter().map(|t| t.name.as_str()).collect();
        println!("  {}.{} → {}", entry.stage, entry.sequence.name.bold(), tasks.join(" → "));
    }
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = EngineConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;

    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf) -> Result<()> {
    std::fs::write(&output, SAMPLE_CONFIG).with_context(|| format!("Failed to write config to {:?}", output))?;

    println!("{}", format!("✓ Configuration generated: {}", output.display()).green());

    Ok(())
}
