// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Process-wide tracing subscriber and Prometheus exporter

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use shipyard_core::domain::engine_config::LogFormat;
use shipyard_core::infrastructure::metrics as engine_metrics;

/// Initialize tracing subscriber for logging. `RUST_LOG` wins over `level`.
pub fn init_logging(level: &str, format: &LogFormat) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }

    Ok(())
}

/// Serve Prometheus metrics on `0.0.0.0:<port>` and describe the engine's counters
pub fn init_metrics(port: u16) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus exporter")?;
    engine_metrics::register_metrics();
    info!(port, "Prometheus exporter listening");
    Ok(())
}
