// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Engine Configuration Types
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) configuring:
// - Correlation retry policy
// - Ingestion subjects and batching
// - Storage backend
// - Logging and metrics
// - Sequence catalog and well-known task names

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::payload::TaskNames;
use crate::domain::repository::{PostgresConfig, StorageBackend};
use crate::domain::sequence_execution::SequenceCatalog;

pub const API_VERSION: &str = "shipyard.keptn.sh/v1";
pub const KIND: &str = "EngineConfig";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfigManifest {
    /// API version (must be "shipyard.keptn.sh/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "EngineConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: EngineConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfigSpec {
    #[serde(default)]
    pub correlation: CorrelationConfig,

    #[serde(default)]
    pub ingestion: IngestionConfig,

    #[serde(default)]
    pub storage: StorageBackend,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub tasks: TaskNames,

    /// Sequences the engine can start, per stage
    #[serde(default)]
    pub shipyard: SequenceCatalog,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// Lookups of the prior-phase event before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Wait after each lookup that found nothing
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl CorrelationConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionConfig {
    #[serde(default = "default_subjects")]
    pub subjects: Vec<String>,

    /// Maximum messages pulled per fetch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long a fetch waits for the first message
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Pause after a failed fetch before pulling again
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,
}

impl IngestionConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            subjects: default_subjects(),
            batch_size: default_batch_size(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            idle_backoff_ms: default_idle_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Prometheus listener port; disabled when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: None,
        }
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_interval_ms() -> u64 {
    2000
}

fn default_subjects() -> Vec<String> {
    vec!["sh.keptn.event.>".to_string()]
}

fn default_batch_size() -> usize {
    10
}

fn default_fetch_timeout_ms() -> u64 {
    1000
}

fn default_idle_backoff_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Compact
}

impl Default for EngineConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "shipyard-engine".to_string(),
                labels: None,
            },
            spec: EngineConfigSpec::default(),
        }
    }
}

impl EngineConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. SHIPYARD_CONFIG_PATH environment variable
    /// 2. ./shipyard-config.yaml (working directory)
    /// 3. ~/.shipyard/config.yaml (user home)
    /// 4. /etc/shipyard/config.yaml (system, Unix)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("SHIPYARD_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./shipyard-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".shipyard").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        {
            let system_config = PathBuf::from("/etc/shipyard/config.yaml");
            if system_config.exists() {
                return Some(system_config);
            }
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit path fails hard if missing or invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(level) = lookup("SHIPYARD_LOG_LEVEL") {
            tracing::info!("Environment override: SHIPYARD_LOG_LEVEL={}", level);
            self.spec.observability.log_level = level;
        }

        if let Some(url) = lookup("SHIPYARD_DATABASE_URL") {
            tracing::info!("Environment override: SHIPYARD_DATABASE_URL (postgres backend)");
            let max_connections = match &self.spec.storage {
                StorageBackend::Postgres(pg) => pg.max_connections,
                StorageBackend::InMemory => default_max_connections(),
            };
            self.spec.storage = StorageBackend::Postgres(PostgresConfig {
                connection_string: url,
                max_connections,
            });
        }

        if let Some(val) = lookup("SHIPYARD_CORRELATION_MAX_RETRIES") {
            match val.parse::<u32>() {
                Ok(n) => {
                    tracing::info!("Environment override: SHIPYARD_CORRELATION_MAX_RETRIES={}", n);
                    self.spec.correlation.max_retries = n;
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for SHIPYARD_CORRELATION_MAX_RETRIES: '{}'. Expected an integer. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!("Invalid apiVersion: '{}'. Must be '{}'", self.api_version, API_VERSION);
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        if self.spec.correlation.max_retries == 0 {
            anyhow::bail!("spec.correlation.max_retries must be at least 1");
        }

        if self.spec.ingestion.batch_size == 0 {
            anyhow::bail!("spec.ingestion.batch_size must be at least 1");
        }

        if self.spec.ingestion.subjects.iter().any(|s| s.is_empty()) {
            anyhow::bail!("spec.ingestion.subjects cannot contain empty subjects");
        }

        if let StorageBackend::Postgres(pg) = &self.spec.storage {
            if pg.connection_string.is_empty() {
                anyhow::bail!("spec.storage.connection_string cannot be empty for the postgres backend");
            }
        }

        for entry in &self.spec.shipyard.sequences {
            if entry.sequence.tasks.is_empty() {
                anyhow::bail!(
                    "Sequence '{}' in stage '{}' must have at least one task",
                    entry.sequence.name,
                    entry.stage
                );
            }
        }

        Ok(())
    }
}

fn default_max_connections() -> u32 {
    5
}
