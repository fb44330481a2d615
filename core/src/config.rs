use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::classify::ClassificationRule;

/// Main configuration structure for Flowscope.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub zipkin: ZipkinConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub thresholds: ThresholdsConfig,

    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub classification: ClassificationConfig,

    #[serde(default)]
    pub explainer: ExplainerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the file is missing.
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    "Failed to load config from {:?}: {}. Using defaults.",
                    path.as_ref(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Get the default configuration as a TOML string.
    pub fn default_toml() -> Result<String> {
        let config = Self::default();
        toml::to_string_pretty(&config).context("Failed to serialize default config")
    }

    /// Validate the configuration for obvious misconfiguration.
    pub fn validate(&self) -> Result<()> {
        match self.storage.backend.as_str() {
            "memory" | "postgres" => {}
            other => anyhow::bail!("Invalid storage backend: {}", other),
        }

        if self.storage.backend == "postgres" && self.storage.postgres.connection_string.is_none() {
            anyhow::bail!("PostgreSQL backend requires connection_string");
        }

        if self.zipkin.base_url.trim().is_empty() {
            anyhow::bail!("zipkin.base_url cannot be empty");
        }

        if self.cache.flow_capacity == 0 {
            anyhow::bail!("cache.flow_capacity must be greater than 0");
        }

        for (name, ratio) in [
            ("thresholds.error_rate", self.thresholds.error_rate),
            ("detection.error_rate", self.detection.error_rate),
            ("detection.critical_error_rate", self.detection.critical_error_rate),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                anyhow::bail!("{} must be between 0 and 1, got {}", name, ratio);
            }
        }

        if self.detection.critical_latency_ms < self.detection.high_latency_ms {
            anyhow::bail!("detection.critical_latency_ms must not be below high_latency_ms");
        }

        if self.explainer.enabled && self.explainer.base_url.is_none() {
            anyhow::bail!("explainer.base_url is required when the explainer is enabled");
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => anyhow::bail!("Invalid log level: {}", other),
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).context("Failed to parse config")?;
        Ok(config)
    }
}

/// Tracing backend (Zipkin v2 query API) settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ZipkinConfig {
    #[serde(default = "default_zipkin_url")]
    pub base_url: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_lookback")]
    pub default_lookback_ms: u64,

    #[serde(default = "default_limit")]
    pub default_limit: usize,

    /// Traces fetched per dependency-graph computation
    #[serde(default = "default_limit")]
    pub dependency_batch_size: usize,
}

impl ZipkinConfig {
    pub fn default_lookback(&self) -> Duration {
        Duration::from_millis(self.default_lookback_ms)
    }
}

impl Default for ZipkinConfig {
    fn default() -> Self {
        Self {
            base_url: default_zipkin_url(),
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            default_lookback_ms: default_lookback(),
            default_limit: default_limit(),
            dependency_batch_size: default_limit(),
        }
    }
}

/// Snapshot storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    #[serde(default)]
    pub postgres: PostgresConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            postgres: PostgresConfig::default(),
        }
    }
}

/// PostgreSQL settings for the snapshot store.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub connection_string: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: u32,

    #[serde(default = "default_true")]
    pub auto_migrate: bool,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            connection_string: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connection_timeout_seconds: default_connection_timeout(),
            auto_migrate: true,
        }
    }
}

/// In-process cache sizing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_flow_capacity")]
    pub flow_capacity: usize,

    /// TTL for the services list and dependency graphs
    #[serde(default = "default_query_ttl")]
    pub query_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            flow_capacity: default_flow_capacity(),
            query_ttl_seconds: default_query_ttl(),
        }
    }
}

/// Edge status and node health thresholds used while building graphs.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ThresholdsConfig {
    #[serde(default = "default_error_rate")]
    pub error_rate: f64,

    #[serde(default = "default_high_latency")]
    pub p95_latency_ms: u64,

    #[serde(default = "default_high_latency")]
    pub sla_latency_ms: u64,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            error_rate: default_error_rate(),
            p95_latency_ms: default_high_latency(),
            sla_latency_ms: default_high_latency(),
        }
    }
}

/// Bottleneck rule thresholds.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DetectionConfig {
    #[serde(default = "default_error_rate")]
    pub error_rate: f64,

    #[serde(default = "default_critical_error_rate")]
    pub critical_error_rate: f64,

    #[serde(default = "default_high_latency")]
    pub high_latency_ms: u64,

    #[serde(default = "default_critical_latency")]
    pub critical_latency_ms: u64,

    #[serde(default = "default_latency_multiplier")]
    pub relative_latency_multiplier: f64,

    #[serde(default = "default_fan_out_medium")]
    pub fan_out_medium: usize,

    #[serde(default = "default_fan_out_high")]
    pub fan_out_high: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            error_rate: default_error_rate(),
            critical_error_rate: default_critical_error_rate(),
            high_latency_ms: default_high_latency(),
            critical_latency_ms: default_critical_latency(),
            relative_latency_multiplier: default_latency_multiplier(),
            fan_out_medium: default_fan_out_medium(),
            fan_out_high: default_fan_out_high(),
        }
    }
}

/// Optional replacement for the built-in node classification rules.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ClassificationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<ClassificationRule>>,
}

/// OpenAI-compatible chat completion endpoint used for flow explanations.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExplainerConfig {
    #[serde(default)]
    pub enabled: bool,

    pub base_url: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    pub api_key: Option<String>,

    #[serde(default = "default_explainer_timeout")]
    pub timeout_ms: u64,
}

impl Default for ExplainerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: None,
            model: default_model(),
            api_key: None,
            timeout_ms: default_explainer_timeout(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub include_modules: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            include_modules: false,
        }
    }
}

// Default providers ---------------------------------------------------------

fn default_zipkin_url() -> String {
    "http://localhost:9411".to_string()
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_read_timeout() -> u64 {
    10_000
}

fn default_lookback() -> u64 {
    3_600_000
}

fn default_limit() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_storage_backend() -> String {
    "memory".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connection_timeout() -> u32 {
    30
}

fn default_flow_capacity() -> usize {
    1_000
}

fn default_query_ttl() -> u64 {
    30
}

fn default_error_rate() -> f64 {
    0.05
}

fn default_critical_error_rate() -> f64 {
    0.5
}

fn default_high_latency() -> u64 {
    500
}

fn default_critical_latency() -> u64 {
    2_000
}

fn default_latency_multiplier() -> f64 {
    2.0
}

fn default_fan_out_medium() -> usize {
    5
}

fn default_fan_out_high() -> usize {
    10
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_explainer_timeout() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

// Tests ---------------------------------------------------------------------
