use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::dims::TrafficDirection;
use crate::node::NodeMetadata;
use crate::stats::MetricKind;

impl<'de> Deserialize<'de> for MetricKind {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        match raw.as_str() {
            "counter" => Ok(Self::Counter),
            "gauge" => Ok(Self::Gauge),
            "histogram" => Ok(Self::Histogram),
            other => Err(serde::de::Error::custom(format!(
                "unknown metric kind: {other}"
            ))),
        }
    }
}

/// Configuration rejection taxonomy. A rejected configuration leaves the
/// previously applied one (or none) active; the failure is logged, never
/// fatal to the process.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("{field} must be positive")]
    NonPositive { field: &'static str },
    #[error("edge_epoch_report_interval must be >= edge_new_report_interval")]
    EpochShorterThanNew,
}

/// Top-level application configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Number of worker contexts. Default: 1.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Reporter direction of this proxy. Default: inbound.
    #[serde(default)]
    pub direction: TrafficDirection,

    /// Local node identity metadata.
    #[serde(default)]
    pub node: NodeMetadata,

    /// Self-telemetry endpoint configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Telemetry engine configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Prometheus self-telemetry server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: "127.0.0.1:9093".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// A config-declared metric definition: a new family, or a kind/value
/// override of an existing one by name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricDefinition {
    #[serde(default)]
    pub name: String,
    /// Integer-valued expression extracting the recorded value.
    #[serde(default)]
    pub value: String,
    /// Metric kind; omitted keeps the existing (or counter for new
    /// families).
    #[serde(default)]
    pub kind: Option<MetricKind>,
}

/// Per-family dimension override. An empty name applies to every family.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricOverride {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tags_to_remove: Vec<String>,
    /// Tag name to string-valued expression.
    #[serde(default)]
    pub dimensions: HashMap<String, String>,
}

/// Telemetry engine configuration, applied per worker context.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Exported stat name prefix. Default: "mesh".
    #[serde(default = "default_stat_prefix")]
    pub stat_prefix: String,

    /// Separator between tag segments of a stat name.
    #[serde(default = "default_field_separator")]
    pub field_separator: String,

    /// Separator between a tag name and its value.
    #[serde(default = "default_value_separator")]
    pub value_separator: String,

    /// Metric definitions adding or overriding families.
    #[serde(default)]
    pub definitions: Vec<MetricDefinition>,

    /// Dimension overrides per family.
    #[serde(default)]
    pub metrics: Vec<MetricOverride>,

    /// Periodic tick interval driving TCP reporting and edge cadence.
    /// Default: 15s.
    #[serde(default = "default_tcp_report_interval", with = "humantime_serde")]
    pub tcp_report_interval: Duration,

    /// Idle timeout after which a TCP record still waiting for peer
    /// metadata is reported best-effort and evicted. Default: 60s.
    #[serde(default = "default_tcp_idle_timeout", with = "humantime_serde")]
    pub tcp_idle_timeout: Duration,

    /// Cadence for draining edges observed since the last report.
    /// Default: 60s.
    #[serde(default = "default_edge_new_interval", with = "humantime_serde")]
    pub edge_new_report_interval: Duration,

    /// Cadence guaranteeing re-assertion of still-active edges even
    /// absent new traffic. Default: 600s.
    #[serde(default = "default_edge_epoch_interval", with = "humantime_serde")]
    pub edge_epoch_report_interval: Duration,

    /// Assertions accumulated before the current batch is flushed
    /// automatically. Default: 1000.
    #[serde(default = "default_max_assertions")]
    pub max_assertions_per_request: usize,

    /// Cache hits coalesced locally before flushing to the exported
    /// counter. Default: 100.
    #[serde(default = "default_cache_hit_flush_threshold")]
    pub cache_hit_flush_threshold: u64,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_workers() -> usize {
    1
}

fn default_health_addr() -> String {
    "127.0.0.1:9093".to_string()
}

fn default_stat_prefix() -> String {
    "mesh".to_string()
}

fn default_field_separator() -> String {
    ";.;".to_string()
}

fn default_value_separator() -> String {
    "=.".to_string()
}

fn default_tcp_report_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_tcp_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_edge_new_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_edge_epoch_interval() -> Duration {
    Duration::from_secs(600)
}

fn default_max_assertions() -> usize {
    1000
}

fn default_cache_hit_flush_threshold() -> u64 {
    100
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            workers: default_workers(),
            direction: TrafficDirection::default(),
            node: NodeMetadata::default(),
            health: HealthConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            stat_prefix: default_stat_prefix(),
            field_separator: default_field_separator(),
            value_separator: default_value_separator(),
            definitions: Vec::new(),
            metrics: Vec::new(),
            tcp_report_interval: default_tcp_report_interval(),
            tcp_idle_timeout: default_tcp_idle_timeout(),
            edge_new_report_interval: default_edge_new_interval(),
            edge_epoch_report_interval: default_edge_epoch_interval(),
            max_assertions_per_request: default_max_assertions(),
            cache_hit_flush_threshold: default_cache_hit_flush_threshold(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file. Unknown fields are ignored.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be positive");
        }
        if self.health.addr.is_empty() {
            anyhow::bail!("health.addr is required");
        }
        self.telemetry.validate()?;
        Ok(())
    }
}

impl TelemetryConfig {
    /// Validates engine parameters. A failure rejects the whole
    /// configuration; the caller keeps the previously applied one.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.stat_prefix.is_empty() {
            return Err(ConfigError::MissingField("stat_prefix"));
        }
        if self.field_separator.is_empty() {
            return Err(ConfigError::MissingField("field_separator"));
        }
        if self.value_separator.is_empty() {
            return Err(ConfigError::MissingField("value_separator"));
        }
        if self.tcp_report_interval.is_zero() {
            return Err(ConfigError::NonPositive {
                field: "tcp_report_interval",
            });
        }
        if self.tcp_idle_timeout.is_zero() {
            return Err(ConfigError::NonPositive {
                field: "tcp_idle_timeout",
            });
        }
        if self.edge_new_report_interval.is_zero() {
            return Err(ConfigError::NonPositive {
                field: "edge_new_report_interval",
            });
        }
        if self.edge_epoch_report_interval < self.edge_new_report_interval {
            return Err(ConfigError::EpochShorterThanNew);
        }
        if self.max_assertions_per_request == 0 {
            return Err(ConfigError::NonPositive {
                field: "max_assertions_per_request",
            });
        }
        if self.cache_hit_flush_threshold == 0 {
            return Err(ConfigError::NonPositive {
                field: "cache_hit_flush_threshold",
            });
        }
        Ok(())
    }
}
