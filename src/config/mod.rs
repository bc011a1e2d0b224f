//! Configuration parsing and validation.
//!
//! Configuration is YAML with environment variable interpolation. Feeds are
//! kept in an `IndexMap` so runs happen in the order the file lists them.
//!
//! ```yaml
//! lake:
//!   url: gs://nyc-bikes/raw
//! feeds:
//!   station_status:
//!     kind: status
//!     source_prefix: station_status
//!     table_uri: gs://nyc-bikes/warehouse/raw_station_status
//!   station_info:
//!     kind: info
//!     source_prefix: station_info
//!     table_uri: gs://nyc-bikes/warehouse/raw_station_info
//! retry:
//!   max_attempts: 3
//! partition_timezone: America/New_York
//! ```

mod vars;

pub use vars::{InterpolationResult, interpolate, interpolate_with};

use chrono_tz::Tz;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{
    ConfigError, EmptyFilePrefixSnafu, EmptyLakeUrlSnafu, EmptyTableUriSnafu,
    EnvInterpolationSnafu, InvalidConcurrencySnafu, InvalidRetrySnafu, NoFeedsSnafu,
    ReadFileSnafu, UnknownTimezoneSnafu, YamlParseSnafu,
};
use crate::feed::FeedKind;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub lake: LakeConfig,
    pub feeds: IndexMap<String, FeedConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    /// IANA zone used to derive `date_partition` (default: UTC).
    #[serde(default = "default_partition_timezone")]
    pub partition_timezone: String,
    /// Files loaded in parallel within one run (default: 1).
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,
    /// Repeat runs on this interval until shutdown. Unset means a single run.
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    /// Random extra wait (0 to N seconds) added to each poll interval.
    #[serde(default)]
    pub poll_jitter_secs: u64,
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Where snapshot files are captured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LakeConfig {
    pub url: String,
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

/// One snapshot feed and the table it lands in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub kind: FeedKind,
    /// Prefix under the lake URL holding this feed's files.
    #[serde(default)]
    pub source_prefix: String,
    /// Filename prefix before the `YYYYMMDD_HHMMSS` stamp. Defaults per kind.
    #[serde(default)]
    pub file_prefix: Option<String>,
    pub table_uri: String,
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

impl FeedConfig {
    pub fn file_prefix(&self) -> &str {
        self.file_prefix
            .as_deref()
            .unwrap_or_else(|| self.kind.default_file_prefix())
    }
}

/// Retry settings shared by listing, watermark resolution and file loads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_partition_timezone() -> String {
    "UTC".to_string()
}

fn default_max_concurrent_files() -> usize {
    1
}

/// Failed-file reporting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorHandlingConfig {
    /// Directory or bucket prefix for failed-file records.
    #[serde(default)]
    pub dlq_path: Option<String>,
    /// Storage options for DLQ (credentials, region, etc.)
    #[serde(default)]
    pub dlq_storage_options: HashMap<String, String>,
}

/// Metrics configuration for Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether to serve metrics (default: false).
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text, interpolating the process environment.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let result = interpolate(content);
        if !result.is_ok() {
            return EnvInterpolationSnafu {
                message: result.errors.join("\n"),
            }
            .fail();
        }

        let config: Config = serde_yaml::from_str(&result.text).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.lake.url.is_empty(), EmptyLakeUrlSnafu);
        ensure!(!self.feeds.is_empty(), NoFeedsSnafu);
        for (name, feed) in &self.feeds {
            ensure!(!feed.table_uri.is_empty(), EmptyTableUriSnafu { feed: name });
            ensure!(!feed.file_prefix().is_empty(), EmptyFilePrefixSnafu { feed: name });
        }

        ensure!(
            self.retry.max_attempts >= 1,
            InvalidRetrySnafu {
                message: "max_attempts must be at least 1"
            }
        );
        ensure!(
            self.retry.multiplier >= 1.0,
            InvalidRetrySnafu {
                message: "multiplier must be at least 1.0"
            }
        );
        ensure!(
            self.retry.max_delay_ms >= self.retry.base_delay_ms,
            InvalidRetrySnafu {
                message: "max_delay_ms must not be below base_delay_ms"
            }
        );
        ensure!(self.max_concurrent_files >= 1, InvalidConcurrencySnafu);

        self.timezone()?;
        Ok(())
    }

    /// Zone used for the status table's `date_partition`.
    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.partition_timezone
            .parse::<Tz>()
            .map_err(|_| {
                UnknownTimezoneSnafu {
                    name: self.partition_timezone.clone(),
                }
                .build()
            })
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
lake:
  url: /tmp/lake
feeds:
  station_status:
    kind: status
    source_prefix: station_status
    table_uri: /tmp/warehouse/raw_station_status
  station_info:
    kind: info
    table_uri: /tmp/warehouse/raw_station_info
"#;

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();

        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.multiplier, 2.0);
        assert_eq!(config.max_concurrent_files, 1);
        assert_eq!(config.poll_interval(), None);
        assert!(!config.metrics.enabled);
        assert_eq!(config.timezone().unwrap(), chrono_tz::UTC);

        let names: Vec<_> = config.feeds.keys().cloned().collect();
        assert_eq!(names, vec!["station_status", "station_info"]);
        assert_eq!(config.feeds["station_status"].file_prefix(), "status_");
        assert_eq!(config.feeds["station_info"].file_prefix(), "info_");
        assert_eq!(config.feeds["station_info"].source_prefix, "");
    }

    #[test]
    fn test_full_settings() {
        let yaml = r#"
lake:
  url: gs://nyc-bikes/raw
  storage_options:
    google_service_account: /secrets/sa.json
feeds:
  status:
    kind: status
    file_prefix: snap_
    table_uri: gs://nyc-bikes/warehouse/status
retry:
  max_attempts: 5
  base_delay_ms: 10
  max_delay_ms: 100
partition_timezone: America/New_York
max_concurrent_files: 4
poll_interval_secs: 3600
error_handling:
  dlq_path: /tmp/dlq
metrics:
  enabled: true
  address: 127.0.0.1:9999
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.feeds["status"].file_prefix(), "snap_");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.timezone().unwrap(), chrono_tz::America::New_York);
        assert_eq!(config.poll_interval(), Some(Duration::from_secs(3600)));
        assert_eq!(config.error_handling.dlq_path.as_deref(), Some("/tmp/dlq"));
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_rejects_unknown_timezone() {
        let yaml = format!("{MINIMAL}partition_timezone: Mars/Olympus\n");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTimezone { .. }));
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let yaml = format!("{MINIMAL}retry:\n  max_attempts: 0\n");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRetry { .. }));
    }

    #[test]
    fn test_rejects_empty_feeds() {
        let yaml = "lake:\n  url: /tmp/lake\nfeeds: {}\n";
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::NoFeeds));
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let yaml = r#"
lake:
  url: /tmp/lake
feeds:
  free_bikes:
    kind: free_bike_status
    table_uri: /tmp/warehouse/free
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::YamlParse { .. }));
    }
}
