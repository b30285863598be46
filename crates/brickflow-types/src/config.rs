use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine-wide settings, read from `brickflow.toml` in the data directory.
///
/// Every field has a default so partial files are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long a settled backend call keeps answering identical requests.
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,

    /// Timeout for network calls whose brick config sets none.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Bounded wait for display bricks reading a missing data path.
    #[serde(default = "default_data_wait_attempts")]
    pub data_wait_attempts: u32,
    #[serde(default = "default_data_wait_interval_ms")]
    pub data_wait_interval_ms: u64,

    /// Progress tick for simulated background work.
    #[serde(default = "default_progress_tick_ms")]
    pub progress_tick_ms: u64,

    #[serde(default)]
    pub http: HttpSettings,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub log: LogSettings,
}

fn default_dedup_window_ms() -> u64 {
    2_000
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_data_wait_attempts() -> u32 {
    10
}

fn default_data_wait_interval_ms() -> u64 {
    500
}

fn default_progress_tick_ms() -> u64 {
    250
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: default_dedup_window_ms(),
            default_timeout_ms: default_timeout_ms(),
            data_wait_attempts: default_data_wait_attempts(),
            data_wait_interval_ms: default_data_wait_interval_ms(),
            progress_tick_ms: default_progress_tick_ms(),
            http: HttpSettings::default(),
            storage: StorageSettings::default(),
            log: LogSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Total bounded wait for a data path: attempts x interval.
    pub fn data_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.data_wait_interval_ms * u64::from(self.data_wait_attempts))
    }

    pub fn progress_tick(&self) -> Duration {
        Duration::from_millis(self.progress_tick_ms.max(1))
    }
}

/// Settings for the HTTP network adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpSettings {
    /// Prepended to relative endpoints.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub default_headers: BTreeMap<String, String>,
}

/// Directories used by the file adapters. Relative paths resolve against the
/// data directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
    #[serde(default = "default_workflow_dir")]
    pub workflow_dir: PathBuf,
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("snapshots")
}

fn default_workflow_dir() -> PathBuf {
    PathBuf::from("workflows")
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            snapshot_dir: default_snapshot_dir(),
            workflow_dir: default_workflow_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSettings {
    /// Fallback filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Bridge spans to the OpenTelemetry stdout exporter.
    #[serde(default)]
    pub otel: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            otel: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.dedup_window_ms, 2_000);
        assert_eq!(config.default_timeout_ms, 30_000);
        assert_eq!(config.data_wait_timeout(), Duration::from_millis(5_000));
        assert_eq!(config.log.level, "info");
        assert_eq!(config.storage.workflow_dir, PathBuf::from("workflows"));
    }

    #[test]
    fn test_engine_config_partial_toml() {
        let toml_str = r#"
dedup_window_ms = 500

[http]
base_url = "https://api.example.com"

[http.default_headers]
x-tenant = "acme"

[log]
json = true
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.dedup_window_ms, 500);
        assert_eq!(config.default_timeout_ms, 30_000);
        assert_eq!(config.http.base_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(config.http.default_headers["x-tenant"], "acme");
        assert!(config.log.json);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_engine_config_empty_toml() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }
}
