//! Engine configuration loader.
//!
//! Reads `brickflow.toml` from the data directory and deserializes it into
//! [`EngineConfig`]. Falls back to defaults when the file is missing or
//! malformed.

use std::path::{Path, PathBuf};

use brickflow_types::config::EngineConfig;

const CONFIG_FILE: &str = "brickflow.toml";

/// Load engine configuration from `{data_dir}/brickflow.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparseable file: logs a warning and returns the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE} found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Resolve the data directory.
///
/// Priority:
/// 1. `BRICKFLOW_DATA_DIR` environment variable
/// 2. `~/.brickflow`
/// 3. `.brickflow` in the current directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("BRICKFLOW_DATA_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".brickflow");
    }
    PathBuf::from(".brickflow")
}

/// Storage paths in the config are relative to the data directory unless
/// absolute.
pub fn resolve_storage_path(data_dir: &Path, configured: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        data_dir.join(configured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn valid_toml_is_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE),
            r#"
dedup_window_ms = 500

[http]
base_url = "https://api.example.com"

[http.default_headers]
x-client = "brickflow"

[log]
level = "debug"
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;

        assert_eq!(config.dedup_window_ms, 500);
        assert_eq!(config.default_timeout_ms, 30_000);
        assert_eq!(config.http.base_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(config.http.default_headers["x-client"], "brickflow");
        assert_eq!(config.log.level, "debug");
    }

    #[tokio::test]
    async fn invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn storage_paths_resolve_against_the_data_dir() {
        let data_dir = Path::new("/var/lib/brickflow");
        assert_eq!(
            resolve_storage_path(data_dir, Path::new("snapshots")),
            PathBuf::from("/var/lib/brickflow/snapshots")
        );
        assert_eq!(
            resolve_storage_path(data_dir, Path::new("/tmp/wf")),
            PathBuf::from("/tmp/wf")
        );
    }
}
