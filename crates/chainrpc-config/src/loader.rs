//! Loading configuration from disk and the environment

use crate::config::EngineConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors that can occur while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {error}")]
    Io { path: PathBuf, error: std::io::Error },

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid endpoint '{0}' (expected unix:/path, tcp://host:port, ws:// or wss://)")]
    InvalidEndpoint(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

pub const ENDPOINT_ENV: &str = "CHAINRPC_ENDPOINT";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load a config file, choosing the format by extension (`.toml`, `.json`)
    pub async fn load_from_file(path: impl AsRef<Path>) -> ConfigResult<EngineConfig> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|error| ConfigError::Io {
                path: path.to_path_buf(),
                error,
            })?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        let config = Self::parse(&content, &extension)?;
        debug!(path = %path.display(), "Loaded engine config");
        Ok(config)
    }

    pub fn parse(content: &str, format: &str) -> ConfigResult<EngineConfig> {
        match format {
            "toml" => Ok(toml::from_str(content)?),
            "json" => Ok(serde_json::from_str(content)?),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Load from an optional file, apply environment overrides, and validate
    pub async fn load(path: Option<&Path>) -> ConfigResult<EngineConfig> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path).await?,
            None => EngineConfig::default(),
        };
        Self::apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(config: &mut EngineConfig) {
        if let Ok(endpoint) = std::env::var(ENDPOINT_ENV) {
            debug!(%endpoint, "Endpoint overridden from environment");
            config.connection.endpoint = Some(endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_parse_partial_toml_fills_defaults() {
        let config = ConfigLoader::parse(
            r#"
[connection]
endpoint = "ws://127.0.0.1:9944"

[reconnect]
max_attempts = 3
"#,
            "toml",
        )
        .unwrap();

        assert_eq!(
            config.connection.endpoint.as_deref(),
            Some("ws://127.0.0.1:9944")
        );
        assert_eq!(config.connection.connect_timeout_seconds, 10);
        assert_eq!(
            config.connection.max_frame_bytes,
            crate::DEFAULT_MAX_FRAME_BYTES
        );
        assert_eq!(config.reconnect.max_attempts, Some(3));
        assert_eq!(config.reconnect.initial_delay_ms, 50);
        assert!(config.requests.resend_subscriptions);
    }

    #[test]
    fn test_parse_json() {
        let config =
            ConfigLoader::parse(r#"{"requests":{"default_timeout_seconds":5}}"#, "json").unwrap();
        assert_eq!(config.requests.default_timeout_seconds, Some(5));
    }

    #[test]
    fn test_parse_unsupported_format() {
        let err = ConfigLoader::parse("", "ini").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat(f) if f == "ini"));
    }

    #[tokio::test]
    #[serial]
    async fn test_load_from_file_and_validate() {
        std::env::remove_var(ENDPOINT_ENV);
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("chainrpc.toml");
        tokio::fs::write(&path, "[connection]\nendpoint = \"tcp://127.0.0.1:9944\"\n")
            .await
            .unwrap();

        let config = ConfigLoader::load(Some(&path)).await.unwrap();
        assert_eq!(
            config.endpoint().unwrap(),
            crate::Endpoint::Tcp("127.0.0.1:9944".into())
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_load_rejects_invalid_file() {
        std::env::remove_var(ENDPOINT_ENV);
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("chainrpc.toml");
        tokio::fs::write(&path, "[reconnect]\ninitial_delay_ms = 0\n")
            .await
            .unwrap();

        let err = ConfigLoader::load(Some(&path)).await.unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = ConfigLoader::load_from_file("/nonexistent/chainrpc.toml")
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[tokio::test]
    #[serial]
    async fn test_env_override_wins() {
        std::env::set_var(ENDPOINT_ENV, "wss://rpc.example.org");
        let config = ConfigLoader::load(None).await.unwrap();
        std::env::remove_var(ENDPOINT_ENV);

        assert_eq!(
            config.endpoint().unwrap(),
            crate::Endpoint::WebSocket("wss://rpc.example.org".into())
        );
    }
}
