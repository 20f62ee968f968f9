//! Engine configuration components

use crate::endpoint::{default_socket_path, Endpoint};
use crate::loader::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub connection: ConnectionConfig,
    pub reconnect: ReconnectConfig,
    pub requests: RequestConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Endpoint URI (`unix:/path`, `tcp://host:port`, `ws://...`, `wss://...`).
    /// Falls back to the default Unix socket when unset.
    pub endpoint: Option<String>,
    pub connect_timeout_seconds: u64,
    /// Largest inbound frame accepted; longer lines or messages drop the
    /// connection
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive failed connection attempts before the engine gives up.
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Applied to calls that do not set their own timeout
    pub default_timeout_seconds: Option<u64>,
    /// Default resend policy for subscriptions
    pub resend_subscriptions: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            connect_timeout_seconds: 10,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 50,
            max_delay_ms: 1_000,
            max_attempts: Some(10),
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: Some(30),
            resend_subscriptions: true,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Backoff before the given (zero-based) retry: doubles from the initial
    /// delay and is capped at the max delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let millis = self.initial_delay_ms.saturating_mul(factor);
        Duration::from_millis(millis.min(self.max_delay_ms))
    }

    /// Whether another attempt is allowed after `failures` consecutive failures
    pub fn allows_attempt(&self, failures: u32) -> bool {
        if !self.enabled && failures > 0 {
            return false;
        }
        match self.max_attempts {
            Some(max) => failures < max,
            None => true,
        }
    }
}

impl RequestConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_seconds.map(Duration::from_secs)
    }
}

impl EngineConfig {
    /// Resolve the configured endpoint, defaulting to the local Unix socket
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        match self.connection.endpoint.as_deref() {
            Some(uri) => uri.parse(),
            None => Ok(Endpoint::Unix(default_socket_path())),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(uri) = self.connection.endpoint.as_deref() {
            if uri.trim().is_empty() {
                return Err(ConfigError::Invalid("connection.endpoint is empty".into()));
            }
            uri.parse::<Endpoint>()?;
        }
        if self.connection.connect_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "connection.connect_timeout_seconds must be positive".into(),
            ));
        }
        if self.connection.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid(
                "connection.max_frame_bytes must be positive".into(),
            ));
        }
        if self.reconnect.initial_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.initial_delay_ms must be positive".into(),
            ));
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "reconnect.initial_delay_ms ({}) exceeds reconnect.max_delay_ms ({})",
                self.reconnect.initial_delay_ms, self.reconnect.max_delay_ms
            )));
        }
        if self.requests.default_timeout_seconds == Some(0) {
            return Err(ConfigError::Invalid(
                "requests.default_timeout_seconds must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let cfg = ReconnectConfig::default();
        assert_eq!(cfg.delay_for_attempt(0), Duration::from_millis(50));
        assert_eq!(cfg.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(cfg.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(cfg.delay_for_attempt(5), Duration::from_millis(1_000));
        assert_eq!(cfg.delay_for_attempt(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_allows_attempt() {
        let mut cfg = ReconnectConfig {
            max_attempts: Some(2),
            ..Default::default()
        };
        assert!(cfg.allows_attempt(0));
        assert!(cfg.allows_attempt(1));
        assert!(!cfg.allows_attempt(2));

        cfg.max_attempts = None;
        assert!(cfg.allows_attempt(1_000));

        cfg.enabled = false;
        assert!(cfg.allows_attempt(0));
        assert!(!cfg.allows_attempt(1));
    }

    #[test]
    fn test_validate_rejects_zero_frame_limit() {
        let mut cfg = EngineConfig::default();
        cfg.connection.max_frame_bytes = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_frame_bytes"));
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let mut cfg = EngineConfig::default();
        cfg.reconnect.initial_delay_ms = 5_000;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_validate_rejects_empty_endpoint() {
        let mut cfg = EngineConfig::default();
        cfg.connection.endpoint = Some("  ".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    #[serial_test::serial]
    fn test_endpoint_defaults_to_unix_socket() {
        let cfg = EngineConfig::default();
        match cfg.endpoint().unwrap() {
            Endpoint::Unix(path) => assert!(path.ends_with("chainrpc.sock")),
            other => panic!("unexpected endpoint {:?}", other),
        }
    }
}
