//! Client configuration

use std::env;
use std::time::Duration;

use crate::connection::{
    ConnectionConfig, DEFAULT_BASE_DELAY, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_DELAY,
};
use crate::dedup::DEFAULT_DEDUP_WINDOW;
use crate::presence::DEFAULT_TYPING_TIMEOUT;

/// Session client configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay endpoint, e.g. `ws://localhost:3000/ws`
    pub ws_url: String,

    // Connection
    pub connection: ConnectionConfig,

    // Synchronizer
    pub dedup_window: Duration,
    pub typing_timeout: Duration,

    /// Extra append attempts after the first one fails
    pub append_retries: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:3000/ws".to_string(),
            connection: ConnectionConfig::default(),
            dedup_window: DEFAULT_DEDUP_WINDOW,
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
            append_retries: 1,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let ws_url = env::var("RELAYDESK_WS_URL")
            .unwrap_or_else(|_| "ws://localhost:3000/ws".to_string());
        if !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidUrl(ws_url));
        }

        let max_attempts = env::var("RELAYDESK_RECONNECT_MAX_ATTEMPTS")
            .unwrap_or_else(|_| DEFAULT_MAX_ATTEMPTS.to_string())
            .parse()
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if max_attempts == 0 {
            return Err(ConfigError::Invalid("RELAYDESK_RECONNECT_MAX_ATTEMPTS"));
        }

        Ok(Self {
            ws_url,
            connection: ConnectionConfig {
                max_attempts,
                base_delay: millis_var("RELAYDESK_RECONNECT_BASE_MS", DEFAULT_BASE_DELAY),
                max_delay: millis_var("RELAYDESK_RECONNECT_MAX_DELAY_MS", DEFAULT_MAX_DELAY),
                handshake_timeout: millis_var(
                    "RELAYDESK_HANDSHAKE_TIMEOUT_MS",
                    DEFAULT_HANDSHAKE_TIMEOUT,
                ),
            },
            dedup_window: millis_var("RELAYDESK_DEDUP_WINDOW_MS", DEFAULT_DEDUP_WINDOW),
            typing_timeout: millis_var("RELAYDESK_TYPING_TIMEOUT_MS", DEFAULT_TYPING_TIMEOUT),
            append_retries: env::var("RELAYDESK_APPEND_RETRIES")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .unwrap_or(1),
        })
    }
}

fn millis_var(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid WebSocket URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "RELAYDESK_WS_URL",
        "RELAYDESK_RECONNECT_MAX_ATTEMPTS",
        "RELAYDESK_RECONNECT_BASE_MS",
        "RELAYDESK_RECONNECT_MAX_DELAY_MS",
        "RELAYDESK_HANDSHAKE_TIMEOUT_MS",
        "RELAYDESK_DEDUP_WINDOW_MS",
        "RELAYDESK_TYPING_TIMEOUT_MS",
        "RELAYDESK_APPEND_RETRIES",
    ];

    fn cleanup_config() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        cleanup_config();
        let config = ClientConfig::from_env().unwrap();
        assert_eq!(config.ws_url, "ws://localhost:3000/ws");
        assert_eq!(config.connection.max_attempts, 5);
        assert_eq!(config.connection.base_delay, Duration::from_secs(1));
        assert_eq!(config.connection.max_delay, Duration::from_secs(30));
        assert_eq!(config.connection.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.dedup_window, Duration::from_secs(1));
        assert_eq!(config.typing_timeout, Duration::from_secs(5));
        assert_eq!(config.append_retries, 1);
    }

    #[test]
    #[serial]
    fn test_overrides_and_garbage() {
        cleanup_config();
        env::set_var("RELAYDESK_WS_URL", "wss://relay.example.com/ws");
        env::set_var("RELAYDESK_RECONNECT_MAX_ATTEMPTS", "3");
        env::set_var("RELAYDESK_RECONNECT_BASE_MS", "250");
        env::set_var("RELAYDESK_DEDUP_WINDOW_MS", "not-a-number");

        let config = ClientConfig::from_env().unwrap();
        assert_eq!(config.ws_url, "wss://relay.example.com/ws");
        assert_eq!(config.connection.max_attempts, 3);
        assert_eq!(config.connection.base_delay, Duration::from_millis(250));
        // Unparseable values fall back to the default
        assert_eq!(config.dedup_window, Duration::from_secs(1));
        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_rejects_bad_values() {
        cleanup_config();
        env::set_var("RELAYDESK_WS_URL", "http://relay.example.com");
        assert!(matches!(ClientConfig::from_env(), Err(ConfigError::InvalidUrl(_))));

        env::remove_var("RELAYDESK_WS_URL");
        env::set_var("RELAYDESK_RECONNECT_MAX_ATTEMPTS", "0");
        assert!(matches!(
            ClientConfig::from_env(),
            Err(ConfigError::Invalid("RELAYDESK_RECONNECT_MAX_ATTEMPTS"))
        ));
        cleanup_config();
    }
}
