//! Application configuration

use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub cors_allowed_origins: Vec<String>,

    // Database (absent = in-memory store and ticket board)
    pub database_url: Option<String>,
    pub database_max_connections: u32,

    // Relay
    pub handshake_timeout_ms: u64,

    // Durable store
    pub store_poll_interval_ms: u64,
    pub store_append_retries: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),

            // Database
            database_url: env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),

            // Relay
            handshake_timeout_ms: env::var("HANDSHAKE_TIMEOUT_MS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .unwrap_or(5000),

            // Durable store
            store_poll_interval_ms: env::var("STORE_POLL_INTERVAL_MS")
                .unwrap_or_else(|_| "500".to_string())
                .parse()
                .unwrap_or(500),
            store_append_retries: env::var("STORE_APPEND_RETRIES")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .unwrap_or(1),
        };

        if config.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid("HANDSHAKE_TIMEOUT_MS"));
        }
        if config.store_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("STORE_POLL_INTERVAL_MS"));
        }
        if let Some(url) = &config.database_url {
            if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
                return Err(ConfigError::Invalid("DATABASE_URL"));
            }
        }

        Ok(config)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn store_poll_interval(&self) -> Duration {
        Duration::from_millis(self.store_poll_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            cors_allowed_origins: Vec::new(),
            database_url: None,
            database_max_connections: 20,
            handshake_timeout_ms: 5000,
            store_poll_interval_ms: 500,
            store_append_retries: 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn cleanup_config() {
        for var in [
            "BIND_ADDRESS",
            "CORS_ALLOWED_ORIGINS",
            "DATABASE_URL",
            "DATABASE_MAX_CONNECTIONS",
            "HANDSHAKE_TIMEOUT_MS",
            "STORE_POLL_INTERVAL_MS",
            "STORE_APPEND_RETRIES",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_run_in_memory() {
        cleanup_config();
        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert!(config.database_url.is_none());
        assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.store_poll_interval(), Duration::from_millis(500));
        assert_eq!(config.store_append_retries, 1);
        assert!(config.cors_allowed_origins.is_empty());
    }

    #[test]
    #[serial]
    fn test_overrides() {
        cleanup_config();
        env::set_var("DATABASE_URL", "postgres://relay@localhost/relaydesk");
        env::set_var("CORS_ALLOWED_ORIGINS", "https://a.example, https://b.example,");
        env::set_var("HANDSHAKE_TIMEOUT_MS", "1500");

        let config = Config::from_env().unwrap();
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://relay@localhost/relaydesk")
        );
        assert_eq!(
            config.cors_allowed_origins,
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
        assert_eq!(config.handshake_timeout(), Duration::from_millis(1500));
        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_invalid_values_rejected() {
        cleanup_config();
        env::set_var("HANDSHAKE_TIMEOUT_MS", "0");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("HANDSHAKE_TIMEOUT_MS"))
        ));

        env::remove_var("HANDSHAKE_TIMEOUT_MS");
        env::set_var("DATABASE_URL", "mysql://nope");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("DATABASE_URL"))
        ));
        cleanup_config();
    }
}
