use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

/// Endpoint and transport tuning for the single backend connection.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Applied instead of the request timeout to generation-style calls.
    #[serde(default = "default_long_operation_timeout")]
    pub long_operation_timeout_secs: u64,
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_keepalive_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

fn default_long_operation_timeout() -> u64 {
    600
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 50051,
            use_tls: false,
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            long_operation_timeout_secs: default_long_operation_timeout(),
        }
    }
}

impl ConnectionConfig {
    pub fn endpoint_uri(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn long_operation_timeout(&self) -> Duration {
        Duration::from_secs(self.long_operation_timeout_secs)
    }

    /// Reject configurations the transport cannot honor.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("host must not be empty".to_string());
        }
        if self.port == 0 {
            return Err("port must be non-zero".to_string());
        }
        if self.keepalive_interval_secs == 0 {
            return Err("keepalive interval must be non-zero".to_string());
        }
        // Pings spaced wider than the idle timeout cannot keep the connection open.
        if self.keepalive_interval_secs >= self.idle_timeout_secs {
            return Err(format!(
                "keepalive interval ({}s) must be shorter than idle timeout ({}s)",
                self.keepalive_interval_secs, self.idle_timeout_secs
            ));
        }
        Ok(())
    }
}

/// Tunables for the default retry policy.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default_is_valid() {
        let config = ConnectionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.endpoint_uri(), "http://localhost:50051");
        assert_eq!(config.long_operation_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_tls_endpoint_uri() {
        let config = ConnectionConfig {
            host: "api.example.com".to_string(),
            port: 443,
            use_tls: true,
            ..Default::default()
        };
        assert_eq!(config.endpoint_uri(), "https://api.example.com:443");
    }

    #[test]
    fn test_keepalive_must_undercut_idle_timeout() {
        let config = ConnectionConfig {
            keepalive_interval_secs: 120,
            idle_timeout_secs: 60,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.contains("keepalive interval"));
    }

    #[test]
    fn test_empty_host_rejected() {
        let config = ConnectionConfig {
            host: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
