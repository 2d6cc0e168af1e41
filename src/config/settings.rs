use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub isolation: IsolationConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Ops HTTP surface (health, stats, metrics)
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Manager factory settings
#[derive(Debug, Clone, Deserialize)]
pub struct IsolationConfig {
    /// Maximum simultaneously active managers per user
    #[serde(default = "default_max_managers_per_user")]
    pub max_managers_per_user: usize,
    /// Idle time after which a manager is expired by the sweep
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: u64,
    /// Expiry sweep interval in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
    /// Capacity of each manager's recovery queue
    #[serde(default = "default_recovery_queue_size")]
    pub recovery_queue_size: usize,
    /// Upper bound on how long `shutdown` waits for the sweep task
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
}

/// Per-connection lifecycle tracking settings
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_expiry_minutes")]
    pub expiry_minutes: u64,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_max_managers_per_user() -> usize {
    5
}

fn default_connection_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_cleanup_interval() -> u64 {
    300 // 5 minutes
}

fn default_recovery_queue_size() -> usize {
    100
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_expiry_minutes() -> u64 {
    30
}

fn default_health_check_interval() -> u64 {
    60
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("server.host", default_host())?
            .set_default("server.port", 8082)?
            .set_default("isolation.max_managers_per_user", 5)?
            .set_default("isolation.connection_timeout_seconds", 1800)?
            .set_default("isolation.cleanup_interval_seconds", 300)?
            .set_default("isolation.recovery_queue_size", 100)?
            .set_default("isolation.shutdown_timeout_seconds", 10)?
            .set_default("lifecycle.expiry_minutes", 30)?
            .set_default("lifecycle.health_check_interval_seconds", 60)?
            .set_default("log.format", default_log_format())?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables, nested keys use a double underscore:
            // ISOLATION__MAX_MANAGERS_PER_USER, SERVER__PORT, LOG__FORMAT, ...
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl IsolationConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

impl LifecycleConfig {
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_minutes * 60)
    }

    /// Never zero; a zero-period timer cannot be built
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds.max(1))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            max_managers_per_user: default_max_managers_per_user(),
            connection_timeout_seconds: default_connection_timeout(),
            cleanup_interval_seconds: default_cleanup_interval(),
            recovery_queue_size: default_recovery_queue_size(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            expiry_minutes: default_expiry_minutes(),
            health_check_interval_seconds: default_health_check_interval(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 8082);

        let isolation = IsolationConfig::default();
        assert_eq!(isolation.max_managers_per_user, 5);
        assert_eq!(isolation.connection_timeout(), Duration::from_secs(1800));
        assert_eq!(isolation.recovery_queue_size, 100);
    }

    #[test]
    fn test_lifecycle_expiry_in_minutes() {
        let lifecycle = LifecycleConfig {
            expiry_minutes: 2,
            ..Default::default()
        };
        assert_eq!(lifecycle.expiry(), Duration::from_secs(120));

        let zero = LifecycleConfig {
            health_check_interval_seconds: 0,
            ..Default::default()
        };
        assert_eq!(zero.health_check_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_section_uses_defaults() {
        let isolation: IsolationConfig =
            serde_json::from_str(r#"{"max_managers_per_user": 3}"#).unwrap();
        assert_eq!(isolation.max_managers_per_user, 3);
        assert_eq!(isolation.cleanup_interval_seconds, 300);
    }
}
