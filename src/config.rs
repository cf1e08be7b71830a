//! Proxy configuration loaded from a YAML file.
//!
//! Every field has a default, so a partial file (or no file at all) yields a
//! working configuration. A file that exists but fails to parse is a fatal
//! startup error.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the proxy process.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    pub ssl: SslConfig,
}

/// Listener settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    pub listen_address: String,
    pub listen_port: u16,
    /// Worker threads for the async runtime.
    pub num_threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 6000,
            num_threads: 4,
        }
    }
}

/// Upstream PostgreSQL server settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5432,
        }
    }
}

/// Query cache settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct CacheConfig {
    pub l1: L1Config,
    pub l2: L2Config,
}

/// Tier-1 (in-process LRU) settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct L1Config {
    pub enabled: bool,
    pub max_size: usize,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 1000,
        }
    }
}

/// Tier-2 settings. Redis is the only remote tier.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct L2Config {
    pub redis: RedisConfig,
}

/// Tier-2 (Redis) connection settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct RedisConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Connect timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 6379,
            timeout_ms: 1000,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    /// Minimum severity: trace, debug, info, warn, or error.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Parses the configured level name.
    pub fn level(&self) -> Result<tracing::Level, ConfigError> {
        tracing::Level::from_str(&self.level)
            .map_err(|_| ConfigError::InvalidLogLevel(self.level.clone()))
    }
}

/// TLS bridging toggle.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct SslConfig {
    pub enabled: bool,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Loads the configuration from a YAML file.
    ///
    /// A missing file yields the defaults; any other read or parse failure
    /// is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Self::from_str(&contents)
    }

    /// Parses the configuration from a YAML string.
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(contents).map_err(ConfigError::Parse)
    }
}

/// Configuration error types.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_yaml::Error),
    InvalidLogLevel(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read config: {}", e),
            ConfigError::Parse(e) => write!(f, "failed to parse config: {}", e),
            ConfigError::InvalidLogLevel(level) => write!(f, "invalid log level: {}", level),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen_address, "0.0.0.0");
        assert_eq!(config.server.listen_port, 6000);
        assert_eq!(config.server.num_threads, 4);
        assert_eq!(config.database.host, "127.0.0.1");
        assert_eq!(config.database.port, 5432);
        assert!(config.cache.l1.enabled);
        assert_eq!(config.cache.l1.max_size, 1000);
        assert!(!config.cache.l2.redis.enabled);
        assert_eq!(config.cache.l2.redis.port, 6379);
        assert_eq!(config.cache.l2.redis.timeout_ms, 1000);
        assert_eq!(config.logging.level, "info");
        assert!(config.ssl.enabled);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_str("server:\n  listen_port: 7000\n").unwrap();
        assert_eq!(config.server.listen_port, 7000);
        assert_eq!(config.server.listen_address, "0.0.0.0");
        assert_eq!(config.database.port, 5432);
    }

    #[test]
    fn test_full_file() {
        let yaml = r#"
server:
  listen_address: 127.0.0.1
  listen_port: 6543
  num_threads: 8
database:
  host: db.internal
  port: 5433
cache:
  l1:
    enabled: false
    max_size: 10
  l2:
    redis:
      enabled: true
      host: cache.internal
      port: 6380
      timeout_ms: 250
logging:
  level: debug
ssl:
  enabled: false
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.server.num_threads, 8);
        assert_eq!(config.database.host, "db.internal");
        assert!(!config.cache.l1.enabled);
        assert_eq!(config.cache.l1.max_size, 10);
        assert!(config.cache.l2.redis.enabled);
        assert_eq!(config.cache.l2.redis.host, "cache.internal");
        assert_eq!(config.cache.l2.redis.timeout_ms, 250);
        assert_eq!(config.logging.level, "debug");
        assert!(!config.ssl.enabled);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        assert!(matches!(
            Config::from_str("server: ["),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_unknown_key_is_an_error() {
        assert!(Config::from_str("server:\n  listne_port: 7000\n").is_err());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/pgflight.yaml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_log_level_parsing() {
        let mut logging = LoggingConfig::default();
        assert_eq!(logging.level().unwrap(), tracing::Level::INFO);
        logging.level = "warn".to_string();
        assert_eq!(logging.level().unwrap(), tracing::Level::WARN);
        logging.level = "loud".to_string();
        assert!(logging.level().is_err());
    }
}
