use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::integration::CircuitBreakerConfig;

/// Top-level configuration, merged from programmatic defaults,
/// `.abathur/config.yaml`, `.abathur/local.yaml`, and `ABATHUR_`-prefixed
/// environment variables, in that order of precedence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub max_agents: usize,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub redis_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_agents: 10,
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetrySettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            redis_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: ".abathur/abathur.db".to_string(), max_connections: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub retention_days: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "json".to_string(), retention_days: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { requests_per_second: 10.0, burst_size: 20 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { max_retries: 3, initial_backoff_ms: 1000, max_backoff_ms: 30_000 }
    }
}

/// Flat, serde-friendly mirror of [`CircuitBreakerConfig`]; `ConfigLoader`
/// converts between the two so the wire/env representation stays plain
/// scalars instead of `std::time::Duration`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_sec: f64,
    pub error_rate_threshold: f64,
    pub window_size_sec: f64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let d = CircuitBreakerConfig::default();
        Self {
            failure_threshold: d.failure_threshold,
            success_threshold: d.success_threshold,
            timeout_sec: d.timeout_sec,
            error_rate_threshold: d.error_rate_threshold,
            window_size_sec: d.window_size_sec,
        }
    }
}

impl From<CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(s: CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: s.failure_threshold,
            success_threshold: s.success_threshold,
            timeout_sec: s.timeout_sec,
            error_rate_threshold: s.error_rate_threshold,
            window_size_sec: s.window_size_sec,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid max_agents: {0}. Must be between 1 and 100")]
    InvalidMaxAgents(usize),

    #[error("Invalid rate limit: {0}. Must be positive")]
    InvalidRateLimit(f64),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("Invalid burst_size: {0}. Must be at least 1")]
    InvalidBurstSize(u32),

    #[error("Invalid max_retries: {0}. Cannot be 0")]
    InvalidMaxRetries(u32),

    #[error(
        "Invalid backoff configuration: initial_backoff_ms ({0}) must be less than max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

    #[error("Invalid circuit breaker failure_threshold: {0}. Must be at least 1")]
    InvalidFailureThreshold(u32),
}

/// Hierarchical config loader, mirroring `ConfigLoader` exactly: defaults,
/// project config, project-local overrides, then environment variables.
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".abathur/config.yaml"))
            .merge(Yaml::file(".abathur/local.yaml"))
            .merge(Env::prefixed("ABATHUR_").split("__"))
            .extract()
            .context("failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!("failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.max_agents == 0 || config.max_agents > 100 {
            return Err(ConfigError::InvalidMaxAgents(config.max_agents));
        }

        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }

        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(config.database.max_connections));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.rate_limit.requests_per_second <= 0.0 {
            return Err(ConfigError::InvalidRateLimit(config.rate_limit.requests_per_second));
        }

        if config.rate_limit.burst_size == 0 {
            return Err(ConfigError::InvalidBurstSize(config.rate_limit.burst_size));
        }

        if config.retry.max_retries == 0 {
            return Err(ConfigError::InvalidMaxRetries(config.retry.max_retries));
        }

        if config.retry.initial_backoff_ms >= config.retry.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                config.retry.initial_backoff_ms,
                config.retry.max_backoff_ms,
            ));
        }

        if config.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold(0));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_agents, 10);
        assert!((config.rate_limit.requests_per_second - 10.0).abs() < f64::EPSILON);
        assert_eq!(config.database.path, ".abathur/abathur.db");
        assert_eq!(config.logging.level, "info");
        ConfigLoader::validate(&config).expect("default config should be valid");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r"
max_agents: 20
rate_limit:
  requests_per_second: 15.0
  burst_size: 30
database:
  path: /custom/path.db
  max_connections: 5
logging:
  level: debug
  format: pretty
  retention_days: 7
retry:
  max_retries: 3
  initial_backoff_ms: 1000
  max_backoff_ms: 30000
circuit_breaker:
  failure_threshold: 5
  success_threshold: 2
  timeout_sec: 30.0
  error_rate_threshold: 0.5
  window_size_sec: 60.0
redis_url: null
";

        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");

        assert_eq!(config.max_agents, 20);
        assert!((config.rate_limit.requests_per_second - 15.0).abs() < f64::EPSILON);
        assert_eq!(config.rate_limit.burst_size, 30);
        assert_eq!(config.database.path, "/custom/path.db");
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.logging.retention_days, 7);

        ConfigLoader::validate(&config).expect("parsed config should be valid");
    }

    #[test]
    fn test_validate_zero_agents() {
        let config = Config { max_agents: 0, ..Default::default() };
        let result = ConfigLoader::validate(&config);
        assert!(matches!(result.unwrap_err(), ConfigError::InvalidMaxAgents(0)));
    }

    #[test]
    fn test_validate_too_many_agents() {
        let config = Config { max_agents: 101, ..Default::default() };
        let result = ConfigLoader::validate(&config);
        assert!(matches!(result.unwrap_err(), ConfigError::InvalidMaxAgents(101)));
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();
        match ConfigLoader::validate(&config).unwrap_err() {
            ConfigError::InvalidLogLevel(level) => assert_eq!(level, "invalid"),
            other => panic!("expected InvalidLogLevel, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        match ConfigLoader::validate(&config).unwrap_err() {
            ConfigError::InvalidLogFormat(format) => assert_eq!(format, "xml"),
            other => panic!("expected InvalidLogFormat, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_negative_rate_limit() {
        let mut config = Config::default();
        config.rate_limit.requests_per_second = -5.0;
        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::InvalidRateLimit(_)
        ));
    }

    #[test]
    fn test_validate_zero_burst_size() {
        let mut config = Config::default();
        config.rate_limit.burst_size = 0;
        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::InvalidBurstSize(0)
        ));
    }

    #[test]
    fn test_validate_empty_database_path() {
        let mut config = Config::default();
        config.database.path = String::new();
        assert!(matches!(ConfigLoader::validate(&config).unwrap_err(), ConfigError::EmptyDatabasePath));
    }

    #[test]
    fn test_validate_zero_max_connections() {
        let mut config = Config::default();
        config.database.max_connections = 0;
        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::InvalidMaxConnections(0)
        ));
    }

    #[test]
    fn test_validate_zero_max_retries() {
        let mut config = Config::default();
        config.retry.max_retries = 0;
        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::InvalidMaxRetries(0)
        ));
    }

    #[test]
    fn test_validate_invalid_backoff() {
        let mut config = Config::default();
        config.retry.initial_backoff_ms = 30000;
        config.retry.max_backoff_ms = 10000;
        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::InvalidBackoff(30000, 10000)
        ));
    }

    #[test]
    fn test_env_override() {
        unsafe {
            env::set_var("ABATHUR_MAX_AGENTS", "25");
            env::set_var("ABATHUR_RATE_LIMIT__REQUESTS_PER_SECOND", "20.0");
            env::set_var("ABATHUR_LOGGING__LEVEL", "debug");
        }

        assert_eq!(env::var("ABATHUR_MAX_AGENTS").unwrap(), "25");
        assert_eq!(env::var("ABATHUR_RATE_LIMIT__REQUESTS_PER_SECOND").unwrap(), "20.0");
        assert_eq!(env::var("ABATHUR_LOGGING__LEVEL").unwrap(), "debug");

        unsafe {
            env::remove_var("ABATHUR_MAX_AGENTS");
            env::remove_var("ABATHUR_RATE_LIMIT__REQUESTS_PER_SECOND");
            env::remove_var("ABATHUR_LOGGING__LEVEL");
        }
    }

    #[test]
    fn test_hierarchical_merging() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut base_file = NamedTempFile::new().unwrap();
        writeln!(base_file, "max_agents: 5\nlogging:\n  level: info\n  format: json").unwrap();
        base_file.flush().unwrap();

        let mut override_file = NamedTempFile::new().unwrap();
        writeln!(override_file, "max_agents: 15\nlogging:\n  level: debug").unwrap();
        override_file.flush().unwrap();

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(base_file.path()))
            .merge(Yaml::file(override_file.path()))
            .extract()
            .unwrap();

        assert_eq!(config.max_agents, 15, "override should win");
        assert_eq!(config.logging.level, "debug", "override should win for nested fields");
        assert_eq!(config.logging.format, "json", "base value should persist when not overridden");
    }
}
