use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config build error: {0}")]
    Build(String),

    #[error("config deserialize error: {0}")]
    Deserialize(String),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl ConfigError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    /// Redis distributed tier and backplane
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub lock: LockConfig,
    /// Background dispatcher for bulk removals
    #[serde(default)]
    pub background: BackgroundConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Cache validations
        if self.cache.local_capacity == 0 {
            return Err(ConfigError::validation("cache.local_capacity must be > 0"));
        }
        if self.cache.max_local_ttl_secs == 0 {
            return Err(ConfigError::validation("cache.max_local_ttl_secs must be > 0"));
        }
        if self.cache.cleanup_interval_secs == 0 {
            return Err(ConfigError::validation(
                "cache.cleanup_interval_secs must be > 0",
            ));
        }
        // Redis validations
        if self.redis.enabled && self.redis.url.trim().is_empty() {
            return Err(ConfigError::validation(
                "redis.enabled=true requires redis.url",
            ));
        }
        if self.redis.pool_size == 0 {
            return Err(ConfigError::validation("redis.pool_size must be > 0"));
        }
        if self.redis.timeout_ms == 0 {
            return Err(ConfigError::validation("redis.timeout_ms must be > 0"));
        }
        if self.redis.scan_batch_size == 0 {
            return Err(ConfigError::validation("redis.scan_batch_size must be > 0"));
        }
        if self.redis.invalidation_channel.trim().is_empty() {
            return Err(ConfigError::validation(
                "redis.invalidation_channel must not be empty",
            ));
        }
        // Lock validation
        if self.lock.expiry_secs == 0 {
            return Err(ConfigError::validation("lock.expiry_secs must be > 0"));
        }
        // Background validations
        if self.background.workers == 0 {
            return Err(ConfigError::validation("background.workers must be > 0"));
        }
        if self.background.queue_capacity == 0 {
            return Err(ConfigError::validation(
                "background.queue_capacity must be > 0",
            ));
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(ConfigError::validation(format!(
                "logging.level must be one of {valid_levels:?}"
            )));
        }
        Ok(())
    }
}

/// Reaction to errors from the distributed tier or the backplane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Return the error to the caller.
    Fail,
    /// Log a warning, count it and carry on with the local tier.
    #[default]
    Degrade,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fail => write!(f, "fail"),
            Self::Degrade => write!(f, "degrade"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL used when a caller passes none
    #[serde(default = "default_ttl_minutes")]
    pub default_ttl_minutes: u64,

    /// Maximum number of entries in the local tier
    #[serde(default = "default_local_capacity")]
    pub local_capacity: usize,

    /// Upper bound on local entry lifetime, limits staleness when an
    /// invalidation message is lost
    #[serde(default = "default_max_local_ttl_secs")]
    pub max_local_ttl_secs: u64,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

fn default_ttl_minutes() -> u64 {
    1440
}

fn default_local_capacity() -> usize {
    10_000
}

fn default_max_local_ttl_secs() -> u64 {
    300
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_minutes: default_ttl_minutes(),
            local_capacity: default_local_capacity(),
            max_local_ttl_secs: default_max_local_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_minutes.saturating_mul(60))
    }

    pub fn max_local_ttl(&self) -> Duration {
        Duration::from_secs(self.max_local_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis (gracefully degrades without it)
    /// Default: false (in-process tier for single-instance deployments)
    #[serde(default)]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// Namespace prepended to every key this cache writes
    #[serde(default = "default_redis_key_prefix")]
    pub key_prefix: String,

    /// Pub/Sub channel for invalidation messages
    #[serde(default = "default_invalidation_channel")]
    pub invalidation_channel: String,

    /// `SCAN COUNT` hint for prefix removal
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

fn default_redis_key_prefix() -> String {
    "hc:".to_string()
}

fn default_invalidation_channel() -> String {
    "cache:invalidate".to_string()
}

fn default_scan_batch_size() -> usize {
    500
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
            key_prefix: default_redis_key_prefix(),
            invalidation_channel: default_invalidation_channel(),
            scan_batch_size: default_scan_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lock expiry used when a caller passes none
    #[serde(default = "default_lock_expiry_secs")]
    pub expiry_secs: u64,
}

fn default_lock_expiry_secs() -> u64 {
    30
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            expiry_secs: default_lock_expiry_secs(),
        }
    }
}

impl LockConfig {
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundConfig {
    #[serde(default = "default_background_workers")]
    pub workers: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_background_workers() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            workers: default_background_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::{AppConfig, ConfigError};
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Default config file looked up in the working directory.
    pub const DEFAULT_CONFIG_FILE: &str = "hybrid-cache.toml";

    /// Prefix of environment overrides, e.g. `HYBRID_CACHE__REDIS__ENABLED=true`.
    pub const ENV_PREFIX: &str = "HYBRID_CACHE";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, ConfigError> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if pathbuf.exists() {
                    builder = builder.add_source(File::from(pathbuf));
                }
            }
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| ConfigError::Build(e.to_string()))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| ConfigError::Deserialize(e.to_string()))?;
        merged.validate()?;
        Ok(merged)
    }
}
