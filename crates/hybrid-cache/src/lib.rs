//! Hybrid local + distributed cache with single-flight loading, distributed
//! locks and a background dispatcher for bulk invalidation.
//!
//! ```no_run
//! use hybrid_cache::{AppConfig, CacheManager};
//!
//! # async fn demo() -> hybrid_cache::Result<()> {
//! let manager = CacheManager::from_config(&AppConfig::default()).await?;
//! let name: String = manager
//!     .get_or_compute("user:42", None, || async { Ok("Ada".to_string()) })
//!     .await?;
//! assert_eq!(name, "Ada");
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod manager;
pub mod metrics;
pub mod observability;

pub use cache::{
    Backplane, Completion, Dispatcher, HybridCache, HybridOptions, HybridStats, LocalStats,
    LocalTier, LockLease, LockManager, MemoryBackplane, MemoryDistributedTier, RedisBackplane,
    RedisTier,
};
pub use config::{
    AppConfig, BackgroundConfig, CacheConfig, ConfigError, FailurePolicy, LockConfig,
    LoggingConfig, RedisConfig,
};
pub use hybrid_cache_core::{
    CacheError, CacheTier, CachedEntry, DistributedTier, ErrorCategory, LOCK_KEY_PREFIX,
    LockRecord, Result, lock_key_for,
};
pub use manager::{CacheManager, CacheManagerBuilder, connect_distributed};

/// Create a cache manager from a configuration file.
///
/// `path` falls back to `hybrid-cache.toml`; `HYBRID_CACHE__*` environment
/// variables override file values.
pub async fn create_cache_manager(path: Option<&str>) -> Result<CacheManager> {
    let config = config::loader::load_config(path)
        .map_err(|e| CacheError::configuration(e.to_string()))?;
    CacheManager::from_config(&config).await
}
