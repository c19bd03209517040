//! Redis distributed (L2) tier.
//!
//! All keys are namespaced with the configured prefix so bulk removal can
//! `SCAN` for exactly the records this cache owns. Lock records are left
//! alone by bulk removal. Values are stored as raw bytes with a millisecond
//! expiry (`PX`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use hybrid_cache_core::{
    CacheError, CacheTier, CachedEntry, DistributedTier, Result, is_lock_key,
};
use redis::AsyncCommands;
use tokio::time::Instant;

use crate::config::RedisConfig;

/// Deletes `KEYS[1]` only while it still holds `ARGV[1]`.
const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Create a connection pool from configuration.
pub fn create_pool(config: &RedisConfig) -> Result<Pool> {
    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    let pool_config = redis_config
        .pool
        .get_or_insert_with(|| deadpool_redis::PoolConfig::new(config.pool_size));
    let timeout = Some(Duration::from_millis(config.timeout_ms));
    pool_config.max_size = config.pool_size;
    pool_config.timeouts.wait = timeout;
    pool_config.timeouts.create = timeout;
    pool_config.timeouts.recycle = timeout;

    redis_config
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .map_err(|e| CacheError::distributed("create_pool", e))
}

/// Distributed tier backed by a Redis connection pool.
#[derive(Clone)]
pub struct RedisTier {
    pool: Pool,
    key_prefix: Arc<str>,
    scan_batch_size: usize,
    release_script: redis::Script,
}

impl RedisTier {
    pub fn new(pool: Pool, key_prefix: impl Into<String>, scan_batch_size: usize) -> Self {
        let key_prefix: String = key_prefix.into();
        Self {
            pool,
            key_prefix: Arc::from(key_prefix),
            scan_batch_size: scan_batch_size.max(1),
            release_script: redis::Script::new(COMPARE_AND_DELETE),
        }
    }

    pub fn from_config(pool: Pool, config: &RedisConfig) -> Self {
        Self::new(pool, config.key_prefix.clone(), config.scan_batch_size)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn is_lock_record(&self, full_key: &str) -> bool {
        full_key
            .strip_prefix(&*self.key_prefix)
            .is_some_and(is_lock_key)
    }

    async fn connection(&self, operation: &'static str) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::distributed(operation, e))
    }

    /// Delete every key matching `pattern`, batch by batch.
    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.connection("SCAN").await?;
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(self.scan_batch_size)
                .query_async(&mut conn)
                .await
                .map_err(|e| CacheError::distributed("SCAN", e))?;

            // Lock records are released by their holder or expire
            let keys: Vec<String> = keys
                .into_iter()
                .filter(|key| !self.is_lock_record(key))
                .collect();

            if !keys.is_empty() {
                let deleted: u64 = conn
                    .del(&keys)
                    .await
                    .map_err(|e| CacheError::distributed("DEL", e))?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        tracing::debug!(pattern, removed, "removed matching Redis keys");
        Ok(removed)
    }
}

/// Escape glob metacharacters so `value` matches literally in `SCAN MATCH`.
fn escape_glob(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Redis rejects `PX 0`.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CacheTier for RedisTier {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<CachedEntry>> {
        let full = self.namespaced(key);
        let mut conn = self.connection("GET").await?;

        let (data, pttl): (Option<Vec<u8>>, i64) = redis::pipe()
            .atomic()
            .get(&full)
            .pttl(&full)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::distributed("GET", e))?;

        let Some(data) = data else {
            return Ok(None);
        };
        let data = Arc::new(data);

        // PTTL: -1 no expiry, -2 missing
        let entry = match pttl {
            -1 => CachedEntry::persistent(data),
            ms if ms > 0 => CachedEntry {
                data,
                expires_at: Some(Instant::now() + Duration::from_millis(ms as u64)),
            },
            _ => return Ok(None),
        };
        Ok(Some(entry))
    }

    async fn set(&self, key: &str, value: Arc<Vec<u8>>, ttl: Duration) -> Result<()> {
        let mut conn = self.connection("SET").await?;
        let _: () = redis::cmd("SET")
            .arg(self.namespaced(key))
            .arg(value.as_slice())
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::distributed("SET", e))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection("DEL").await?;
        let removed: u64 = conn
            .del(self.namespaced(key))
            .await
            .map_err(|e| CacheError::distributed("DEL", e))?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection("EXISTS").await?;
        let exists: bool = conn
            .exists(self.namespaced(key))
            .await
            .map_err(|e| CacheError::distributed("EXISTS", e))?;
        Ok(exists)
    }

    async fn remove_by_prefix(&self, prefix: &str) -> Result<u64> {
        let pattern = format!("{}*", escape_glob(&self.namespaced(prefix)));
        self.delete_matching(&pattern).await
    }

    async fn remove_all(&self) -> Result<u64> {
        let pattern = format!("{}*", escape_glob(&self.key_prefix));
        self.delete_matching(&pattern).await
    }
}

#[async_trait]
impl DistributedTier for RedisTier {
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.connection("SET NX").await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.namespaced(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::distributed("SET NX", e))?;
        Ok(reply.is_some())
    }

    async fn remove_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut conn = self.connection("EVALSHA").await?;
        let removed: i64 = self
            .release_script
            .key(self.namespaced(key))
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CacheError::distributed("EVALSHA", e))?;
        Ok(removed > 0)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection("PING").await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::distributed("PING", e))?;
        Ok(())
    }
}
