//! Two-tier cache provider.
//!
//! Reads go local tier, then distributed tier, then the caller's loader through
//! the single-flight registry. Writes go to both tiers and are announced on the
//! backplane so other instances drop their local copy.

use std::future::Future;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use hybrid_cache_core::{
    CacheError, CachedEntry, DistributedTier, Result, validate_cache_key, validate_key,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use uuid::Uuid;

use super::dispatcher::{Completion, Dispatcher};
use super::local::{LocalStats, LocalTier};
use super::pubsub::{Backplane, InvalidationMessage, InvalidationScope};
use super::single_flight::SingleFlight;
use crate::config::{CacheConfig, FailurePolicy};
use crate::metrics;

/// Runtime options of a [`HybridCache`].
#[derive(Debug, Clone)]
pub struct HybridOptions {
    /// Identity stamped on published invalidations.
    pub instance_id: Uuid,
    pub default_ttl: Duration,
    /// Local entries never live longer than this.
    pub max_local_ttl: Duration,
    pub failure_policy: FailurePolicy,
}

impl HybridOptions {
    pub fn from_config(config: &CacheConfig, instance_id: Uuid) -> Self {
        Self {
            instance_id,
            default_ttl: config.default_ttl(),
            max_local_ttl: config.max_local_ttl(),
            failure_policy: config.failure_policy,
        }
    }
}

impl Default for HybridOptions {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default(), Uuid::new_v4())
    }
}

/// Hybrid cache provider. Cheap to clone.
#[derive(Clone)]
pub struct HybridCache {
    inner: Arc<HybridInner>,
}

struct HybridInner {
    local: Arc<LocalTier>,
    distributed: Arc<dyn DistributedTier>,
    backplane: Arc<dyn Backplane>,
    flights: SingleFlight<Arc<Vec<u8>>>,
    dispatcher: Dispatcher,
    options: HybridOptions,
}

/// Point-in-time view of the provider.
#[derive(Debug, Clone)]
pub struct HybridStats {
    pub instance_id: Uuid,
    pub local: LocalStats,
    pub in_flight: usize,
    pub pending_jobs: usize,
    pub distributed: &'static str,
    pub backplane: &'static str,
}

impl HybridCache {
    pub fn new(
        local: Arc<LocalTier>,
        distributed: Arc<dyn DistributedTier>,
        backplane: Arc<dyn Backplane>,
        dispatcher: Dispatcher,
        options: HybridOptions,
    ) -> Self {
        Self {
            inner: Arc::new(HybridInner {
                local,
                distributed,
                backplane,
                flights: SingleFlight::new(),
                dispatcher,
                options,
            }),
        }
    }

    pub fn local(&self) -> &Arc<LocalTier> {
        &self.inner.local
    }

    pub fn distributed(&self) -> &Arc<dyn DistributedTier> {
        &self.inner.distributed
    }

    pub fn options(&self) -> &HybridOptions {
        &self.inner.options
    }

    pub fn instance_id(&self) -> Uuid {
        self.inner.options.instance_id
    }

    /// Get the value for `key`, computing it with `loader` on a miss.
    ///
    /// `ttl` defaults to the configured TTL. A zero TTL skips the cache
    /// entirely: the loader runs on every call and nothing is stored.
    /// Concurrent misses for the same key share one loader invocation and
    /// all observe its result or its error.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        loader: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let ttl = self.resolve_ttl(ttl);
        if ttl.is_zero() {
            metrics::record_bypass();
            tracing::trace!(key, "zero ttl, bypassing cache");
            return loader().await.map_err(|e| CacheError::loader(key, e));
        }
        validate_cache_key(key)?;

        if let Some(data) = self.read(key).await? {
            match decode::<T>(&data) {
                Ok(value) => return Ok(value),
                Err(e) => self.discard_undecodable(key, &e).await?,
            }
        }

        let this = self.clone();
        let owned_key = key.to_string();
        let data = self
            .inner
            .flights
            .run(key, move || async move { this.load(owned_key, ttl, loader).await })
            .await?;
        decode(&data)
    }

    /// Get a cached value without loading it.
    ///
    /// A value that does not decode as `T` is removed and reported as absent.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        validate_cache_key(key)?;
        let Some(data) = self.read(key).await? else {
            return Ok(None);
        };
        match decode::<T>(&data) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                self.discard_undecodable(key, &e).await?;
                Ok(None)
            }
        }
    }

    /// Store `value` in both tiers. A zero TTL stores nothing.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let ttl = self.resolve_ttl(ttl);
        if ttl.is_zero() {
            tracing::trace!(key, "zero ttl, set ignored");
            return Ok(());
        }
        validate_cache_key(key)?;
        let data = Arc::new(encode(value)?);
        self.store(key, data, ttl).await
    }

    /// Remove `key` from both tiers.
    ///
    /// Returns `true` if either tier held it.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        validate_cache_key(key)?;
        let local = self.inner.local.remove(key);
        let distributed = match self.inner.distributed.remove(key).await {
            Ok(removed) => removed,
            Err(e) => {
                self.tolerate("remove", e)?;
                false
            }
        };
        self.publish(InvalidationScope::Key(key.to_string())).await?;

        tracing::debug!(key, local, distributed, "removed cache entry");
        Ok(local || distributed)
    }

    /// Check whether a live value exists in either tier.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        if self.inner.local.contains(key) {
            return Ok(true);
        }
        match self.inner.distributed.exists(key).await {
            Ok(exists) => Ok(exists),
            Err(e) => {
                self.tolerate("exists", e)?;
                Ok(false)
            }
        }
    }

    /// Queue removal of every key starting with `prefix`.
    ///
    /// Returns as soon as the job is queued.
    pub fn remove_by_prefix(&self, prefix: &str) -> Result<Completion> {
        let this = self.clone();
        let prefix = prefix.to_string();
        self.inner.dispatcher.enqueue("remove_by_prefix", async move {
            let local = this.inner.local.remove_by_prefix(&prefix);
            let distributed = this.inner.distributed.remove_by_prefix(&prefix).await;
            this.publish(InvalidationScope::Prefix(prefix.clone()))
                .await?;
            let distributed = distributed?;

            tracing::info!(prefix = %prefix, local, distributed, "removed cache entries by prefix");
            Ok(())
        })
    }

    /// Queue removal of every entry this cache owns.
    pub fn clear(&self) -> Result<Completion> {
        let this = self.clone();
        self.inner.dispatcher.enqueue("clear", async move {
            let local = this.inner.local.clear();
            let distributed = this.inner.distributed.remove_all().await;
            this.publish(InvalidationScope::All).await?;
            let distributed = distributed?;

            tracing::info!(local, distributed, "cleared cache");
            Ok(())
        })
    }

    pub fn stats(&self) -> HybridStats {
        HybridStats {
            instance_id: self.inner.options.instance_id,
            local: self.inner.local.stats(),
            in_flight: self.inner.flights.in_flight(),
            pending_jobs: self.inner.dispatcher.pending(),
            distributed: self.inner.distributed.name(),
            backplane: self.inner.backplane.name(),
        }
    }

    fn resolve_ttl(&self, ttl: Option<Duration>) -> Duration {
        ttl.unwrap_or(self.inner.options.default_ttl)
    }

    /// Look the key up in the local tier, then the distributed tier.
    async fn read(&self, key: &str) -> Result<Option<Arc<Vec<u8>>>> {
        if let Some(data) = self.inner.local.get_fresh(key) {
            metrics::record_cache_hit("local");
            tracing::debug!(key, tier = "local", "cache hit");
            return Ok(Some(data));
        }

        match self.inner.distributed.get(key).await {
            Ok(Some(entry)) => {
                metrics::record_cache_hit(self.inner.distributed.name());
                tracing::debug!(key, tier = self.inner.distributed.name(), "cache hit");
                let data = Arc::clone(&entry.data);
                self.promote(key, entry);
                Ok(Some(data))
            }
            Ok(None) => {
                metrics::record_cache_miss();
                tracing::debug!(key, "cache miss");
                Ok(None)
            }
            Err(e) => {
                self.tolerate("get", e)?;
                metrics::record_cache_miss();
                Ok(None)
            }
        }
    }

    /// Copy a distributed entry into the local tier, never past its
    /// remaining distributed lifetime.
    fn promote(&self, key: &str, entry: CachedEntry) {
        let max = self.inner.options.max_local_ttl;
        let ttl = entry.remaining_ttl().map_or(max, |remaining| remaining.min(max));
        if !ttl.is_zero() {
            self.inner.local.insert(key, entry.data, ttl);
        }
    }

    /// Body of a single-flight load.
    async fn load<T, F, Fut>(&self, key: String, ttl: Duration, loader: F) -> Result<Arc<Vec<u8>>>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        // Previous flight may have stored it between our read and our join
        if let Some(data) = self.inner.local.peek(&key) {
            return Ok(data);
        }

        let started = Instant::now();
        let data = match loader().await {
            Ok(value) => Arc::new(encode(&value)?),
            Err(e) => {
                metrics::record_load(false, started.elapsed());
                tracing::warn!(key = %key, error = %e, "cache loader failed");
                return Err(CacheError::loader(key, e));
            }
        };
        metrics::record_load(true, started.elapsed());

        self.store(&key, Arc::clone(&data), ttl).await?;
        tracing::debug!(key = %key, bytes = data.len(), "loaded and cached value");
        Ok(data)
    }

    /// Write through to both tiers and announce the change.
    ///
    /// The local copy is only written once the distributed write succeeded or
    /// its failure was tolerated.
    async fn store(&self, key: &str, data: Arc<Vec<u8>>, ttl: Duration) -> Result<()> {
        if let Err(e) = self.inner.distributed.set(key, Arc::clone(&data), ttl).await {
            self.tolerate("set", e)?;
        }

        let local_ttl = ttl.min(self.inner.options.max_local_ttl);
        self.inner.local.insert(key, data, local_ttl);
        self.publish(InvalidationScope::Key(key.to_string())).await
    }

    async fn publish(&self, scope: InvalidationScope) -> Result<()> {
        let message = InvalidationMessage::new(self.inner.options.instance_id, scope);
        match self.inner.backplane.publish(&message).await {
            Ok(()) => Ok(()),
            Err(e) => self.tolerate("publish", e),
        }
    }

    async fn discard_undecodable(&self, key: &str, error: &CacheError) -> Result<()> {
        metrics::record_decode_failure();
        tracing::warn!(key, error = %error, "cached value does not decode, discarding");
        self.remove(key).await.map(|_| ())
    }

    /// Apply the failure policy to a distributed tier or backplane error.
    fn tolerate(&self, operation: &'static str, error: CacheError) -> Result<()> {
        metrics::record_distributed_error(operation);
        match self.inner.options.failure_policy {
            FailurePolicy::Fail => Err(error),
            FailurePolicy::Degrade => {
                tracing::warn!(
                    operation,
                    error = %error,
                    "distributed cache unavailable, continuing with local tier"
                );
                Ok(())
            }
        }
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec(value).map_err(CacheError::serialization)
}

/// Decode a whole MessagePack value; trailing bytes are an error.
fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let mut reader = Cursor::new(data);
    let value = rmp_serde::from_read(&mut reader).map_err(CacheError::serialization)?;
    let trailing = data.len() as u64 - reader.position();
    if trailing > 0 {
        return Err(CacheError::serialization(format!(
            "{trailing} trailing bytes after cached value"
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::lock::LockManager;
    use crate::cache::memory::MemoryDistributedTier;
    use crate::cache::pubsub::MemoryBackplane;
    use async_trait::async_trait;
    use hybrid_cache_core::{CacheTier, lock_key_for};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache_with(distributed: Arc<dyn DistributedTier>, policy: FailurePolicy) -> HybridCache {
        let options = HybridOptions {
            failure_policy: policy,
            ..HybridOptions::default()
        };
        HybridCache::new(
            Arc::new(LocalTier::new(100)),
            distributed,
            Arc::new(MemoryBackplane::new()),
            Dispatcher::start(1, 16),
            options,
        )
    }

    fn memory_cache() -> (HybridCache, MemoryDistributedTier) {
        let tier = MemoryDistributedTier::new();
        (cache_with(Arc::new(tier.clone()), FailurePolicy::Degrade), tier)
    }

    /// Distributed tier whose every call fails.
    struct DownTier;

    #[async_trait]
    impl CacheTier for DownTier {
        fn name(&self) -> &'static str {
            "down"
        }
        async fn get(&self, _: &str) -> Result<Option<CachedEntry>> {
            Err(CacheError::distributed("GET", "connection refused"))
        }
        async fn set(&self, _: &str, _: Arc<Vec<u8>>, _: Duration) -> Result<()> {
            Err(CacheError::distributed("SET", "connection refused"))
        }
        async fn remove(&self, _: &str) -> Result<bool> {
            Err(CacheError::distributed("DEL", "connection refused"))
        }
        async fn exists(&self, _: &str) -> Result<bool> {
            Err(CacheError::distributed("EXISTS", "connection refused"))
        }
        async fn remove_by_prefix(&self, _: &str) -> Result<u64> {
            Err(CacheError::distributed("SCAN", "connection refused"))
        }
        async fn remove_all(&self) -> Result<u64> {
            Err(CacheError::distributed("SCAN", "connection refused"))
        }
    }

    #[async_trait]
    impl DistributedTier for DownTier {
        async fn set_if_absent(&self, _: &str, _: &[u8], _: Duration) -> Result<bool> {
            Err(CacheError::distributed("SET NX", "connection refused"))
        }
        async fn remove_if_equals(&self, _: &str, _: &[u8]) -> Result<bool> {
            Err(CacheError::distributed("EVALSHA", "connection refused"))
        }
        async fn ping(&self) -> Result<()> {
            Err(CacheError::distributed("PING", "connection refused"))
        }
    }

    /// Distributed tier that serves reads but rejects every write.
    struct ReadOnlyTier(MemoryDistributedTier);

    #[async_trait]
    impl CacheTier for ReadOnlyTier {
        fn name(&self) -> &'static str {
            "read-only"
        }
        async fn get(&self, key: &str) -> Result<Option<CachedEntry>> {
            self.0.get(key).await
        }
        async fn set(&self, _: &str, _: Arc<Vec<u8>>, _: Duration) -> Result<()> {
            Err(CacheError::distributed("SET", "READONLY replica"))
        }
        async fn remove(&self, key: &str) -> Result<bool> {
            self.0.remove(key).await
        }
        async fn exists(&self, key: &str) -> Result<bool> {
            self.0.exists(key).await
        }
        async fn remove_by_prefix(&self, prefix: &str) -> Result<u64> {
            self.0.remove_by_prefix(prefix).await
        }
        async fn remove_all(&self) -> Result<u64> {
            self.0.remove_all().await
        }
    }

    #[async_trait]
    impl DistributedTier for ReadOnlyTier {
        async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
            self.0.set_if_absent(key, value, ttl).await
        }
        async fn remove_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
            self.0.remove_if_equals(key, expected).await
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_get_or_compute_caches_in_both_tiers() {
        let (cache, tier) = memory_cache();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let value: String = cache
                .get_or_compute("user:42", None, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("Ada".to_string())
                })
                .await
                .unwrap();
            assert_eq!(value, "Ada");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.local().contains("user:42"));
        assert!(tier.exists("user:42").await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_ttl_bypasses_cache() {
        let (cache, tier) = memory_cache();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let value: u32 = cache
                .get_or_compute("k", Some(Duration::ZERO), move || async move {
                    Ok(calls.fetch_add(1, Ordering::SeqCst) as u32)
                })
                .await
                .unwrap();
            assert!(value < 2);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!cache.local().contains("k"));
        assert!(tier.is_empty());
    }

    #[tokio::test]
    async fn test_set_zero_ttl_is_noop() {
        let (cache, tier) = memory_cache();
        cache.set("k", &1u32, Some(Duration::ZERO)).await.unwrap();
        assert!(!cache.exists("k").await.unwrap());
        assert!(tier.is_empty());
    }

    #[tokio::test]
    async fn test_loader_error_is_not_cached() {
        let (cache, _) = memory_cache();

        let err = cache
            .get_or_compute::<u32, _, _>("k", None, || async { Err(anyhow::anyhow!("db down")) })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Loader { ref key, .. } if key == "k"));
        assert!(!cache.exists("k").await.unwrap());

        let value: u32 = cache
            .get_or_compute("k", None, || async { Ok(5) })
            .await
            .unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn test_invalid_key_rejected() {
        let (cache, _) = memory_cache();
        let err = cache.set("bad key", &1u32, None).await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey(_)));
        assert!(cache.get::<u32>("").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_promotion_respects_remaining_ttl() {
        let (cache, tier) = memory_cache();
        tier.set("k", Arc::new(encode(&7u32).unwrap()), Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(cache.get::<u32>("k").await.unwrap(), Some(7));
        let local = cache.local().get_entry("k").unwrap();
        assert_eq!(local.remaining_ttl(), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!cache.local().contains("k"));
        assert_eq!(cache.get::<u32>("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_copy_capped_by_max_local_ttl() {
        let (cache, tier) = memory_cache();
        cache
            .set("k", &"v", Some(Duration::from_secs(3600)))
            .await
            .unwrap();

        let max = cache.options().max_local_ttl;
        assert_eq!(cache.local().get_entry("k").unwrap().remaining_ttl(), Some(max));
        assert_eq!(
            tier.get("k").await.unwrap().unwrap().remaining_ttl(),
            Some(Duration::from_secs(3600))
        );
    }

    #[tokio::test]
    async fn test_undecodable_value_is_discarded() {
        let (cache, tier) = memory_cache();
        cache.set("k", &"not a number", None).await.unwrap();

        assert_eq!(cache.get::<u32>("k").await.unwrap(), None);
        assert!(!cache.local().contains("k"));
        assert!(!tier.exists("k").await.unwrap());

        let value: u32 = cache
            .get_or_compute("k", None, || async { Ok(3) })
            .await
            .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_remove_and_exists() {
        let (cache, tier) = memory_cache();
        cache.set("k", &1u32, None).await.unwrap();
        assert!(cache.exists("k").await.unwrap());

        assert!(cache.remove("k").await.unwrap());
        assert!(!cache.exists("k").await.unwrap());
        assert!(!tier.exists("k").await.unwrap());
        assert!(!cache.remove("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_by_prefix_and_clear() {
        let (cache, tier) = memory_cache();
        for key in ["product:1", "product:2", "category:1"] {
            cache.set(key, &key, None).await.unwrap();
        }

        cache.remove_by_prefix("product:").unwrap().wait().await.unwrap();
        assert!(!cache.exists("product:1").await.unwrap());
        assert!(!cache.exists("product:2").await.unwrap());
        assert!(cache.exists("category:1").await.unwrap());

        cache.clear().unwrap().wait().await.unwrap();
        assert!(!cache.exists("category:1").await.unwrap());
        assert!(tier.is_empty());
        assert!(cache.local().is_empty());
    }

    #[tokio::test]
    async fn test_degrade_policy_keeps_serving_from_local_tier() {
        let cache = cache_with(Arc::new(DownTier), FailurePolicy::Degrade);

        let value: u32 = cache
            .get_or_compute("k", None, || async { Ok(9) })
            .await
            .unwrap();
        assert_eq!(value, 9);
        assert_eq!(cache.get::<u32>("k").await.unwrap(), Some(9));
        assert!(cache.exists("k").await.unwrap());
        assert!(cache.remove("k").await.unwrap());
        assert!(!cache.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_policy_surfaces_distributed_errors() {
        let cache = cache_with(Arc::new(DownTier), FailurePolicy::Fail);

        let err = cache.get::<u32>("k").await.unwrap_err();
        assert!(matches!(err, CacheError::Distributed { .. }));

        let err = cache.set("k", &1u32, None).await.unwrap_err();
        assert!(err.is_transient());

        let completion = cache.clear().unwrap();
        assert!(completion.wait().await.is_err());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_local_copy() {
        let cache = cache_with(Arc::new(DownTier), FailurePolicy::Fail);

        let err = cache.set("k", &1u32, None).await.unwrap_err();
        assert!(matches!(err, CacheError::Distributed { .. }));
        assert!(!cache.local().contains("k"));
    }

    #[tokio::test]
    async fn test_failed_write_after_load_leaves_no_local_copy() {
        let cache = cache_with(
            Arc::new(ReadOnlyTier(MemoryDistributedTier::new())),
            FailurePolicy::Fail,
        );

        let err = cache
            .get_or_compute::<u32, _, _>("k", None, || async { Ok(1) })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Distributed { .. }));
        assert!(!cache.local().contains("k"));
        assert!(!cache.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_records_are_out_of_reach() {
        let (cache, tier) = memory_cache();
        let locks = LockManager::new(Arc::new(tier.clone()), Duration::from_secs(30));
        let lease = locks.try_acquire("job", None).await.unwrap().unwrap();
        let lock_key = lock_key_for("job");

        let err = cache.get::<String>(&lock_key).await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey(_)));
        assert!(cache.get::<u32>(&lock_key).await.is_err());
        assert!(cache.set(&lock_key, &"stolen", None).await.is_err());
        assert!(cache.remove(&lock_key).await.is_err());
        assert!(
            cache
                .get_or_compute::<u32, _, _>(&lock_key, None, || async { Ok(1) })
                .await
                .is_err()
        );

        cache.remove_by_prefix("lo").unwrap().wait().await.unwrap();
        cache.clear().unwrap().wait().await.unwrap();

        assert!(cache.exists(&lock_key).await.unwrap());
        assert!(locks.try_acquire("job", None).await.unwrap().is_none());
        assert!(lease.release().await.unwrap());
        assert!(!cache.exists(&lock_key).await.unwrap());
    }

    #[tokio::test]
    async fn test_trailing_bytes_do_not_decode() {
        let (cache, tier) = memory_cache();
        // A positive fixint followed by junk
        tier.set("k", Arc::new(b"3abc".to_vec()), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(cache.get::<u32>("k").await.unwrap(), None);
        assert!(!tier.exists("k").await.unwrap());
        assert!(decode::<u32>(&encode(&51u32).unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_stats() {
        let (cache, _) = memory_cache();
        cache.set("k", &1u32, None).await.unwrap();
        let _ = cache.get::<u32>("k").await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.local.entries, 1);
        assert_eq!(stats.local.hits, 1);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.distributed, "memory");
        assert_eq!(stats.backplane, "memory");
    }
}
