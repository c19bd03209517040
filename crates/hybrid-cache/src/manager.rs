//! Cache manager: builds the tier stack from configuration, owns the
//! background tasks and exposes the caller-facing API.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use hybrid_cache_core::{CacheError, DistributedTier, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::{
    Backplane, Completion, Dispatcher, HybridCache, HybridOptions, HybridStats, InvalidationListener,
    LocalTier, LockLease, LockManager, MemoryBackplane, MemoryDistributedTier, RedisBackplane,
    RedisTier, create_pool,
};
use crate::config::{AppConfig, FailurePolicy};
use crate::metrics;

/// Entry point of the hybrid cache.
///
/// Owns the invalidation listener, the local cleanup task and the background
/// dispatcher. Call [`CacheManager::shutdown`] to stop them; dropping the
/// manager only signals the tasks.
pub struct CacheManager {
    cache: HybridCache,
    locks: LockManager,
    dispatcher: Dispatcher,
    config: AppConfig,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheManager {
    pub fn builder() -> CacheManagerBuilder {
        CacheManagerBuilder::new()
    }

    /// Build the stack described by `config`.
    ///
    /// Uses Redis when enabled and reachable, the in-process tier otherwise.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        CacheManagerBuilder::new()
            .with_config(config.clone())
            .build()
            .await
    }

    fn assemble(
        config: AppConfig,
        distributed: Arc<dyn DistributedTier>,
        backplane: Arc<dyn Backplane>,
        instance_id: Uuid,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let local = Arc::new(LocalTier::new(config.cache.local_capacity));
        let dispatcher = Dispatcher::start(
            config.background.workers,
            config.background.queue_capacity,
        );

        let cache = HybridCache::new(
            Arc::clone(&local),
            Arc::clone(&distributed),
            Arc::clone(&backplane),
            dispatcher.clone(),
            HybridOptions::from_config(&config.cache, instance_id),
        );
        let locks = LockManager::new(Arc::clone(&distributed), config.lock.expiry());

        let listener = backplane.start_listener(
            InvalidationListener::new(instance_id, Arc::clone(&local)),
            shutdown_rx.clone(),
        );
        let cleanup = spawn_cleanup(local, config.cache.cleanup_interval(), shutdown_rx);

        tracing::info!(
            instance_id = %instance_id,
            distributed = distributed.name(),
            backplane = backplane.name(),
            failure_policy = %config.cache.failure_policy,
            "Hybrid cache started"
        );

        Self {
            cache,
            locks,
            dispatcher,
            config,
            shutdown_tx,
            tasks: Mutex::new(vec![listener, cleanup]),
        }
    }

    pub fn cache(&self) -> &HybridCache {
        &self.cache
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn instance_id(&self) -> Uuid {
        self.cache.instance_id()
    }

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
        self.cache.get_or_compute(key, ttl, loader).await
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.cache.get(key).await
    }

    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.cache.set(key, value, ttl).await
    }

    pub async fn remove(&self, key: &str) -> Result<bool> {
        self.cache.remove(key).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.cache.exists(key).await
    }

    pub fn remove_by_prefix(&self, prefix: &str) -> Result<Completion> {
        self.cache.remove_by_prefix(prefix)
    }

    pub fn clear(&self) -> Result<Completion> {
        self.cache.clear()
    }

    pub async fn try_acquire_and_run<F, Fut>(
        &self,
        key: &str,
        expiration: Option<Duration>,
        action: F,
    ) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        self.locks.try_acquire_and_run(key, expiration, action).await
    }

    pub async fn try_acquire(
        &self,
        key: &str,
        expiration: Option<Duration>,
    ) -> Result<Option<LockLease>> {
        self.locks.try_acquire(key, expiration).await
    }

    pub fn stats(&self) -> HybridStats {
        self.cache.stats()
    }

    /// Stop background tasks and drain queued jobs.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.dispatcher.shutdown().await;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "cache task terminated abnormally");
            }
        }
        tracing::info!(instance_id = %self.instance_id(), "Hybrid cache stopped");
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Periodically purge expired local entries.
fn spawn_cleanup(
    local: Arc<LocalTier>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = local.cleanup_expired();
                    metrics::set_cache_entries("local", local.len());
                    if removed > 0 {
                        tracing::debug!(removed, "purged expired local entries");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("local cleanup task stopped");
    })
}

/// Builder for [`CacheManager`].
///
/// Explicit tiers take precedence over what the configuration describes.
#[derive(Default)]
pub struct CacheManagerBuilder {
    config: AppConfig,
    distributed: Option<Arc<dyn DistributedTier>>,
    backplane: Option<Arc<dyn Backplane>>,
    instance_id: Option<Uuid>,
}

impl CacheManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_distributed(mut self, distributed: Arc<dyn DistributedTier>) -> Self {
        self.distributed = Some(distributed);
        self
    }

    pub fn with_backplane(mut self, backplane: Arc<dyn Backplane>) -> Self {
        self.backplane = Some(backplane);
        self
    }

    pub fn with_instance_id(mut self, instance_id: Uuid) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    pub async fn build(self) -> Result<CacheManager> {
        self.config
            .validate()
            .map_err(|e| CacheError::configuration(e.to_string()))?;

        let (distributed, backplane) = match self.distributed {
            Some(distributed) => {
                let backplane = self
                    .backplane
                    .unwrap_or_else(|| Arc::new(MemoryBackplane::new()));
                (distributed, backplane)
            }
            None => {
                let (distributed, backplane) = connect_distributed(&self.config).await?;
                (distributed, self.backplane.unwrap_or(backplane))
            }
        };

        let instance_id = self.instance_id.unwrap_or_else(Uuid::new_v4);
        Ok(CacheManager::assemble(
            self.config,
            distributed,
            backplane,
            instance_id,
        ))
    }
}

type Stack = (Arc<dyn DistributedTier>, Arc<dyn Backplane>);

fn in_process_stack() -> Stack {
    (
        Arc::new(MemoryDistributedTier::new()),
        Arc::new(MemoryBackplane::new()),
    )
}

/// Create the distributed tier and backplane described by `config`.
///
/// ## Graceful Degradation
///
/// If Redis cannot be reached and the failure policy is `degrade`, the
/// in-process tier is used instead so the service can start without Redis.
pub async fn connect_distributed(config: &AppConfig) -> Result<Stack> {
    let redis = &config.redis;
    if !redis.enabled {
        tracing::info!("Redis disabled, using in-process distributed tier");
        return Ok(in_process_stack());
    }

    tracing::info!(url = %redis.url, "Connecting to Redis");

    let pool = match create_pool(redis) {
        Ok(pool) => pool,
        Err(e) => return fall_back(config.cache.failure_policy, e),
    };

    let tier = RedisTier::from_config(pool.clone(), redis);
    if let Err(e) = tier.ping().await {
        return fall_back(config.cache.failure_policy, e);
    }

    tracing::info!("Connected to Redis");
    let backplane = RedisBackplane::new(pool, redis.url.clone(), redis.invalidation_channel.clone());
    Ok((Arc::new(tier), Arc::new(backplane)))
}

fn fall_back(policy: FailurePolicy, error: CacheError) -> Result<Stack> {
    match policy {
        FailurePolicy::Fail => {
            tracing::error!(error = %error, "Failed to connect to Redis");
            Err(error)
        }
        FailurePolicy::Degrade => {
            metrics::record_distributed_error("connect");
            tracing::warn!(
                error = %error,
                "Failed to connect to Redis. Falling back to in-process distributed tier."
            );
            Ok(in_process_stack())
        }
    }
}
