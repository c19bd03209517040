//! Cross-instance invalidation backplane.
//!
//! Every write through the hybrid cache publishes an [`InvalidationMessage`].
//! Each instance runs an [`InvalidationListener`] that evicts the named keys
//! from its local tier so stale copies do not outlive a change made elsewhere.
//!
//! ```text
//! Instance 1: cache.set("user:42", ..)
//!   ↓
//! PUBLISH cache:invalidate {"origin":"<id-1>","scope":{"kind":"key","value":"user:42"}}
//!   ↓
//! Instance 2: listener removes "user:42" from L1
//! Instance 1: listener ignores its own message
//! ```
//!
//! Delivery is best effort. When a listener may have missed messages (Redis
//! reconnect, lagging broadcast receiver) it drops the whole local tier.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use hybrid_cache_core::{CacheError, Result};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::local::LocalTier;
use crate::metrics;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// What an invalidation message covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum InvalidationScope {
    Key(String),
    Prefix(String),
    All,
}

impl InvalidationScope {
    /// Metric label for this scope.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Key(_) => "key",
            Self::Prefix(_) => "prefix",
            Self::All => "all",
        }
    }
}

/// Message exchanged on the invalidation channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    /// Instance that made the change.
    pub origin: Uuid,
    pub scope: InvalidationScope,
}

impl InvalidationMessage {
    pub fn new(origin: Uuid, scope: InvalidationScope) -> Self {
        Self { origin, scope }
    }

    /// Evict what this message covers from `local`.
    ///
    /// Returns the number of removed entries.
    pub fn apply(&self, local: &LocalTier) -> u64 {
        match &self.scope {
            InvalidationScope::Key(key) => u64::from(local.remove(key)),
            InvalidationScope::Prefix(prefix) => local.remove_by_prefix(prefix),
            InvalidationScope::All => local.clear(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(CacheError::serialization)
    }

    pub fn from_json(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(CacheError::serialization)
    }
}

/// Receiving side of the backplane, bound to one instance's local tier.
#[derive(Clone)]
pub struct InvalidationListener {
    instance_id: Uuid,
    local: Arc<LocalTier>,
}

impl InvalidationListener {
    pub fn new(instance_id: Uuid, local: Arc<LocalTier>) -> Self {
        Self { instance_id, local }
    }

    /// Apply a message unless this instance sent it.
    ///
    /// Returns `false` for our own messages.
    pub fn handle(&self, message: &InvalidationMessage) -> bool {
        if message.origin == self.instance_id {
            return false;
        }
        let removed = message.apply(&self.local);
        metrics::record_invalidation("received", message.scope.label());
        tracing::debug!(
            origin = %message.origin,
            scope = ?message.scope,
            removed,
            "applied cache invalidation"
        );
        true
    }

    /// Drop every local entry after messages may have been lost.
    pub fn resync(&self) {
        let removed = self.local.clear();
        tracing::warn!(removed, "invalidations may have been missed, cleared local tier");
    }
}

/// Publish/subscribe channel carrying invalidation messages between instances.
#[async_trait]
pub trait Backplane: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Send a message to every other instance.
    async fn publish(&self, message: &InvalidationMessage) -> Result<()>;

    /// Spawn a task delivering incoming messages to `listener` until
    /// `shutdown` flips to `true`.
    fn start_listener(
        &self,
        listener: InvalidationListener,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()>;
}

/// Redis Pub/Sub backplane.
///
/// Publishing goes through the shared pool; the listener holds a dedicated
/// pub/sub connection and reconnects with exponential backoff.
#[derive(Clone)]
pub struct RedisBackplane {
    pool: Pool,
    redis_url: String,
    channel: String,
}

impl RedisBackplane {
    pub fn new(pool: Pool, redis_url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            pool,
            redis_url: redis_url.into(),
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    async fn listen(
        &self,
        listener: &InvalidationListener,
        shutdown: &mut watch::Receiver<bool>,
        reconnect: bool,
    ) -> std::result::Result<(), String> {
        use futures_util::StreamExt;

        // Dedicated client, pub/sub connections cannot go back to the pool
        let client = redis::Client::open(self.redis_url.clone())
            .map_err(|e| format!("failed to create Redis client: {e}"))?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| format!("failed to get pub/sub connection: {e}"))?;
        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| format!("failed to subscribe: {e}"))?;

        tracing::info!(channel = %self.channel, "Subscribed to invalidation channel");
        if reconnect {
            listener.resync();
        }

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(msg) => {
                        let parsed = msg
                            .get_payload::<String>()
                            .map_err(|e| e.to_string())
                            .and_then(|payload| {
                                InvalidationMessage::from_json(&payload).map_err(|e| e.to_string())
                            });
                        match parsed {
                            Ok(message) => {
                                listener.handle(&message);
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "failed to parse invalidation message payload");
                            }
                        }
                    }
                    None => return Err("pub/sub connection closed".to_string()),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Backplane for RedisBackplane {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, message: &InvalidationMessage) -> Result<()> {
        let payload = message.to_json()?;
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::distributed("PUBLISH", e))?;
        conn.publish::<_, _, ()>(&self.channel, payload)
            .await
            .map_err(|e| CacheError::distributed("PUBLISH", e))?;

        metrics::record_invalidation("published", message.scope.label());
        tracing::debug!(channel = %self.channel, scope = ?message.scope, "published cache invalidation");
        Ok(())
    }

    fn start_listener(
        &self,
        listener: InvalidationListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let backplane = self.clone();
        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            let mut reconnect = false;

            loop {
                if *shutdown.borrow() {
                    break;
                }
                match backplane.listen(&listener, &mut shutdown, reconnect).await {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "Cache invalidation listener error, reconnecting..."
                        );
                        reconnect = true;
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            changed = shutdown.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }

            tracing::info!("Cache invalidation listener stopped");
        })
    }
}

/// In-process backplane on a tokio broadcast channel.
///
/// Clones share the channel, so managers built from clones of the same
/// backplane see each other's invalidations.
#[derive(Clone)]
pub struct MemoryBackplane {
    sender: broadcast::Sender<InvalidationMessage>,
}

impl MemoryBackplane {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Number of attached listeners.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MemoryBackplane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backplane for MemoryBackplane {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, message: &InvalidationMessage) -> Result<()> {
        // No subscribers is not an error
        let receivers = self.sender.send(message.clone()).unwrap_or(0);
        metrics::record_invalidation("published", message.scope.label());
        tracing::trace!(receivers, scope = ?message.scope, "published cache invalidation");
        Ok(())
    }

    fn start_listener(
        &self,
        listener: InvalidationListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut receiver = self.sender.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = receiver.recv() => match message {
                        Ok(message) => {
                            listener.handle(&message);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "invalidation listener lagged");
                            listener.resync();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
