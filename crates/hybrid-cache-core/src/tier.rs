//! Storage tier contracts.
//!
//! Both tiers of the hybrid cache speak [`CacheTier`]. The distributed tier
//! additionally arbitrates locks through [`DistributedTier`], which needs an
//! atomic check-and-set and a compare-and-delete.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::entry::CachedEntry;
use crate::error::Result;

/// Uniform contract shared by the local and the distributed tier.
///
/// Expired entries are never returned by `get` and never reported by
/// `exists`; whether they are physically purged on read is up to the tier.
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Short tier name used in logs and metric labels.
    fn name(&self) -> &'static str;

    /// Get a live entry.
    async fn get(&self, key: &str) -> Result<Option<CachedEntry>>;

    /// Store a value expiring after `ttl`.
    async fn set(&self, key: &str, value: Arc<Vec<u8>>, ttl: Duration) -> Result<()>;

    /// Remove an entry. Returns `true` if something was removed.
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Check if a live entry exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remove every entry whose key starts with `prefix`.
    ///
    /// Returns the number of removed entries. Lock records are never removed
    /// in bulk.
    async fn remove_by_prefix(&self, prefix: &str) -> Result<u64>;

    /// Remove every entry owned by this cache, lock records excepted.
    async fn remove_all(&self) -> Result<u64>;
}

/// Shared store used as the source of truth across processes and as the
/// arbiter for distributed locks.
#[async_trait]
pub trait DistributedTier: CacheTier {
    /// Store `value` only if no live entry exists under `key`.
    ///
    /// Returns `true` if the value was stored. Must be atomic with respect to
    /// every other client of the store.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Remove `key` only while it still holds `expected`.
    ///
    /// Returns `true` if the entry was removed.
    async fn remove_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<()>;
}
