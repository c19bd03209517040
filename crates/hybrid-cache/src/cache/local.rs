//! Local (L1) tier: in-process DashMap with TTL expiry and a capacity bound.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use hybrid_cache_core::{CacheTier, CachedEntry, Result};
use tokio::time::Instant;

/// A full tier evicts `capacity / EVICTION_BATCH_DIVISOR` live entries at once.
const EVICTION_BATCH_DIVISOR: usize = 10;

/// In-memory cache tier, one per process.
///
/// Entries expire by TTL only. When the map reaches its capacity, expired
/// entries are purged first and then a batch of the entries closest to expiry
/// is evicted to make room. Concurrent inserts may overshoot the bound by a
/// few entries.
pub struct LocalTier {
    entries: DashMap<String, CachedEntry>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl LocalTier {
    /// Create a new local tier holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get a live value.
    ///
    /// Expired entries are removed on the way out.
    pub fn get_fresh(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        self.get_entry(key).map(|entry| entry.data)
    }

    /// Get a live value without touching statistics or purging.
    pub fn peek(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| Arc::clone(&entry.data))
    }

    /// Get a live entry including its expiry.
    pub fn get_entry(&self, key: &str) -> Option<CachedEntry> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value().clone());
            }
            // Remove expired entry
            drop(entry);
            if self
                .entries
                .remove_if(key, |_, entry| entry.is_expired())
                .is_some()
            {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert a value expiring after `ttl`.
    pub fn insert(&self, key: &str, data: Arc<Vec<u8>>, ttl: Duration) {
        if !self.entries.contains_key(key) && self.entries.len() >= self.capacity {
            self.make_room();
        }
        self.entries
            .insert(key.to_string(), CachedEntry::new(data, ttl));
    }

    /// Remove an entry. Returns `true` if it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Check if a live entry exists without touching hit statistics.
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired())
    }

    /// Remove every entry whose key starts with `prefix`.
    pub fn remove_by_prefix(&self, prefix: &str) -> u64 {
        let mut removed = 0;
        self.entries.retain(|key, _| {
            if key.starts_with(prefix) {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Remove every entry.
    pub fn clear(&self) -> u64 {
        let removed = self.entries.len() as u64;
        self.entries.clear();
        removed
    }

    /// Clean up expired entries.
    ///
    /// Called by the periodic cleanup task. Returns the number of removed
    /// entries.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        self.entries.retain(|_, entry| {
            if entry.is_expired_at(now) {
                removed += 1;
                false
            } else {
                true
            }
        });

        if removed > 0 {
            self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        }

        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get local tier statistics.
    pub fn stats(&self) -> LocalStats {
        LocalStats {
            entries: self.entries.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Free at least one slot.
    ///
    /// Purges expired entries first. If that is not enough, evicts a batch of
    /// live entries closest to expiry so the next inserts do not rescan the
    /// whole map.
    fn make_room(&self) {
        if self.cleanup_expired() > 0 && self.entries.len() < self.capacity {
            return;
        }

        let excess = (self.entries.len() + 1).saturating_sub(self.capacity);
        let batch = (self.capacity / EVICTION_BATCH_DIVISOR).max(excess);

        // Iterator guards must be gone before removing.
        let mut candidates: Vec<(Option<Instant>, String)> = self
            .entries
            .iter()
            .map(|entry| (entry.value().expires_at, entry.key().clone()))
            .collect();
        let batch = batch.min(candidates.len());
        if batch == 0 {
            return;
        }
        // Entries without expiry go last
        let order = |candidate: &(Option<Instant>, String)| (candidate.0.is_none(), candidate.0);
        if batch < candidates.len() {
            candidates.select_nth_unstable_by_key(batch - 1, order);
            candidates.truncate(batch);
        }

        let mut evicted = 0u64;
        for (_, key) in candidates {
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
        tracing::trace!(evicted, "evicted local entries closest to expiry");
    }
}

#[async_trait]
impl CacheTier for LocalTier {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<CachedEntry>> {
        Ok(self.get_entry(key))
    }

    async fn set(&self, key: &str, value: Arc<Vec<u8>>, ttl: Duration) -> Result<()> {
        self.insert(key, value, ttl);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(LocalTier::remove(self, key))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.contains(key))
    }

    async fn remove_by_prefix(&self, prefix: &str) -> Result<u64> {
        Ok(LocalTier::remove_by_prefix(self, prefix))
    }

    async fn remove_all(&self) -> Result<u64> {
        Ok(self.clear())
    }
}

/// Local tier statistics.
#[derive(Debug, Clone, Default)]
pub struct LocalStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl LocalStats {
    /// Calculate hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}
