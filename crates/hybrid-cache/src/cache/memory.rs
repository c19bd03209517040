//! In-process distributed tier.
//!
//! Behaves like the Redis tier (expired records are invisible, check-and-set
//! and compare-and-delete are atomic) but lives in the current process. Used
//! for single-instance deployments, as the fallback when Redis is unreachable
//! and in tests, where several managers can share one instance to simulate a
//! farm of processes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use hybrid_cache_core::{CacheTier, CachedEntry, DistributedTier, Result, is_lock_key};

/// Shared in-memory store implementing [`DistributedTier`].
#[derive(Clone, Default)]
pub struct MemoryDistributedTier {
    entries: Arc<DashMap<String, CachedEntry>>,
}

impl MemoryDistributedTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired records, mirroring Redis key expiry.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl CacheTier for MemoryDistributedTier {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<CachedEntry>> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Ok(Some(entry.value().clone()));
            }
            drop(entry);
            self.entries.remove_if(key, |_, entry| entry.is_expired());
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Arc<Vec<u8>>, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), CachedEntry::new(value, ttl));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired()))
    }

    async fn remove_by_prefix(&self, prefix: &str) -> Result<u64> {
        let mut removed = 0;
        self.entries.retain(|key, entry| {
            if key.starts_with(prefix) && !is_lock_key(key) {
                if !entry.is_expired() {
                    removed += 1;
                }
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    /// Lock records survive; they are released by their holder or expire.
    async fn remove_all(&self) -> Result<u64> {
        let expired = self.purge_expired();
        let mut live = 0;
        self.entries.retain(|key, _| {
            if is_lock_key(key) {
                true
            } else {
                live += 1;
                false
            }
        });
        tracing::trace!(expired, live, "cleared in-memory distributed tier");
        Ok(live)
    }
}

#[async_trait]
impl DistributedTier for MemoryDistributedTier {
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let entry = CachedEntry::new(Arc::new(value.to_vec()), ttl);
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(entry);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(true)
            }
        }
    }

    async fn remove_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        Ok(self
            .entries
            .remove_if(key, |_, entry| {
                !entry.is_expired() && entry.data.as_slice() == expected
            })
            .is_some())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
