//! Entries stored by the cache tiers.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

/// A cached value with its expiry.
///
/// The data is wrapped in `Arc` so tier hits hand out the same buffer
/// without copying it. `expires_at` is `None` only for distributed entries
/// written without a TTL by some other client.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub data: Arc<Vec<u8>>,
    pub expires_at: Option<Instant>,
}

impl CachedEntry {
    /// Create a new entry expiring `ttl` from now.
    pub fn new(data: Arc<Vec<u8>>, ttl: Duration) -> Self {
        Self {
            data,
            expires_at: Some(Instant::now() + ttl),
        }
    }

    /// Create an entry that never expires on its own.
    pub fn persistent(data: Arc<Vec<u8>>) -> Self {
        Self {
            data,
            expires_at: None,
        }
    }

    /// Check if this entry has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Time left before expiry, `None` when the entry has no expiry.
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// A lock held in the distributed tier.
///
/// The token is what the holder stored under the lock key; release only
/// deletes the record while it still carries this token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockRecord {
    pub key: String,
    pub token: String,
    pub expires_at: Instant,
}

impl LockRecord {
    /// Create a record for `key` with a fresh random token.
    pub fn new(key: impl Into<String>, expiration: Duration) -> Self {
        Self {
            key: key.into(),
            token: Uuid::new_v4().to_string(),
            expires_at: Instant::now() + expiration,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Instant::now()
    }
}
