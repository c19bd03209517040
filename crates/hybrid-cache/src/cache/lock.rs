//! Distributed lock manager.
//!
//! Locks are records in the distributed tier stored under `lock:<key>` with a
//! random token and an expiry. Acquisition is an atomic set-if-absent, release
//! a compare-and-delete on the token, so a holder whose lease already expired
//! can never delete a lock someone else acquired since. Leases are not renewed:
//! an action running past the expiry loses mutual exclusion.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use hybrid_cache_core::{
    CacheError, DistributedTier, LockRecord, Result, lock_key_for, validate_key,
};
use tokio::time::Instant;

use crate::metrics;

/// Acquires and releases locks held in the distributed tier.
#[derive(Clone)]
pub struct LockManager {
    distributed: Arc<dyn DistributedTier>,
    default_expiry: Duration,
}

impl LockManager {
    pub fn new(distributed: Arc<dyn DistributedTier>, default_expiry: Duration) -> Self {
        Self {
            distributed,
            default_expiry,
        }
    }

    pub fn default_expiry(&self) -> Duration {
        self.default_expiry
    }

    /// Try to take the lock on `key` without waiting.
    ///
    /// Returns `None` when the lock is held by someone else. `expiration`
    /// defaults to the configured lock expiry; zero is rejected. Errors from
    /// the distributed tier are returned as they are, whatever the failure
    /// policy, since no lock can be granted without the arbiter.
    pub async fn try_acquire(
        &self,
        key: &str,
        expiration: Option<Duration>,
    ) -> Result<Option<LockLease>> {
        validate_key(key)?;
        let expiration = expiration.unwrap_or(self.default_expiry);
        if expiration.is_zero() {
            return Err(CacheError::invalid_argument(
                "lock expiration must be greater than zero",
            ));
        }

        let record = LockRecord::new(lock_key_for(key), expiration);
        let acquired = self
            .distributed
            .set_if_absent(&record.key, record.token.as_bytes(), expiration)
            .await?;
        metrics::record_lock_attempt(acquired);

        if !acquired {
            tracing::debug!(key, "lock is held elsewhere");
            return Ok(None);
        }

        tracing::debug!(key, expiration_ms = expiration.as_millis() as u64, "lock acquired");
        Ok(Some(LockLease {
            record,
            distributed: Arc::clone(&self.distributed),
            acquired_at: Instant::now(),
            released: false,
        }))
    }

    /// Run `action` only if the lock on `key` can be taken right now.
    ///
    /// Returns `Ok(false)` without running the action when the lock is held
    /// elsewhere, `Ok(true)` after the action succeeded. The lock is released
    /// whatever the action's outcome; an action error is returned as
    /// [`CacheError::LockAction`] and a panic resumes after release.
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
        let Some(lease) = self.try_acquire(key, expiration).await? else {
            return Ok(false);
        };

        let outcome = AssertUnwindSafe(action()).catch_unwind().await;

        if let Err(e) = lease.release().await {
            tracing::warn!(key, error = %e, "failed to release lock, it will expire on its own");
        }

        match outcome {
            Ok(Ok(())) => Ok(true),
            Ok(Err(error)) => Err(CacheError::lock_action(key, error)),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// A held lock.
///
/// Call [`LockLease::release`] when done. A lease dropped without release
/// is released by a spawned task when a runtime is available, otherwise the
/// record simply expires.
pub struct LockLease {
    record: LockRecord,
    distributed: Arc<dyn DistributedTier>,
    acquired_at: Instant,
    released: bool,
}

impl LockLease {
    /// Key of the lock record in the distributed tier.
    pub fn key(&self) -> &str {
        &self.record.key
    }

    pub fn token(&self) -> &str {
        &self.record.token
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Whether the lease outlived its expiration.
    pub fn is_expired(&self) -> bool {
        self.record.is_expired()
    }

    /// Release the lock if we still own it.
    ///
    /// Returns `false` when the record had already expired or been taken
    /// over by another holder.
    pub async fn release(mut self) -> Result<bool> {
        self.released = true;
        metrics::record_lock_hold(self.acquired_at.elapsed());

        let removed = self
            .distributed
            .remove_if_equals(&self.record.key, self.record.token.as_bytes())
            .await?;
        if removed {
            tracing::debug!(key = %self.record.key, "lock released");
        } else {
            metrics::record_lock_lost();
            tracing::warn!(
                key = %self.record.key,
                "lock expired before release"
            );
        }
        Ok(removed)
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let distributed = Arc::clone(&self.distributed);
        let record = self.record.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = distributed
                        .remove_if_equals(&record.key, record.token.as_bytes())
                        .await
                    {
                        tracing::warn!(key = %record.key, error = %e, "failed to release dropped lock");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(key = %record.key, "lock dropped outside a runtime, left to expire");
            }
        }
    }
}
