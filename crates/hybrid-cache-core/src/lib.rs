pub mod entry;
pub mod error;
pub mod key;
pub mod tier;

pub use entry::{CachedEntry, LockRecord};
pub use error::{CacheError, ErrorCategory, Result};
pub use key::{
    LOCK_KEY_PREFIX, MAX_KEY_LENGTH, is_lock_key, lock_key_for, validate_cache_key, validate_key,
};
pub use tier::{CacheTier, DistributedTier};
