//! Cache key helpers.

use crate::error::{CacheError, Result};

/// Prefix under which lock records live in the distributed tier.
pub const LOCK_KEY_PREFIX: &str = "lock:";

/// Longest key accepted by the cache.
pub const MAX_KEY_LENGTH: usize = 1024;

/// Validate a cache key.
///
/// Keys must be non-empty, at most [`MAX_KEY_LENGTH`] bytes and free of
/// whitespace and control characters so they survive the Redis protocol and
/// `SCAN MATCH` patterns unchanged.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::invalid_key("key must not be empty"));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(CacheError::invalid_key(format!(
            "key is {} bytes, limit is {MAX_KEY_LENGTH}",
            key.len()
        )));
    }
    if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(CacheError::invalid_key(format!(
            "key '{}' contains whitespace or control characters",
            key.escape_debug()
        )));
    }
    Ok(())
}

/// Validate a key used for cached values.
///
/// Same rules as [`validate_key`], and the lock namespace is off limits so
/// cache reads and writes can never touch a lock record.
pub fn validate_cache_key(key: &str) -> Result<()> {
    validate_key(key)?;
    if is_lock_key(key) {
        return Err(CacheError::invalid_key(format!(
            "key '{key}' is reserved for locks (prefix '{LOCK_KEY_PREFIX}')"
        )));
    }
    Ok(())
}

/// Whether `key` names a lock record.
#[inline]
pub fn is_lock_key(key: &str) -> bool {
    key.starts_with(LOCK_KEY_PREFIX)
}

/// Key of the lock record guarding `key`.
#[inline]
pub fn lock_key_for(key: &str) -> String {
    format!("{LOCK_KEY_PREFIX}{key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("user:42").is_ok());
        assert!(validate_key("Nop.pres.active-1").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("has space").is_err());
        assert!(validate_key("tab\there").is_err());
        assert!(validate_key(&"k".repeat(MAX_KEY_LENGTH)).is_ok());
        assert!(validate_key(&"k".repeat(MAX_KEY_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_lock_key_for() {
        assert_eq!(lock_key_for("reindex"), "lock:reindex");
        assert!(is_lock_key(&lock_key_for("reindex")));
        assert!(!is_lock_key("locker:1"));
    }

    #[test]
    fn test_cache_keys_exclude_lock_namespace() {
        assert!(validate_cache_key("user:42").is_ok());
        assert!(validate_cache_key("locker:1").is_ok());
        assert!(matches!(
            validate_cache_key("lock:job"),
            Err(CacheError::InvalidKey(_))
        ));
        assert!(validate_cache_key("").is_err());
    }
}
