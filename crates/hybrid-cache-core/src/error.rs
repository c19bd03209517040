use std::sync::Arc;

use thiserror::Error;

/// Core error types for hybrid cache operations.
///
/// The type is `Clone` so a single loader failure can be handed to every
/// waiter of a coalesced load without re-running or re-wrapping it.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Loader failed for key '{key}': {error}")]
    Loader {
        key: String,
        error: Arc<anyhow::Error>,
    },

    #[error("Locked action failed for key '{key}': {error}")]
    LockAction {
        key: String,
        error: Arc<anyhow::Error>,
    },

    #[error("Distributed tier {operation} failed: {message}")]
    Distributed { operation: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Background queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Background dispatcher is shut down")]
    DispatcherClosed,

    #[error("Background job '{0}' was dropped before it completed")]
    JobAbandoned(String),
}

impl CacheError {
    /// Create a new InvalidKey error
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey(message.into())
    }

    /// Create a new InvalidArgument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Wrap a loader failure for the given key
    pub fn loader(key: impl Into<String>, error: anyhow::Error) -> Self {
        Self::Loader {
            key: key.into(),
            error: Arc::new(error),
        }
    }

    /// Wrap a failure of an action executed under a distributed lock
    pub fn lock_action(key: impl Into<String>, error: anyhow::Error) -> Self {
        Self::LockAction {
            key: key.into(),
            error: Arc::new(error),
        }
    }

    /// Create a new Distributed error for a failed tier operation
    pub fn distributed(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Distributed {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Create a new Serialization error
    pub fn serialization(message: impl std::fmt::Display) -> Self {
        Self::Serialization(message.to_string())
    }

    /// Create a new Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Check if this error was caused by the caller (bad key or argument)
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidKey(_) | Self::InvalidArgument(_))
    }

    /// Check if retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Distributed { .. } | Self::QueueFull { .. })
    }

    /// Get error category for logging/monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidKey(_) | Self::InvalidArgument(_) => ErrorCategory::Validation,
            Self::Loader { .. } => ErrorCategory::Loader,
            Self::LockAction { .. } => ErrorCategory::Lock,
            Self::Distributed { .. } => ErrorCategory::Distributed,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::QueueFull { .. } | Self::DispatcherClosed | Self::JobAbandoned(_) => {
                ErrorCategory::Background
            }
        }
    }
}

/// Error categories for monitoring and classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Loader,
    Lock,
    Distributed,
    Serialization,
    Configuration,
    Background,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Loader => write!(f, "loader"),
            Self::Lock => write!(f, "lock"),
            Self::Distributed => write!(f, "distributed"),
            Self::Serialization => write!(f, "serialization"),
            Self::Configuration => write!(f, "configuration"),
            Self::Background => write!(f, "background"),
        }
    }
}

/// Convenience result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
