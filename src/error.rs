//! Error types for Tollgate.

use thiserror::Error;

use crate::ratelimit::RateLimitExceeded;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Unknown scope or an invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Anonymous caller without any usable origin identifier
    #[error("Identity required: {0}")]
    IdentityRequired(String),

    /// The counter store or the entitlement service failed
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    /// Entitlement archived or without a rate limit
    #[error("No access: {0}")]
    NoAccess(String),

    /// Quota exhausted for the current window
    #[error(transparent)]
    RateLimitExceeded(#[from] RateLimitExceeded),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    /// Whether the same request may succeed if retried later.
    ///
    /// Identity, configuration and access errors are caller-input errors and
    /// will fail again until the caller changes something.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TollgateError::RateLimitExceeded(_) | TollgateError::Infrastructure(_)
        )
    }

    /// The instant after which a rate limited request may be retried.
    pub fn retry_after(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        match self {
            TollgateError::RateLimitExceeded(exceeded) => Some(exceeded.retry_after),
            _ => None,
        }
    }
}

impl From<redis::RedisError> for TollgateError {
    fn from(err: redis::RedisError) -> Self {
        TollgateError::Infrastructure(format!("counter store: {err}"))
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
