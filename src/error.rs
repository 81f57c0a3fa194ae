//! Error types for the Ratekeeper engine.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Ratekeeper operations.
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// Invalid limit, window or other configuration values
    #[error("Configuration error: {0}")]
    Config(String),

    /// A named rate limit type that the registry does not know
    #[error("Unknown rate limit type: {0}")]
    UnknownType(String),

    /// An algorithm name that does not map to any strategy
    #[error("Unknown rate limit algorithm: {0}")]
    UnknownAlgorithm(String),

    /// Shared state errors (only surfaced by administrative operations)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateLimitError {
    /// Whether this error is a configuration error, which is never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RateLimitError::Config(_)
                | RateLimitError::UnknownType(_)
                | RateLimitError::UnknownAlgorithm(_)
        )
    }
}

/// Errors reaching the shared key-value store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store did not answer within the configured timeout
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// Connection or backend failure
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A value could not be encoded for the store
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Compare-and-swap kept losing against concurrent writers; the check is denied
    #[error("gave up on key {key} after {attempts} conflicting writes")]
    ContentionExhausted { key: String, attempts: u32 },
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
