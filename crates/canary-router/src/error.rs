//! Router adapter error types.

use thiserror::Error;

/// Result type alias for router operations.
pub type RouterResult<T> = Result<T, RouterError>;

/// Errors raised while applying a traffic split.
///
/// Every variant leaves the previously applied configuration in effect.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid split {stable}/{canary}: weights must sum to 100")]
    InvalidSplit { stable: u8, canary: u8 },

    #[error("no upstream configured for service {0}")]
    UnknownService(String),

    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config validation failed: {0}")]
    Validation(String),

    #[error("proxy reload failed: {0}")]
    Reload(String),
}
