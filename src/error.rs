//! Error types for Tollgate.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The limiter has been shut down and no longer admits callers
    #[error("Limiter closed")]
    Closed,

    /// A bounded acquire gave up before a token became available
    #[error("Timed out after {0:?} waiting for a token")]
    Timeout(Duration),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
