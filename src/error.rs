//! Error types for gateway-throttle.

use thiserror::Error;

/// Main error type for gateway-throttle operations.
///
/// Running out of rate budget is deliberately absent: it only ever delays a
/// payload and is never reported to callers.
#[derive(Error, Debug)]
pub enum ThrottleError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A limiter was built with a budget that can never admit anything
    #[error("Invalid rate limit: capacity {capacity} per {refill_period_ms}ms")]
    InvalidLimit {
        /// Units granted per refill window.
        capacity: u64,
        /// Length of the refill window in milliseconds.
        refill_period_ms: u64,
    },

    /// Layered configuration source errors
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for gateway-throttle operations.
pub type Result<T> = std::result::Result<T, ThrottleError>;
