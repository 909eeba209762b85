//! Error types for the Tollgate admission core.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Non-positive capacity, refill rate, or token request
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A rule references a time unit other than second/minute/hour/day
    #[error("Unconfigured time unit: {0}")]
    UnconfiguredTimeUnit(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
