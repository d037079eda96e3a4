//! Common error types for pcmout

use thiserror::Error;

/// Common result type for pcmout configuration and setup
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading configuration or initializing logging
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML syntax or schema error
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Logging subscriber could not be installed
    #[error("Logging error: {0}")]
    Logging(String),
}
