//! # pcmout Common Library
//!
//! Shared code for the pcmout workspace:
//! - Configuration loading (TOML bootstrap file + built-in defaults)
//! - Logging initialization
//! - Common error type

pub mod config;
pub mod error;
pub mod logging;

pub use config::{LoggingConfig, OutputConfig, TimerWorkaroundConfig};
pub use error::{Error, Result};
