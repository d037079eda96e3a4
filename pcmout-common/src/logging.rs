//! Logging initialization
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter`. `RUST_LOG`
//! wins over the configured level so a single run can be made more verbose
//! without editing the config file.

use crate::{Error, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber
///
/// # Errors
/// Returns `Error::Logging` if a global subscriber is already installed.
pub fn init(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))
}
