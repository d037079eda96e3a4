//! Output configuration loading
//!
//! Configuration is a small TOML bootstrap file. Every field has a built-in
//! default, so a missing file is not an error: the loader logs a warning and
//! continues with defaults.
//!
//! # Resolution Order
//!
//! 1. Explicit path (command-line argument, highest priority)
//! 2. `PCMOUT_CONFIG` environment variable
//! 3. User config file (`~/.config/pcmout/config.toml` on Linux)
//! 4. System config file (`/etc/pcmout/config.toml`)
//! 5. Built-in defaults
//!
//! An explicitly named file that is missing or malformed IS an error; the
//! search locations in 3-4 are only used when present.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "PCMOUT_CONFIG";

/// Output configuration
///
/// ```toml
/// pcm = "default"
/// buffer_ms = 500
///
/// [timer_workaround]
/// wakeup_threshold = 4
/// sleep_fraction = 0.6
///
/// [logging]
/// level = "info"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// PCM device name handed to the device backend
    pub pcm: String,

    /// Total requested output buffer in milliseconds
    ///
    /// Split between the hardware buffer and the software ring buffer at open.
    pub buffer_ms: u32,

    /// Fallback policy for drivers with unreliable poll() readiness
    pub timer_workaround: TimerWorkaroundConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Timer workaround policy
///
/// Some drivers report poll() readiness without actually having room for
/// more frames. After `wakeup_threshold` consecutive wakeups without a
/// successful write, the pump stops trusting poll() and sleeps for
/// `sleep_fraction` of a period between attempts instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerWorkaroundConfig {
    pub wakeup_threshold: u32,
    pub sleep_fraction: f32,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or EnvFilter directive (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            pcm: "default".to_string(),
            buffer_ms: 500,
            timer_workaround: TimerWorkaroundConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for TimerWorkaroundConfig {
    fn default() -> Self {
        Self {
            wakeup_threshold: 4,
            sleep_fraction: 0.6,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl OutputConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: OutputConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Resolve configuration following the documented priority order
    ///
    /// # Errors
    /// - Explicit path (argument or `PCMOUT_CONFIG`) missing or invalid
    /// - A discovered config file exists but is invalid
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_path(path);
        }

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.is_empty() {
                return Self::load_from_path(Path::new(&path));
            }
        }

        for path in default_search_paths() {
            if path.exists() {
                info!("Using config file {}", path.display());
                return Self::load_from_path(&path);
            }
        }

        warn!("No config file found, using built-in defaults");
        Ok(Self::default())
    }

    /// Check values that serde cannot constrain
    pub fn validate(&self) -> Result<()> {
        if self.buffer_ms == 0 {
            return Err(Error::Config("buffer_ms must be greater than 0".to_string()));
        }
        if self.pcm.trim().is_empty() {
            return Err(Error::Config("pcm device name must not be empty".to_string()));
        }
        let fraction = self.timer_workaround.sleep_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(Error::Config(format!(
                "timer_workaround.sleep_fraction must be in (0, 1], got {}",
                fraction
            )));
        }
        Ok(())
    }
}

/// Platform config file locations, most specific first
pub fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("pcmout").join("config.toml"));
    }
    if cfg!(unix) {
        paths.push(PathBuf::from("/etc/pcmout/config.toml"));
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OutputConfig::default();
        assert_eq!(config.pcm, "default");
        assert_eq!(config.buffer_ms, 500);
        assert_eq!(config.timer_workaround.wakeup_threshold, 4);
        assert!((config.timer_workaround.sleep_fraction - 0.6).abs() < f32::EPSILON);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let config = OutputConfig::from_toml_str("buffer_ms = 800\n").unwrap();
        assert_eq!(config.buffer_ms, 800);
        assert_eq!(config.pcm, "default");
        assert_eq!(config.timer_workaround, TimerWorkaroundConfig::default());
    }

    #[test]
    fn test_nested_tables() {
        let doc = r#"
            pcm = "hw:0,0"

            [timer_workaround]
            wakeup_threshold = 10
            sleep_fraction = 0.25

            [logging]
            level = "debug"
        "#;
        let config = OutputConfig::from_toml_str(doc).unwrap();
        assert_eq!(config.pcm, "hw:0,0");
        assert_eq!(config.timer_workaround.wakeup_threshold, 10);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let err = OutputConfig::from_toml_str("buffer_ms = 0").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_sleep_fraction_range() {
        let doc = "[timer_workaround]\nsleep_fraction = 1.5\n";
        assert!(OutputConfig::from_toml_str(doc).is_err());

        let doc = "[timer_workaround]\nsleep_fraction = 0.0\n";
        assert!(OutputConfig::from_toml_str(doc).is_err());
    }

    #[test]
    fn test_malformed_toml() {
        let err = OutputConfig::from_toml_str("buffer_ms = \"lots\"").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }
}
