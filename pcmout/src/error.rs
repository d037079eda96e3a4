//! Error types for pcmout
//!
//! Three layers, from the hardware up:
//! - [`DeviceError`]: transient device faults, recovered inside the pump
//! - [`OpenError`]: fatal failures while opening a session
//! - [`Error`]: session-level errors surfaced by the next API call

use crate::format::SampleFormat;
use thiserror::Error;

/// Device-level error reported by a [`DeviceSink`](crate::DeviceSink)
///
/// Cloneable so a fatal error can be stored in the session and reported to
/// every later caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Buffer underrun/overrun; recoverable with `recover()`
    #[error("buffer underrun (xrun)")]
    Xrun,

    /// Device suspended by power management; recoverable with `recover()`
    #[error("device suspended")]
    Suspended,

    /// Operation invalid in the device's current state
    #[error("device in wrong state: {0}")]
    BadState(String),

    /// Operation not supported by this device
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// Any other backend failure
    #[error("device I/O error: {0}")]
    Io(String),
}

impl DeviceError {
    /// True for faults a `recover()` call is expected to clear
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::Xrun | DeviceError::Suspended)
    }
}

/// Errors returned by [`OutputSession::open`](crate::OutputSession::open)
#[derive(Error, Debug)]
pub enum OpenError {
    #[error("Unsupported audio format: {0:?}")]
    UnsupportedFormat(SampleFormat),

    #[error("Invalid stream parameters: {0}")]
    InvalidParameters(String),

    #[error("Failed to open device: {0}")]
    DeviceOpenFailed(DeviceError),

    #[error("Failed to configure device: {0}")]
    DeviceConfigFailed(DeviceError),

    /// Wake pipe or pump thread could not be created
    #[error("Failed to allocate session resources: {0}")]
    Resource(#[from] std::io::Error),
}

/// Session-level errors
#[derive(Error, Debug)]
pub enum Error {
    /// The pump gave up after repeated device failures; only `close()` remains useful
    #[error("Audio device failed: {0}")]
    DeviceFailed(DeviceError),

    /// Operation not valid in the session's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Pump thread could not be restarted
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using pcmout Error
pub type Result<T> = std::result::Result<T, Error>;
