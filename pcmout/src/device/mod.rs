//! Device sink abstraction
//!
//! A [`DeviceSink`] is the hardware side of an output session: it accepts
//! interleaved PCM frames without blocking, reports how many frames it can
//! take right now, and exposes poll(2) descriptors that become ready when
//! more room appears.
//!
//! The crate provides two sinks:
//!
//! - [`MockDevice`]: scripted headroom and failure injection for tests
//! - [`ClockDevice`]: simulated hardware consuming frames in real time
//!
//! # Implementation Notes
//!
//! - All methods take `&mut self`; sessions serialize every call through
//!   their state mutex, so implementations need no internal locking
//! - `write` and `available_write_headroom` must not block
//! - `recover` is only expected to clear transient faults
//!   ([`DeviceError::is_transient`]); anything else should be returned as-is

mod clock;
mod mock;

pub use clock::ClockDevice;
pub use mock::{MockCounters, MockDevice};

use crate::error::DeviceError;
use crate::format::{SampleFormat, StreamFormat};
use nix::poll::PollFlags;
use std::os::fd::RawFd;
use tracing::warn;

/// One descriptor for the pump's readiness wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollDescriptor {
    pub fd: RawFd,
    pub events: PollFlags,
}

/// Hardware audio sink used by the pump
pub trait DeviceSink: Send + 'static {
    /// Human-readable name for logging
    fn name(&self) -> &str;

    /// Whether `open` can accept this sample format
    fn supports_format(&self, _format: SampleFormat) -> bool {
        true
    }

    /// Open the device for playback of `format`
    fn open(&mut self, format: &StreamFormat) -> Result<(), DeviceError>;

    /// Request a hardware buffer close to `us` microseconds; returns the actual size
    fn set_buffer_time_near(&mut self, us: u32) -> Result<u32, DeviceError>;

    /// Request a period close to `us` microseconds; returns the actual size
    fn set_period_time_near(&mut self, us: u32) -> Result<u32, DeviceError>;

    /// Commit the negotiated parameters
    fn apply_hw_params(&mut self) -> Result<(), DeviceError>;

    /// Write whole frames from `data`; returns frames accepted (may be fewer)
    fn write(&mut self, data: &[u8]) -> Result<usize, DeviceError>;

    /// Frames that can be written without blocking
    fn available_write_headroom(&mut self) -> Result<usize, DeviceError>;

    /// Reset after a transient fault
    fn recover(&mut self, error: &DeviceError) -> Result<(), DeviceError>;

    /// Make the device ready to start on the next write
    fn prepare(&mut self) -> Result<(), DeviceError>;

    /// Stop immediately, discarding frames queued in hardware
    fn drop_pending(&mut self) -> Result<(), DeviceError>;

    /// Pause or resume playback in hardware
    fn pause(&mut self, pause: bool) -> Result<(), DeviceError>;

    /// Frames written but not yet audible
    fn query_delay(&mut self) -> Result<usize, DeviceError>;

    /// Release the device
    fn close(&mut self);

    /// Descriptors that become ready when the device can take more frames
    ///
    /// An empty list makes the pump fall back to timed waits.
    fn poll_descriptors(&self) -> Vec<PollDescriptor>;
}

/// Run `op`; on failure call `recover()` once and retry once
pub(crate) fn with_recover<D, T>(
    device: &mut D,
    mut op: impl FnMut(&mut D) -> Result<T, DeviceError>,
) -> Result<T, DeviceError>
where
    D: DeviceSink + ?Sized,
{
    match op(device) {
        Ok(value) => Ok(value),
        Err(err) => {
            warn!("Device error on {}: {}; attempting recovery", device.name(), err);
            device.recover(&err)?;
            op(device)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_recover_retries_once() {
        let mut device = MockDevice::new();
        device.open(&StreamFormat::new(SampleFormat::S16Le, 2, 44100)).unwrap();
        device.set_unlimited_headroom(true);
        device.fail_next_writes(1);

        let written = with_recover(&mut device, |d| d.write(&[0u8; 8])).unwrap();
        assert_eq!(written, 2);
        assert_eq!(device.counters().recovers, 1);
    }

    #[test]
    fn test_with_recover_gives_up_after_retry() {
        let mut device = MockDevice::new();
        device.open(&StreamFormat::new(SampleFormat::S16Le, 2, 44100)).unwrap();
        device.set_unlimited_headroom(true);
        device.fail_next_writes(2);

        let err = with_recover(&mut device, |d| d.write(&[0u8; 8])).unwrap_err();
        assert_eq!(err, DeviceError::Xrun);
        assert_eq!(device.counters().recovers, 1);
        assert!(device.captured().is_empty());
    }
}
