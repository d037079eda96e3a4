//! Mock device sink for testing without hardware
//!
//! `MockDevice` is cheaply cloneable: the session owns one clone while the
//! test keeps another to grant headroom, inject failures and inspect the
//! bytes the pump delivered.
//!
//! Headroom is explicit. Nothing is accepted until the test calls
//! [`grant`](MockDevice::grant) (or enables unlimited headroom), which makes
//! "the device accepts N frames per tick" scenarios deterministic. Each grant
//! also makes the mock's poll descriptor readable so a pump blocked in
//! poll(2) wakes up, just like a real PCM descriptor.

use super::{DeviceSink, PollDescriptor};
use crate::error::DeviceError;
use crate::format::{SampleFormat, StreamFormat};
use crate::wake::WakeChannel;
use nix::poll::PollFlags;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{trace, warn};

/// Call counters for assertions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockCounters {
    pub writes: u64,
    pub frames_written: u64,
    pub recovers: u64,
    pub prepares: u64,
    pub drops: u64,
    pub pauses: u64,
    pub resumes: u64,
    pub delay_queries: u64,
    pub headroom_queries: u64,
}

#[derive(Debug, Default)]
struct MockState {
    format: Option<StreamFormat>,
    closed: bool,
    paused: bool,

    headroom: usize,
    unlimited: bool,
    captured: Vec<u8>,
    delay_frames: usize,

    buffer_us: u32,
    period_us: u32,
    max_buffer_us: Option<u32>,

    fail_writes: u32,
    fail_headroom: u32,
    recover_fails: bool,
    prepare_fails: bool,
    pause_unsupported: bool,
    spurious_ready: bool,
    rejected: Vec<SampleFormat>,
    open_error: Option<DeviceError>,
    config_error: Option<DeviceError>,

    counters: MockCounters,
}

struct MockShared {
    state: Mutex<MockState>,
    ready: Option<WakeChannel>,
}

/// Scriptable in-memory device
#[derive(Clone)]
pub struct MockDevice {
    shared: Arc<MockShared>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Create a closed mock with no headroom
    ///
    /// If the readiness pipe cannot be created the mock exposes no poll
    /// descriptors and the pump falls back to timed waits.
    pub fn new() -> Self {
        let ready = WakeChannel::new()
            .map_err(|e| warn!("Mock device without readiness pipe: {}", e))
            .ok();
        Self {
            shared: Arc::new(MockShared {
                state: Mutex::new(MockState::default()),
                ready,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signal_ready(&self) {
        if let Some(ready) = &self.shared.ready {
            if let Err(e) = ready.wake() {
                warn!("Mock readiness signal failed: {}", e);
            }
        }
    }

    // ----- test controls -----

    /// Allow `frames` more frames to be written and wake a polling pump
    pub fn grant(&self, frames: usize) {
        self.state().headroom += frames;
        self.signal_ready();
    }

    /// Accept every write in full
    pub fn set_unlimited_headroom(&self, unlimited: bool) {
        self.state().unlimited = unlimited;
        self.signal_ready();
    }

    /// Headroom granted but not yet consumed
    pub fn headroom(&self) -> usize {
        self.state().headroom
    }

    /// Value reported by `query_delay`
    pub fn set_delay_frames(&self, frames: usize) {
        self.state().delay_frames = frames;
    }

    /// Fail the next `count` write calls with `DeviceError::Xrun`
    pub fn fail_next_writes(&self, count: u32) {
        self.state().fail_writes = count;
    }

    /// Fail the next `count` headroom queries with `DeviceError::Xrun`
    pub fn fail_next_headroom_queries(&self, count: u32) {
        self.state().fail_headroom = count;
    }

    pub fn set_recover_fails(&self, fails: bool) {
        self.state().recover_fails = fails;
    }

    pub fn set_prepare_fails(&self, fails: bool) {
        self.state().prepare_fails = fails;
    }

    /// Make `pause()` fail as on hardware without pause support
    pub fn set_pause_unsupported(&self, unsupported: bool) {
        self.state().pause_unsupported = unsupported;
    }

    /// Keep the poll descriptor readable even when there is no headroom,
    /// like drivers whose readiness reports run ahead of the hardware
    pub fn set_spurious_readiness(&self, spurious: bool) {
        self.state().spurious_ready = spurious;
        self.signal_ready();
    }

    pub fn reject_format(&self, format: SampleFormat) {
        self.state().rejected.push(format);
    }

    pub fn fail_open_with(&self, error: DeviceError) {
        self.state().open_error = Some(error);
    }

    pub fn fail_config_with(&self, error: DeviceError) {
        self.state().config_error = Some(error);
    }

    /// Clamp negotiated hardware buffer time, like a device with a small FIFO
    pub fn set_max_buffer_time(&self, us: u32) {
        self.state().max_buffer_us = Some(us);
    }

    // ----- inspection -----

    /// Every byte delivered by the pump, in order
    pub fn captured(&self) -> Vec<u8> {
        self.state().captured.clone()
    }

    pub fn captured_len(&self) -> usize {
        self.state().captured.len()
    }

    pub fn counters(&self) -> MockCounters {
        self.state().counters
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    /// Negotiated (buffer, period) times in microseconds
    pub fn negotiated(&self) -> (u32, u32) {
        let state = self.state();
        (state.buffer_us, state.period_us)
    }

    fn frame_bytes(state: &MockState) -> Result<usize, DeviceError> {
        match (state.format, state.closed) {
            (Some(format), false) => Ok(format.frame_bytes()),
            _ => Err(DeviceError::BadState("mock device not open".to_string())),
        }
    }
}

impl DeviceSink for MockDevice {
    fn name(&self) -> &str {
        "mock"
    }

    fn supports_format(&self, format: SampleFormat) -> bool {
        !self.state().rejected.contains(&format)
    }

    fn open(&mut self, format: &StreamFormat) -> Result<(), DeviceError> {
        let mut state = self.state();
        if let Some(err) = state.open_error.clone() {
            return Err(err);
        }
        state.format = Some(*format);
        state.closed = false;
        Ok(())
    }

    fn set_buffer_time_near(&mut self, us: u32) -> Result<u32, DeviceError> {
        let mut state = self.state();
        if let Some(err) = state.config_error.clone() {
            return Err(err);
        }
        let actual = state.max_buffer_us.map_or(us, |max| us.min(max));
        state.buffer_us = actual;
        Ok(actual)
    }

    fn set_period_time_near(&mut self, us: u32) -> Result<u32, DeviceError> {
        let mut state = self.state();
        state.period_us = us;
        Ok(us)
    }

    fn apply_hw_params(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, DeviceError> {
        let mut state = self.state();
        let frame_bytes = Self::frame_bytes(&state)?;
        state.counters.writes += 1;

        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(DeviceError::Xrun);
        }

        let requested = data.len() / frame_bytes;
        let frames = if state.unlimited {
            requested
        } else {
            requested.min(state.headroom)
        };
        if !state.unlimited {
            state.headroom -= frames;
        }

        state.captured.extend_from_slice(&data[..frames * frame_bytes]);
        state.counters.frames_written += frames as u64;
        trace!("Mock accepted {} of {} frames", frames, requested);
        Ok(frames)
    }

    fn available_write_headroom(&mut self) -> Result<usize, DeviceError> {
        // Consume readiness first so a grant racing with this query is
        // either counted now or leaves the descriptor readable
        let spurious = self.state().spurious_ready;
        if let Some(ready) = self.shared.ready.as_ref().filter(|_| !spurious) {
            ready.drain();
        }
        let mut state = self.state();
        Self::frame_bytes(&state)?;
        state.counters.headroom_queries += 1;

        if state.fail_headroom > 0 {
            state.fail_headroom -= 1;
            return Err(DeviceError::Xrun);
        }
        if state.unlimited {
            return Ok(usize::MAX / 2);
        }
        Ok(state.headroom)
    }

    fn recover(&mut self, error: &DeviceError) -> Result<(), DeviceError> {
        let mut state = self.state();
        state.counters.recovers += 1;
        if state.recover_fails || !error.is_transient() {
            return Err(error.clone());
        }
        Ok(())
    }

    fn prepare(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state();
        state.counters.prepares += 1;
        if state.prepare_fails {
            return Err(DeviceError::Io("prepare failed".to_string()));
        }
        state.paused = false;
        Ok(())
    }

    fn drop_pending(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state();
        state.counters.drops += 1;
        state.paused = false;
        Ok(())
    }

    fn pause(&mut self, pause: bool) -> Result<(), DeviceError> {
        let mut state = self.state();
        if pause {
            state.counters.pauses += 1;
        } else {
            state.counters.resumes += 1;
        }
        if state.pause_unsupported {
            return Err(DeviceError::Unsupported("pause".to_string()));
        }
        state.paused = pause;
        Ok(())
    }

    fn query_delay(&mut self) -> Result<usize, DeviceError> {
        let mut state = self.state();
        state.counters.delay_queries += 1;
        Ok(state.delay_frames)
    }

    fn close(&mut self) {
        self.state().closed = true;
    }

    fn poll_descriptors(&self) -> Vec<PollDescriptor> {
        self.shared
            .ready
            .iter()
            .map(|ready| PollDescriptor {
                fd: ready.read_fd(),
                events: PollFlags::POLLIN,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opened() -> MockDevice {
        let mut device = MockDevice::new();
        device.open(&StreamFormat::new(SampleFormat::S16Le, 2, 44100)).unwrap();
        device
    }

    #[test]
    fn test_write_limited_by_grant() {
        let mut device = opened();
        assert_eq!(device.available_write_headroom().unwrap(), 0);

        device.grant(3);
        assert_eq!(device.available_write_headroom().unwrap(), 3);
        assert_eq!(device.write(&[7u8; 20]).unwrap(), 3);
        assert_eq!(device.captured(), vec![7u8; 12]);
        assert_eq!(device.headroom(), 0);
    }

    #[test]
    fn test_clone_shares_state() {
        let mut device = opened();
        let observer = device.clone();
        device.set_unlimited_headroom(true);
        device.write(&[1, 2, 3, 4]).unwrap();
        assert_eq!(observer.captured(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_write_when_closed_fails() {
        let mut device = opened();
        device.close();
        assert!(matches!(device.write(&[0; 4]), Err(DeviceError::BadState(_))));
    }

    #[test]
    fn test_buffer_time_clamp() {
        let mut device = opened();
        device.set_max_buffer_time(100_000);
        assert_eq!(device.set_buffer_time_near(250_000).unwrap(), 100_000);
    }

    #[test]
    fn test_pause_unsupported() {
        let mut device = opened();
        device.set_pause_unsupported(true);
        assert!(device.pause(true).is_err());
        assert_eq!(device.counters().pauses, 1);
        assert!(!device.is_paused());
    }

    #[test]
    fn test_spurious_readiness_survives_headroom_query() {
        let mut device = opened();
        device.set_spurious_readiness(true);
        assert_eq!(device.available_write_headroom().unwrap(), 0);

        let descriptors = device.poll_descriptors();
        let outcome = WakeChannel::new()
            .unwrap()
            .wait(&descriptors, Some(std::time::Duration::from_millis(100)))
            .unwrap();
        assert_eq!(outcome, crate::wake::WaitOutcome::Ready);
        assert_eq!(device.counters().headroom_queries, 1);
    }

    #[test]
    fn test_recover_refuses_non_transient() {
        let mut device = opened();
        assert!(device.recover(&DeviceError::Xrun).is_ok());
        assert!(device.recover(&DeviceError::Io("gone".into())).is_err());
    }
}
