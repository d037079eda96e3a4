//! Clock-driven simulated device
//!
//! Behaves like a PCM playback device without touching hardware: frames
//! written into its buffer are "played" at the stream's sample rate, measured
//! with the monotonic clock. It follows the usual PCM state machine
//! (setup → prepared → running ↔ paused, with xrun on underrun), so the pump's
//! recovery paths run against it exactly as they would against a sound card.
//!
//! It has no pollable descriptor; the pump therefore waits for room with
//! timed sleeps.

use super::{DeviceSink, PollDescriptor};
use crate::error::DeviceError;
use crate::format::StreamFormat;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const MIN_BUFFER_US: u32 = 1_000;
const MAX_BUFFER_US: u32 = 2_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PcmState {
    Closed,
    Open,
    Setup,
    Prepared,
    Running,
    Paused,
    Xrun,
}

/// Simulated real-time playback device
#[derive(Debug)]
pub struct ClockDevice {
    name: String,
    format: Option<StreamFormat>,
    state: PcmState,
    buffer_us: u32,
    period_us: u32,
    buffer_frames: usize,
    queued: usize,
    played_frames: u64,
    last_tick: Instant,
}

impl ClockDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            format: None,
            state: PcmState::Closed,
            buffer_us: 0,
            period_us: 0,
            buffer_frames: 0,
            queued: 0,
            played_frames: 0,
            last_tick: Instant::now(),
        }
    }

    /// Total frames that have been "played"
    pub fn played_frames(&self) -> u64 {
        self.played_frames
    }

    fn rate(&self) -> u64 {
        self.format.map_or(0, |f| f.rate as u64)
    }

    fn bad_state(&self, op: &str) -> DeviceError {
        DeviceError::BadState(format!("{} in state {:?}", op, self.state))
    }

    /// Advance the simulated playback position to now
    fn tick(&mut self) {
        if self.state != PcmState::Running {
            return;
        }
        let rate = self.rate();
        let elapsed = self.last_tick.elapsed();
        let consumed = (elapsed.as_nanos() * rate as u128 / 1_000_000_000) as u64;
        if consumed == 0 {
            return;
        }
        self.last_tick += Duration::from_nanos(consumed * 1_000_000_000 / rate);

        if consumed >= self.queued as u64 {
            self.played_frames += self.queued as u64;
            self.queued = 0;
            self.state = PcmState::Xrun;
            trace!("{}: underrun", self.name);
        } else {
            self.queued -= consumed as usize;
            self.played_frames += consumed;
        }
    }
}

impl DeviceSink for ClockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, format: &StreamFormat) -> Result<(), DeviceError> {
        if self.state != PcmState::Closed {
            return Err(self.bad_state("open"));
        }
        self.format = Some(*format);
        self.state = PcmState::Open;
        Ok(())
    }

    fn set_buffer_time_near(&mut self, us: u32) -> Result<u32, DeviceError> {
        if self.state != PcmState::Open {
            return Err(self.bad_state("set_buffer_time_near"));
        }
        let rate = self.rate();
        let us = us.clamp(MIN_BUFFER_US, MAX_BUFFER_US);
        self.buffer_frames = (us as u64 * rate / 1_000_000).max(1) as usize;
        // Report the time the whole-frame buffer actually holds
        self.buffer_us = (self.buffer_frames as u64 * 1_000_000 / rate) as u32;
        Ok(self.buffer_us)
    }

    fn set_period_time_near(&mut self, us: u32) -> Result<u32, DeviceError> {
        if self.state != PcmState::Open || self.buffer_us == 0 {
            return Err(self.bad_state("set_period_time_near"));
        }
        self.period_us = us.clamp(MIN_BUFFER_US / 4, (self.buffer_us / 2).max(MIN_BUFFER_US / 4));
        Ok(self.period_us)
    }

    fn apply_hw_params(&mut self) -> Result<(), DeviceError> {
        if self.state != PcmState::Open || self.buffer_frames == 0 {
            return Err(self.bad_state("apply_hw_params"));
        }
        debug!(
            "{}: buffer {} frames ({} us), period {} us",
            self.name, self.buffer_frames, self.buffer_us, self.period_us
        );
        self.state = PcmState::Setup;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, DeviceError> {
        self.tick();
        match self.state {
            PcmState::Prepared => {
                self.state = PcmState::Running;
                self.last_tick = Instant::now();
            }
            PcmState::Running => {}
            PcmState::Xrun => return Err(DeviceError::Xrun),
            _ => return Err(self.bad_state("write")),
        }
        let frame_bytes = self.format.map_or(1, |f| f.frame_bytes());
        let frames = (data.len() / frame_bytes).min(self.buffer_frames - self.queued);
        self.queued += frames;
        Ok(frames)
    }

    fn available_write_headroom(&mut self) -> Result<usize, DeviceError> {
        self.tick();
        match self.state {
            PcmState::Prepared | PcmState::Running | PcmState::Paused => {
                Ok(self.buffer_frames - self.queued)
            }
            PcmState::Xrun => Err(DeviceError::Xrun),
            _ => Err(self.bad_state("avail")),
        }
    }

    fn recover(&mut self, error: &DeviceError) -> Result<(), DeviceError> {
        if error.is_transient() {
            debug!("{}: recovering from {}", self.name, error);
            self.prepare()
        } else {
            Err(error.clone())
        }
    }

    fn prepare(&mut self) -> Result<(), DeviceError> {
        match self.state {
            PcmState::Closed | PcmState::Open => Err(self.bad_state("prepare")),
            _ => {
                self.queued = 0;
                self.state = PcmState::Prepared;
                Ok(())
            }
        }
    }

    fn drop_pending(&mut self) -> Result<(), DeviceError> {
        match self.state {
            PcmState::Closed | PcmState::Open => Err(self.bad_state("drop")),
            _ => {
                self.tick();
                self.queued = 0;
                self.state = PcmState::Setup;
                Ok(())
            }
        }
    }

    fn pause(&mut self, pause: bool) -> Result<(), DeviceError> {
        self.tick();
        match (pause, self.state) {
            (true, PcmState::Running) => {
                self.state = PcmState::Paused;
                Ok(())
            }
            (false, PcmState::Paused) => {
                self.state = PcmState::Running;
                self.last_tick = Instant::now();
                Ok(())
            }
            _ => Err(self.bad_state(if pause { "pause" } else { "resume" })),
        }
    }

    fn query_delay(&mut self) -> Result<usize, DeviceError> {
        self.tick();
        match self.state {
            PcmState::Prepared | PcmState::Running | PcmState::Paused => Ok(self.queued),
            PcmState::Xrun => Err(DeviceError::Xrun),
            _ => Err(self.bad_state("delay")),
        }
    }

    fn close(&mut self) {
        self.state = PcmState::Closed;
        self.format = None;
        self.queued = 0;
    }

    fn poll_descriptors(&self) -> Vec<PollDescriptor> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;
    use std::thread;

    fn configured(rate: u32, buffer_us: u32) -> ClockDevice {
        let mut device = ClockDevice::new("clock");
        device.open(&StreamFormat::new(SampleFormat::S16Le, 1, rate)).unwrap();
        device.set_buffer_time_near(buffer_us).unwrap();
        device.set_period_time_near(buffer_us / 4).unwrap();
        device.apply_hw_params().unwrap();
        device
    }

    #[test]
    fn test_write_requires_prepare() {
        let mut device = configured(1000, 100_000);
        assert!(matches!(device.write(&[0; 2]), Err(DeviceError::BadState(_))));
        device.prepare().unwrap();
        assert_eq!(device.write(&[0; 2]).unwrap(), 1);
    }

    #[test]
    fn test_buffer_fills_and_drains_in_real_time() {
        // 1000 Hz, 100 ms buffer = 100 frames
        let mut device = configured(1000, 100_000);
        device.prepare().unwrap();
        assert_eq!(device.available_write_headroom().unwrap(), 100);

        assert_eq!(device.write(&[0; 400]).unwrap(), 100);
        assert!(device.available_write_headroom().unwrap() < 10);

        thread::sleep(Duration::from_millis(40));
        let headroom = device.available_write_headroom().unwrap();
        assert!(headroom >= 30, "headroom {} after 40ms", headroom);
        assert!(device.played_frames() >= 30);
    }

    #[test]
    fn test_underrun_then_recover() {
        let mut device = configured(1000, 20_000);
        device.prepare().unwrap();
        device.write(&[0; 20]).unwrap();

        thread::sleep(Duration::from_millis(60));
        let err = device.available_write_headroom().unwrap_err();
        assert_eq!(err, DeviceError::Xrun);

        device.recover(&err).unwrap();
        assert_eq!(device.available_write_headroom().unwrap(), 20);
    }

    #[test]
    fn test_pause_holds_delay() {
        let mut device = configured(1000, 500_000);
        device.prepare().unwrap();
        device.write(&[0; 800]).unwrap();
        device.pause(true).unwrap();
        let before = device.query_delay().unwrap();

        thread::sleep(Duration::from_millis(30));
        assert_eq!(device.query_delay().unwrap(), before);

        device.pause(false).unwrap();
        assert!(device.pause(false).is_err());
    }

    #[test]
    fn test_pause_before_start_fails() {
        let mut device = configured(1000, 100_000);
        device.prepare().unwrap();
        assert!(device.pause(true).is_err());
    }
}
