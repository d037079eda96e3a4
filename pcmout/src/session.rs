//! Output session
//!
//! **Purpose:** Public face of the subsystem. An [`OutputSession`] owns the
//! device, the ring buffer and the pump thread for one open stream.
//!
//! **Producer contract:**
//!
//! ```text
//! loop {
//!     let n = session.write(&pcm[offset..])?;   // may accept fewer bytes
//!     offset += n;
//!     if offset < pcm.len() { session.period_wait()?; }
//! }
//! session.drain()?;
//! session.close();
//! ```
//!
//! Transport calls (`pause`, `flush`, `drain`) stop and join the pump before
//! touching the device, then restart it. They are serialized against each
//! other by a control mutex, taken before the state mutex.
//!
//! Errors are pull-based: when the pump gives up on the device, the next
//! call returns [`Error::DeviceFailed`]. `close()` always succeeds.

use crate::device::{with_recover, DeviceSink};
use crate::error::{DeviceError, Error, OpenError, Result};
use crate::format::StreamFormat;
use crate::pump::{PumpMode, PumpScheduler, PumpState, WaitPolicy};
use crate::ring_buffer::RingBuffer;
use crate::wake::WakeChannel;
use pcmout_common::OutputConfig;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound for the hardware share of the buffer
const MAX_HARDWARE_BUFFER_MS: u32 = 1000;

/// Parameters for [`OutputSession::open`]
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Total buffering (hardware + software) in milliseconds
    pub buffer_ms: u32,
    /// See [`WaitPolicy::wakeup_threshold`]
    pub wakeup_threshold: u32,
    /// Fraction of a period slept by timed waits
    pub sleep_fraction: f32,
}

impl SessionOptions {
    pub fn from_config(config: &OutputConfig) -> Self {
        Self {
            buffer_ms: config.buffer_ms,
            wakeup_threshold: config.timer_workaround.wakeup_threshold,
            sleep_fraction: config.timer_workaround.sleep_fraction,
        }
    }

    pub fn with_buffer_ms(mut self, buffer_ms: u32) -> Self {
        self.buffer_ms = buffer_ms;
        self
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&OutputConfig::default())
    }
}

/// Buffer sizes negotiated at open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferGeometry {
    pub hardware_buffer_ms: u32,
    pub software_buffer_ms: u32,
    pub period_ms: u32,
    pub ring_capacity_bytes: usize,
}

/// An open playback stream
pub struct OutputSession<D: DeviceSink> {
    pump: PumpScheduler<D>,
    control: Mutex<()>,
    format: StreamFormat,
    geometry: BufferGeometry,
    closed: bool,
}

impl<D: DeviceSink> OutputSession<D> {
    /// Open `device` for `format` and start the pump
    ///
    /// The device is closed again if anything after `device.open` fails.
    pub fn open(
        mut device: D,
        format: StreamFormat,
        options: SessionOptions,
    ) -> std::result::Result<Self, OpenError> {
        format.validate()?;
        if options.buffer_ms == 0 {
            return Err(OpenError::InvalidParameters("buffer size must be non-zero".to_string()));
        }
        if !(options.sleep_fraction > 0.0 && options.sleep_fraction <= 1.0) {
            return Err(OpenError::InvalidParameters(format!(
                "sleep fraction {} outside (0, 1]",
                options.sleep_fraction
            )));
        }
        if !device.supports_format(format.format) {
            return Err(OpenError::UnsupportedFormat(format.format));
        }

        info!(
            "Opening {} for {:?}, {} channels, {} Hz",
            device.name(),
            format.format,
            format.channels,
            format.rate
        );
        device.open(&format).map_err(OpenError::DeviceOpenFailed)?;

        let (geometry, period) = match negotiate(&mut device, &format, options.buffer_ms) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                device.close();
                return Err(e);
            }
        };
        info!(
            "Buffer: hardware {} ms, software {} ms, period {} ms",
            geometry.hardware_buffer_ms, geometry.software_buffer_ms, geometry.period_ms
        );

        let wake = match WakeChannel::new() {
            Ok(wake) => wake,
            Err(e) => {
                device.close();
                return Err(OpenError::Resource(e));
            }
        };

        let policy =
            WaitPolicy::from_period(options.wakeup_threshold, options.sleep_fraction, period);
        let state = PumpState::new(device, RingBuffer::new(geometry.ring_capacity_bytes));
        let pump = PumpScheduler::new(state, wake, format, policy);

        if let Err(e) = pump.start(pump.lock()).map(drop) {
            pump.lock().device.close();
            return Err(OpenError::Resource(e));
        }

        Ok(Self {
            pump,
            control: Mutex::new(()),
            format,
            geometry,
            closed: false,
        })
    }

    fn control(&self) -> MutexGuard<'_, ()> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue up to `data.len()` bytes; returns how many were accepted
    ///
    /// Never blocks on the device. Returns 0 when the ring is full.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut state = self.pump.lock();
        state.check_usable()?;

        let accepted = data.len().min(state.ring.space());
        if accepted == 0 {
            return Ok(0);
        }
        state.ring.copy_in(&data[..accepted]);
        state.written_bytes += accepted as u64;

        if state.mode == PumpMode::Idle {
            debug!("Prebuffering");
            state.mode = PumpMode::Prebuffering;
        }
        if !state.mode.is_paused() {
            self.pump.notify();
        }
        Ok(accepted)
    }

    /// Block until the ring has room
    ///
    /// A full ring while prebuffering starts playback. While paused this
    /// waits until another thread unpauses or flushes.
    pub fn period_wait(&self) -> Result<()> {
        let mut state = self.pump.lock();
        loop {
            state.check_usable()?;
            if state.ring.space() > 0 {
                return Ok(());
            }
            if !state.mode.is_paused() {
                if state.mode.is_prebuffering() {
                    self.begin_playback(&mut state);
                } else {
                    self.pump.notify();
                }
            }
            state = self.pump.wait(state);
        }
    }

    /// End prebuffering now instead of waiting for the ring to fill
    pub fn start_playback(&self) -> Result<()> {
        let _control = self.control();
        let mut state = self.pump.lock();
        state.check_usable()?;
        if state.mode.is_prebuffering() {
            self.begin_playback(&mut state);
        }
        Ok(())
    }

    /// Prepare the device and leave prebuffering
    ///
    /// The pump is parked on the condvar while prebuffering, so the device
    /// can be used directly under the state lock.
    fn begin_playback(&self, state: &mut PumpState<D>) {
        debug!("Starting playback");
        if let Err(e) = state.device.prepare() {
            warn!("Failed to prepare {}: {}", state.device.name(), e);
        }
        state.mode = match state.mode {
            PumpMode::Paused { .. } => PumpMode::Paused { prebuffering: false },
            _ => PumpMode::Running,
        };
        self.pump.notify();
    }

    /// Pause or resume playback
    ///
    /// Pausing a started stream records the device delay first so
    /// [`get_delay`](Self::get_delay) stays constant while paused. Devices
    /// that cannot pause are stopped (`drop`) and re-prepared on resume.
    pub fn pause(&self, pause: bool) -> Result<()> {
        let _control = self.control();
        let mut state = self.pump.lock();
        state.check_usable()?;
        if state.mode.is_paused() == pause {
            return Ok(());
        }
        debug!("{}", if pause { "Pause" } else { "Unpause" });

        state = self.pump.stop(state);
        let prebuffering = state.mode.is_prebuffering();

        if pause {
            if !prebuffering {
                let delay = self.live_delay_ms(&mut state);
                state.paused_delay_ms = delay;
                if let Err(e) = state.device.pause(true) {
                    warn!("Hardware pause failed ({}); dropping pending frames instead", e);
                    if let Err(e) = state.device.drop_pending() {
                        warn!("Failed to drop pending frames: {}", e);
                    }
                }
            }
            state.mode = PumpMode::Paused { prebuffering };
        } else {
            if prebuffering {
                state.mode = if state.ring.is_empty() {
                    PumpMode::Idle
                } else {
                    PumpMode::Prebuffering
                };
            } else {
                if let Err(e) = state.device.pause(false) {
                    warn!("Hardware resume failed ({}); re-preparing instead", e);
                    if let Err(e) = state.device.prepare() {
                        warn!("Failed to prepare {}: {}", state.device.name(), e);
                    }
                }
                state.mode = PumpMode::Running;
            }
        }

        let _state = self.pump.start(state)?;
        self.pump.notify();
        Ok(())
    }

    /// Discard everything buffered, in the ring and in the device
    ///
    /// The next write begins a new prebuffer cycle. A paused session stays paused.
    pub fn flush(&self) -> Result<()> {
        let _control = self.control();
        let mut state = self.pump.lock();
        state.check_usable()?;
        debug!("Flush requested; discarding {} buffered bytes", state.ring.len());

        state = self.pump.stop(state);
        if let Err(e) = state.device.drop_pending() {
            warn!("Failed to drop pending frames: {}", e);
        }
        state.ring.discard_all();
        state.paused_delay_ms = 0;
        state.mode = if state.mode.is_paused() {
            PumpMode::Paused { prebuffering: true }
        } else {
            PumpMode::Idle
        };

        // Interrupt period_wait()
        self.pump.notify();
        let _state = self.pump.start(state)?;
        Ok(())
    }

    /// Play out everything buffered and return once it has been heard
    pub fn drain(&self) -> Result<()> {
        let _control = self.control();
        let mut state = self.pump.lock();
        state.check_usable()?;
        if state.mode.is_paused() {
            return Err(Error::InvalidState("cannot drain while paused".to_string()));
        }
        debug!("Drain");

        if state.mode.is_prebuffering() {
            self.begin_playback(&mut state);
        }
        state.mode = PumpMode::Draining;

        let frame_bytes = self.format.frame_bytes();
        while state.ring.len() >= frame_bytes {
            state.check_usable()?;
            state = self.pump.wait(state);
        }
        state.check_usable()?;

        // A partial trailing frame can never be played
        let tail = state.ring.len();
        state = self.pump.stop(state);
        let remaining = Duration::from_millis(self.live_delay_ms(&mut state));
        drop(state);

        // Writers may keep queueing while the device plays out; the pump is
        // stopped, so their bytes stay behind the tail in the ring
        debug!("Waiting {:?} for the device to play out", remaining);
        thread::sleep(remaining);

        let mut state = self.pump.lock();
        if let Err(e) = state.device.drop_pending() {
            warn!("Failed to drop pending frames: {}", e);
        }
        if let Err(e) = state.device.prepare() {
            warn!("Failed to prepare {}: {}", state.device.name(), e);
        }
        if tail > 0 {
            debug!("Dropping {} byte partial frame", tail);
            let ring_len = state.ring.len();
            state.ring.discard_realigned(tail.min(ring_len));
        }
        state.mode = PumpMode::Running;

        let _state = self.pump.start(state)?;
        Ok(())
    }

    /// Milliseconds until a byte written now would be heard
    pub fn get_delay(&self) -> u64 {
        let mut state = self.pump.lock();
        self.delay_ms(&mut state)
    }

    fn delay_ms(&self, state: &mut PumpState<D>) -> u64 {
        let buffered = self.format.bytes_to_ms(state.ring.len());
        match state.mode {
            PumpMode::Failed | PumpMode::Stopped => buffered,
            mode if mode.is_prebuffering() || mode.is_paused() => buffered + state.paused_delay_ms,
            _ => buffered + self.live_delay_ms(state),
        }
    }

    /// Device delay in ms; 0 if the device cannot report it
    fn live_delay_ms(&self, state: &mut PumpState<D>) -> u64 {
        match with_recover(&mut state.device, |d| d.query_delay()) {
            Ok(frames) => self.format.frames_to_ms(frames as u64),
            Err(e) => {
                debug!("Failed to query delay: {}", e);
                0
            }
        }
    }

    /// Stream time of all data accepted by `write`
    pub fn written_time_ms(&self) -> u64 {
        let state = self.pump.lock();
        self.written_ms(&state)
    }

    fn written_ms(&self, state: &PumpState<D>) -> u64 {
        let frames = state.written_bytes / self.format.frame_bytes() as u64;
        self.format.frames_to_ms(frames)
    }

    /// Rebase the written-time counter, typically after a seek and `flush()`
    pub fn set_written_time(&self, ms: u64) {
        let mut state = self.pump.lock();
        let frames = self.format.ms_to_frames(ms) as usize;
        state.written_bytes = self.format.frames_to_bytes(frames) as u64;
    }

    /// Stream time currently being heard
    pub fn output_time_ms(&self) -> u64 {
        let mut state = self.pump.lock();
        let written = self.written_ms(&state);
        written.saturating_sub(self.delay_ms(&mut state))
    }

    /// Bytes the pump has handed to the device since open
    pub fn bytes_to_hardware(&self) -> u64 {
        self.pump.lock().bytes_to_hardware
    }

    /// Bytes waiting in the ring
    pub fn buffered_bytes(&self) -> usize {
        self.pump.lock().ring.len()
    }

    pub fn ring_space(&self) -> usize {
        self.pump.lock().ring.space()
    }

    pub fn ring_capacity(&self) -> usize {
        self.geometry.ring_capacity_bytes
    }

    pub fn mode(&self) -> PumpMode {
        self.pump.lock().mode
    }

    /// The device error that failed the session, if any
    pub fn failure(&self) -> Option<DeviceError> {
        self.pump.lock().failure.clone()
    }

    pub fn geometry(&self) -> BufferGeometry {
        self.geometry
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// Stop the pump, discard pending audio and release the device
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!("Closing audio");

        let state = self.pump.lock();
        let mut state = self.pump.stop(state);
        if let Err(e) = state.device.drop_pending() {
            debug!("Drop on close failed: {}", e);
        }
        state.ring.discard_all();
        state.device.close();
        state.mode = PumpMode::Stopped;
        self.pump.notify();
    }
}

impl<D: DeviceSink> Drop for OutputSession<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<D: DeviceSink> std::fmt::Debug for OutputSession<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSession")
            .field("format", &self.format)
            .field("geometry", &self.geometry)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Negotiate hardware buffer and period, then size the software ring
///
/// The hardware buffer gets half the total (capped at one second) and the
/// ring gets whatever the hardware could not take, but never less than half.
fn negotiate<D: DeviceSink>(
    device: &mut D,
    format: &StreamFormat,
    total_ms: u32,
) -> std::result::Result<(BufferGeometry, Duration), OpenError> {
    let requested_ms = MAX_HARDWARE_BUFFER_MS.min(total_ms / 2);
    let buffer_us = device
        .set_buffer_time_near(requested_ms * 1000)
        .map_err(OpenError::DeviceConfigFailed)?;
    let hardware_buffer_ms = buffer_us / 1000;

    let period_us = device
        .set_period_time_near(hardware_buffer_ms / 4 * 1000)
        .map_err(OpenError::DeviceConfigFailed)?;
    device.apply_hw_params().map_err(OpenError::DeviceConfigFailed)?;

    let software_buffer_ms = (total_ms / 2).max(total_ms.saturating_sub(hardware_buffer_ms));
    let ring_frames = format.ms_to_frames(software_buffer_ms as u64) as usize;
    let ring_capacity_bytes = format.frames_to_bytes(ring_frames);
    if ring_capacity_bytes < format.frame_bytes() {
        return Err(OpenError::InvalidParameters(format!(
            "{} ms software buffer holds no complete frame at {} Hz",
            software_buffer_ms, format.rate
        )));
    }

    let geometry = BufferGeometry {
        hardware_buffer_ms,
        software_buffer_ms,
        period_ms: period_us / 1000,
        ring_capacity_bytes,
    };
    Ok((geometry, Duration::from_micros(period_us as u64)))
}
