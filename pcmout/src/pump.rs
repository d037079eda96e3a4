//! Playback pump
//!
//! **Purpose:** Move PCM bytes from the session's ring buffer into the device
//! on a dedicated thread, so producers never block on hardware.
//!
//! **Synchronization:**
//!
//! All shared state lives in one [`PumpState`] behind one mutex. A single
//! condition variable carries both directions of signalling:
//! - producer → pump: "there is data" / "playback started" / "quit"
//! - pump → producer: "bytes were written, there is room"
//!
//! The pump holds the mutex at all times except while blocked: on the
//! condition variable (nothing to do) or in poll(2) on the device's
//! descriptors plus the session's [`WakeChannel`] (device full). Setting
//! `quit` therefore takes both a condvar broadcast and a pipe wake.
//!
//! **Loop:**
//!
//! ```text
//!   ┌─► quit? ──yes──► exit
//!   │     │ no
//!   │     ▼
//!   │   flowing and ≥ 1 frame readable? ──no──► condvar wait ──┐
//!   │     │ yes                                                 │
//!   │     ▼                                                     │
//!   │   headroom = avail()  (recover + retry once)              │
//!   │     │                                                     │
//!   │     ├─ 0 ──► unlock, poll()/timed sleep, relock ──────────┤
//!   │     ▼                                                     │
//!   │   write(min(readable, headroom))  (recover + retry once)  │
//!   │     │ ok: discard, broadcast                              │
//!   └─────┴─────────────────────────────────────────────────────┘
//! ```
//!
//! A failed attempt (error surviving one recover+retry) triggers `prepare()`;
//! a second consecutive failed attempt, or a failing `prepare()`, ends the
//! loop and leaves the session [`PumpMode::Failed`].

use crate::device::{with_recover, DeviceSink, PollDescriptor};
use crate::error::{DeviceError, Error, Result};
use crate::format::StreamFormat;
use crate::ring_buffer::RingBuffer;
use crate::wake::WakeChannel;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Name given to the pump thread
pub const PUMP_THREAD_NAME: &str = "pcmout-pump";

/// Session playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpMode {
    /// Opened or flushed; nothing written yet
    Idle,
    /// Accumulating data before the device is started
    Prebuffering,
    /// Pump is feeding the device
    Running,
    /// Paused by the caller; `prebuffering` records whether playback had started
    Paused { prebuffering: bool },
    /// `drain()` is waiting for the ring to empty
    Draining,
    /// Pump gave up after repeated device failures
    Failed,
    /// Session closed
    Stopped,
}

impl PumpMode {
    /// True while the device has not been started since open/flush
    pub fn is_prebuffering(self) -> bool {
        matches!(
            self,
            PumpMode::Idle | PumpMode::Prebuffering | PumpMode::Paused { prebuffering: true }
        )
    }

    pub fn is_paused(self) -> bool {
        matches!(self, PumpMode::Paused { .. })
    }

    /// True when the pump should move data to the device
    pub fn is_flowing(self) -> bool {
        matches!(self, PumpMode::Running | PumpMode::Draining)
    }
}

/// How the pump waits when the device has no room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Consecutive poll() wakeups without a write before switching to timed waits
    pub wakeup_threshold: u32,
    /// Sleep used by timed waits
    pub timed_wait: Duration,
}

impl WaitPolicy {
    /// Derive the timed wait from the negotiated period
    ///
    /// Rounded to whole microseconds and never shorter than one millisecond.
    pub fn from_period(wakeup_threshold: u32, sleep_fraction: f32, period: Duration) -> Self {
        let micros = (period.as_micros() as f64 * f64::from(sleep_fraction)).round() as u64;
        let timed_wait = Duration::from_micros(micros.max(1000));
        Self {
            wakeup_threshold,
            timed_wait,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitKind {
    /// poll() over device descriptors and the wake pipe
    Poll,
    /// Timed wait on the wake pipe only
    Sleep,
}

/// Detects drivers whose descriptors report readiness without room
///
/// Once tripped it stays tripped for the life of the pump thread.
#[derive(Debug)]
struct Watchdog {
    threshold: u32,
    wakeups_since_write: u32,
    timed: bool,
}

impl Watchdog {
    fn new(threshold: u32) -> Self {
        Self {
            threshold,
            wakeups_since_write: 0,
            timed: false,
        }
    }

    fn on_headroom(&mut self) {
        self.wakeups_since_write = 0;
    }

    fn next_wait(&mut self, has_descriptors: bool) -> WaitKind {
        if !has_descriptors {
            return WaitKind::Sleep;
        }
        if self.wakeups_since_write > self.threshold && !self.timed {
            debug!("Activating timer workaround");
            self.timed = true;
        }
        if self.timed && self.wakeups_since_write > 0 {
            WaitKind::Sleep
        } else {
            self.wakeups_since_write += 1;
            WaitKind::Poll
        }
    }
}

/// Everything guarded by the session mutex
#[derive(Debug)]
pub(crate) struct PumpState<D> {
    pub(crate) ring: RingBuffer,
    pub(crate) mode: PumpMode,
    pub(crate) quit: bool,
    pub(crate) started: bool,
    /// Device delay captured when pausing
    pub(crate) paused_delay_ms: u64,
    /// Bytes handed to the device since open
    pub(crate) bytes_to_hardware: u64,
    /// Bytes accepted from the producer (adjustable via `set_written_time`)
    pub(crate) written_bytes: u64,
    pub(crate) failure: Option<DeviceError>,
    pub(crate) device: D,
    thread: Option<JoinHandle<()>>,
}

impl<D> PumpState<D> {
    pub(crate) fn new(device: D, ring: RingBuffer) -> Self {
        Self {
            ring,
            mode: PumpMode::Idle,
            quit: false,
            started: false,
            paused_delay_ms: 0,
            bytes_to_hardware: 0,
            written_bytes: 0,
            failure: None,
            device,
            thread: None,
        }
    }

    /// Error for calls made after the pump failed or the session closed
    pub(crate) fn check_usable(&self) -> Result<()> {
        match self.mode {
            PumpMode::Failed => Err(Error::DeviceFailed(
                self.failure
                    .clone()
                    .unwrap_or_else(|| DeviceError::Io("pump stopped".to_string())),
            )),
            PumpMode::Stopped => Err(Error::InvalidState("session is closed".to_string())),
            _ => Ok(()),
        }
    }
}

struct Shared<D> {
    state: Mutex<PumpState<D>>,
    cond: Condvar,
    wake: WakeChannel,
    format: StreamFormat,
    policy: WaitPolicy,
    descriptors: Vec<PollDescriptor>,
}

impl<D> Shared<D> {
    fn lock(&self) -> MutexGuard<'_, PumpState<D>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, PumpState<D>>) -> MutexGuard<'a, PumpState<D>> {
        self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owner of the shared state and the pump thread's lifecycle
pub(crate) struct PumpScheduler<D> {
    shared: Arc<Shared<D>>,
}

impl<D: DeviceSink> PumpScheduler<D> {
    pub(crate) fn new(
        state: PumpState<D>,
        wake: WakeChannel,
        format: StreamFormat,
        policy: WaitPolicy,
    ) -> Self {
        let descriptors = state.device.poll_descriptors();
        if descriptors.is_empty() {
            debug!("{} has no poll descriptors; using timed waits", state.device.name());
        }
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                cond: Condvar::new(),
                wake,
                format,
                policy,
                descriptors,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PumpState<D>> {
        self.shared.lock()
    }

    pub(crate) fn wait<'a>(
        &'a self,
        guard: MutexGuard<'a, PumpState<D>>,
    ) -> MutexGuard<'a, PumpState<D>> {
        self.shared.wait(guard)
    }

    /// Broadcast on the condition variable
    pub(crate) fn notify(&self) {
        self.shared.cond.notify_all();
    }

    /// Spawn the pump thread and wait until it holds the mutex
    ///
    /// On failure the session is marked failed; the guard is consumed either way.
    pub(crate) fn start<'a>(
        &'a self,
        mut guard: MutexGuard<'a, PumpState<D>>,
    ) -> io::Result<MutexGuard<'a, PumpState<D>>> {
        debug!("Starting pump");
        guard.started = false;

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(PUMP_THREAD_NAME.to_string())
            .spawn(move || run(&shared));

        match spawned {
            Ok(handle) => guard.thread = Some(handle),
            Err(e) => {
                error!("Failed to spawn pump thread: {}", e);
                guard.mode = PumpMode::Failed;
                guard.failure = Some(DeviceError::Io(e.to_string()));
                self.notify();
                return Err(e);
            }
        }

        while !guard.started {
            guard = self.wait(guard);
        }
        Ok(guard)
    }

    /// Ask the pump thread to exit and join it
    ///
    /// The mutex is released while joining and re-acquired before returning.
    pub(crate) fn stop<'a>(
        &'a self,
        mut guard: MutexGuard<'a, PumpState<D>>,
    ) -> MutexGuard<'a, PumpState<D>> {
        debug!("Stopping pump");
        guard.quit = true;
        self.notify();
        if let Err(e) = self.shared.wake.wake() {
            warn!("Failed to wake pump: {}", e);
        }

        let handle = guard.thread.take();
        drop(guard);

        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Pump thread panicked");
            }
        }
        self.shared.wake.drain();

        let mut guard = self.lock();
        guard.quit = false;
        guard
    }
}

enum Transfer {
    /// Device reported no headroom
    NoRoom,
    /// Frames were offered; `more_room` means the device can take more right away
    Wrote { more_room: bool },
}

/// One avail + write step
fn transfer<D: DeviceSink>(
    state: &mut PumpState<D>,
    frame_bytes: usize,
) -> std::result::Result<Transfer, DeviceError> {
    let headroom = with_recover(&mut state.device, |d| d.available_write_headroom())?;
    if headroom == 0 {
        return Ok(Transfer::NoRoom);
    }

    let PumpState {
        ring,
        device,
        bytes_to_hardware,
        ..
    } = &mut *state;
    let readable = ring.readable();
    let readable_frames = readable.len() / frame_bytes;
    let frames = readable_frames.min(headroom);
    let chunk = &readable[..frames * frame_bytes];

    let written = with_recover(device, |d| d.write(chunk))?.min(frames);
    let bytes = written * frame_bytes;
    ring.discard(bytes);
    *bytes_to_hardware += bytes as u64;
    trace!("Pump wrote {} of {} frames (headroom {})", written, frames, headroom);

    // A short write means the device filled up
    Ok(Transfer::Wrote {
        more_room: written == frames && readable_frames < headroom,
    })
}

fn run<D: DeviceSink>(shared: &Shared<D>) {
    let mut state = shared.lock();
    state.started = true;
    shared.cond.notify_all();

    let frame_bytes = shared.format.frame_bytes();
    let mut watchdog = Watchdog::new(shared.policy.wakeup_threshold);
    let mut failed_once = false;

    while !state.quit {
        if !state.mode.is_flowing() || state.ring.readable().len() < frame_bytes {
            state = shared.wait(state);
            continue;
        }

        match transfer(&mut state, frame_bytes) {
            Ok(Transfer::Wrote { more_room }) => {
                failed_once = false;
                watchdog.on_headroom();
                shared.cond.notify_all();
                if more_room {
                    continue;
                }
            }
            Ok(Transfer::NoRoom) => {}
            Err(err) => {
                if failed_once {
                    fail(shared, &mut state, err);
                    break;
                }
                warn!("Device write failed: {}; re-preparing {}", err, state.device.name());
                failed_once = true;
                if let Err(err) = state.device.prepare() {
                    fail(shared, &mut state, err);
                    break;
                }
                continue;
            }
        }

        let kind = watchdog.next_wait(!shared.descriptors.is_empty());
        drop(state);

        let waited = match kind {
            WaitKind::Poll => shared.wake.wait(&shared.descriptors, None),
            WaitKind::Sleep => shared.wake.wait(&[], Some(shared.policy.timed_wait)),
        };
        if let Err(e) = waited {
            warn!("Pump wait failed: {}", e);
            thread::sleep(shared.policy.timed_wait);
        }

        state = shared.lock();
    }

    trace!("Pump exiting");
}

fn fail<D: DeviceSink>(shared: &Shared<D>, state: &mut PumpState<D>, err: DeviceError) {
    error!("Giving up on {}: {}", state.device.name(), err);
    state.mode = PumpMode::Failed;
    state.failure = Some(err);
    shared.cond.notify_all();
}
