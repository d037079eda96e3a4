//! # pcmout
//!
//! Audio output buffering and playback pump.
//!
//! **Purpose:** Bridge a PCM producer (decoder/player) and a hardware sink
//! through a bounded ring buffer drained by a dedicated pump thread.
//!
//! **Architecture:**
//!
//! ```text
//! producer ── write() ──► RingBuffer ──► pump thread ──► DeviceSink
//!     ▲                      (mutex)          │
//!     └──── period_wait() ◄── condvar ◄───────┘
//!                                             │
//!                         WakeChannel ──► poll(2) ◄── device descriptors
//! ```
//!
//! - [`OutputSession`]: public open/write/period_wait/pause/flush/drain/close API
//! - [`pump`]: the pump thread, its state machine and wait policy
//! - [`RingBuffer`]: fixed-capacity byte buffer
//! - [`WakeChannel`]: self-pipe used to interrupt the pump's poll()
//! - [`device`]: the [`DeviceSink`] trait plus mock and clock-driven backends

pub mod device;
pub mod error;
pub mod format;
pub mod pump;
pub mod ring_buffer;
pub mod session;
pub mod wake;

pub use device::{DeviceSink, PollDescriptor};
pub use error::{DeviceError, Error, OpenError, Result};
pub use format::{SampleFormat, StreamFormat};
pub use pump::{PumpMode, WaitPolicy};
pub use ring_buffer::RingBuffer;
pub use session::{BufferGeometry, OutputSession, SessionOptions};
pub use wake::WakeChannel;
