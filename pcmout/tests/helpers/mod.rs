//! Shared helpers for pcmout integration tests
//!
//! - Session constructors over [`MockDevice`]
//! - Deterministic byte patterns for FIFO checks
//! - Polling waits with a generous deadline

#![allow(dead_code)]

use std::time::{Duration, Instant};

use pcmout::device::MockDevice;
use pcmout::{OutputSession, SampleFormat, SessionOptions, StreamFormat};

/// Upper bound for anything a test waits on
pub const DEADLINE: Duration = Duration::from_secs(10);

pub fn cd_format() -> StreamFormat {
    StreamFormat::new(SampleFormat::S16Le, 2, 44100)
}

/// 8-bit mono at 8 kHz: one byte per frame, 8 bytes per millisecond
pub fn tiny_format() -> StreamFormat {
    StreamFormat::new(SampleFormat::U8, 1, 8000)
}

/// Open a session on a fresh mock; returns the session and an observer clone
pub fn open_mock(format: StreamFormat, buffer_ms: u32) -> (OutputSession<MockDevice>, MockDevice) {
    let device = MockDevice::new();
    let observer = device.clone();
    let options = SessionOptions::default().with_buffer_ms(buffer_ms);
    let session = OutputSession::open(device, format, options).expect("open mock session");
    (session, observer)
}

/// `len` bytes counting up from `start`, wrapping at 256
pub fn pattern(start: usize, len: usize) -> Vec<u8> {
    (start..start + len).map(|i| (i % 256) as u8).collect()
}

/// Poll `condition` every millisecond until it holds; panics after [`DEADLINE`]
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        if start.elapsed() > DEADLINE {
            panic!("timed out waiting for {}", what);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
