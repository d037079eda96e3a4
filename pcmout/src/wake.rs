//! Self-pipe wakeup channel
//!
//! The pump thread blocks in poll(2) over the device's descriptors while it
//! waits for room in the hardware buffer. A condition variable cannot
//! interrupt that wait, so the pump also polls the read end of a private
//! pipe: writing one byte to it wakes the pump on demand (shutdown, flush).
//!
//! Both ends are non-blocking. Wakes coalesce: if the pipe is already full
//! of pending wake bytes, another `wake()` is a no-op, and the reader drains
//! everything on each wakeup.

use crate::device::PollDescriptor;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::pipe;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::time::Duration;
use tracing::warn;

/// Result of one [`WakeChannel::wait`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Another thread called `wake()` (or the wait was interrupted by a signal)
    Woken,
    /// One of the extra descriptors reported readiness
    Ready,
    /// The timeout elapsed with nothing ready
    TimedOut,
}

/// Cross-thread interrupt for a poll()-blocked reader
pub struct WakeChannel {
    reader: File,
    writer: File,
}

impl WakeChannel {
    /// Create the pipe pair
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = pipe()?;
        for fd in [reader.as_raw_fd(), writer.as_raw_fd()] {
            fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
        }
        Ok(Self {
            reader: File::from(reader),
            writer: File::from(writer),
        })
    }

    /// Wake a thread blocked in [`wait`](Self::wait)
    pub fn wake(&self) -> io::Result<()> {
        match (&self.writer).write(&[0u8]) {
            Ok(_) => Ok(()),
            // Pipe full: a wakeup is already pending
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Discard all pending wake bytes
    pub fn drain(&self) {
        let mut scratch = [0u8; 64];
        loop {
            match (&self.reader).read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Failed to drain wake pipe: {}", e);
                    break;
                }
            }
        }
    }

    /// Raw descriptor of the read end, for callers building their own poll set
    pub fn read_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    /// Block until woken, until one of `extra` is ready, or until `timeout`
    ///
    /// `None` waits indefinitely. Pending wake bytes are drained before
    /// returning so the next wait blocks again.
    ///
    /// Every descriptor in `extra` must stay open for the duration of the
    /// call; sessions guarantee this by closing the device only after the
    /// pump thread has been joined.
    pub fn wait(
        &self,
        extra: &[PollDescriptor],
        timeout: Option<Duration>,
    ) -> io::Result<WaitOutcome> {
        let mut fds = Vec::with_capacity(1 + extra.len());
        fds.push(PollFd::new(self.reader.as_fd(), PollFlags::POLLIN));
        for descriptor in extra {
            // SAFETY: the device owning this descriptor outlives the wait (see above)
            let fd = unsafe { BorrowedFd::borrow_raw(descriptor.fd) };
            fds.push(PollFd::new(fd, descriptor.events));
        }

        let timeout = match timeout {
            None => PollTimeout::NONE,
            Some(d) => PollTimeout::from(d.as_millis().min(u16::MAX as u128) as u16),
        };

        let ready = match poll(&mut fds, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => return Ok(WaitOutcome::Woken),
            Err(e) => return Err(e.into()),
        };

        let woken = fds[0]
            .revents()
            .map_or(false, |r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP));
        drop(fds);

        if woken {
            self.drain();
            Ok(WaitOutcome::Woken)
        } else if ready > 0 {
            Ok(WaitOutcome::Ready)
        } else {
            Ok(WaitOutcome::TimedOut)
        }
    }
}

impl std::fmt::Debug for WakeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeChannel")
            .field("reader", &self.reader.as_raw_fd())
            .field("writer", &self.writer.as_raw_fd())
            .finish()
    }
}
