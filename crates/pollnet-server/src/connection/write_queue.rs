//! Outbound backpressure for one connection.
//!
//! # How a write proceeds
//!
//! ```text
//! write(frame)
//!   ├─ backlog non-empty ─────────────► append to tail      → Queued
//!   └─ try one non-blocking write
//!        ├─ all bytes accepted ────────────────────────────► Complete
//!        ├─ 0 < n < len ─► keep frame[n..] as the head      → Queued
//!        ├─ WouldBlock / 0 ─► keep whole frame as the head  → Queued
//!        └─ hard error (EPIPE, EBADF, ...) ────────────────► Err
//!
//! proceed()   (on write readiness)
//!   loop: write the head's remaining bytes
//!        ├─ head fully sent ─► pop, continue with the next buffer
//!        ├─ partial / WouldBlock ─► remember offset          → Pending
//!        └─ queue empty ─────────────────────────────────────► Drained
//! ```
//!
//! `Queued` tells the connection to switch the poller to write interest;
//! `Drained` tells it to switch back to read interest.  Exactly one buffer,
//! the head, can be partially sent; its offset is the only cursor.

use std::collections::VecDeque;
use std::io;

use crate::sys;

/// The raw byte-level operations a connection performs on its descriptor.
///
/// This is the seam the unit tests mock to force partial, blocked and
/// failing writes without a real socket.
#[cfg_attr(test, mockall::automock)]
pub(crate) trait RawSocket {
    /// One non-blocking read; `Ok(0)` is end of stream.
    fn raw_read(&self, buf: &mut [u8]) -> io::Result<usize>;
    /// One non-blocking write.
    fn raw_write(&self, buf: &[u8]) -> io::Result<usize>;
}

impl RawSocket for socket2::Socket {
    fn raw_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        sys::read(std::os::fd::AsRawFd::as_raw_fd(self), buf)
    }

    fn raw_write(&self, buf: &[u8]) -> io::Result<usize> {
        sys::write(std::os::fd::AsRawFd::as_raw_fd(self), buf)
    }
}

/// Adapts a [`RawSocket`] to `io::Read` for the decoders.
pub(crate) struct RawReader<'a>(pub(crate) &'a dyn RawSocket);

impl io::Read for RawReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.raw_read(buf)
    }
}

/// Result of [`WriteQueue::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    /// Every byte reached the kernel.
    Complete,
    /// Bytes remain queued; write interest must be (or already is) registered.
    Queued,
}

/// Result of [`WriteQueue::proceed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProceedOutcome {
    /// Nothing left; restore read interest.
    Drained,
    /// The socket filled up again; keep write interest.
    Pending,
}

/// FIFO of byte buffers awaiting transmission.
#[derive(Debug, Default)]
pub(crate) struct WriteQueue {
    pending: VecDeque<Vec<u8>>,
    /// Bytes of `pending[0]` already sent.
    head_offset: usize,
}

impl WriteQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Unsent bytes across all buffers.
    pub(crate) fn pending_bytes(&self) -> usize {
        self.pending.iter().map(Vec::len).sum::<usize>() - self.head_offset
    }

    /// Attempts to send `frame`, queueing whatever the socket does not take.
    ///
    /// # Errors
    ///
    /// A hard socket error; the caller must close the connection.
    pub(crate) fn write(&mut self, sock: &dyn RawSocket, frame: Vec<u8>) -> io::Result<WriteOutcome> {
        if frame.is_empty() {
            return Ok(WriteOutcome::Complete);
        }
        if !self.pending.is_empty() {
            self.pending.push_back(frame);
            return Ok(WriteOutcome::Queued);
        }

        match sock.raw_write(&frame) {
            Ok(n) if n == frame.len() => Ok(WriteOutcome::Complete),
            Ok(n) => {
                self.pending.push_back(frame);
                self.head_offset = n;
                Ok(WriteOutcome::Queued)
            }
            Err(e) if !sys::is_fatal_write_error(&e) => {
                self.pending.push_back(frame);
                self.head_offset = 0;
                Ok(WriteOutcome::Queued)
            }
            Err(e) => Err(e),
        }
    }

    /// Continues sending the backlog after write readiness.
    ///
    /// # Errors
    ///
    /// A hard socket error; the caller must close the connection.
    pub(crate) fn proceed(&mut self, sock: &dyn RawSocket) -> io::Result<ProceedOutcome> {
        while let Some(head) = self.pending.front() {
            let rest = &head[self.head_offset..];
            match sock.raw_write(rest) {
                Ok(n) if n == rest.len() => {
                    self.pending.pop_front();
                    self.head_offset = 0;
                }
                Ok(0) => return Ok(ProceedOutcome::Pending),
                Ok(n) => {
                    self.head_offset += n;
                    return Ok(ProceedOutcome::Pending);
                }
                Err(e) if !sys::is_fatal_write_error(&e) => return Ok(ProceedOutcome::Pending),
                Err(e) => return Err(e),
            }
        }
        Ok(ProceedOutcome::Drained)
    }

    /// Drops every queued buffer.
    pub(crate) fn clear(&mut self) {
        self.pending.clear();
        self.head_offset = 0;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
