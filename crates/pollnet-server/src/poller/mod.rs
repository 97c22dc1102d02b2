//! Readiness poller, one per reactor shard.
//!
//! This module provides a single interface over the platform polling
//! mechanism:
//!
//! - **Linux / Android** – `epoll`, woken through an `eventfd`.
//! - **macOS / iOS / FreeBSD** – `kqueue`, woken through an `EVFILT_USER` event.
//!
//! The concrete selector is chosen at compile time.
//!
//! # Interest arbitration
//!
//! A descriptor is registered for read interest *or* write interest, never
//! both.  Switching is done with `mod_read` / `mod_write`, which replace the
//! registration rather than add to it.  While a connection drains a backlog
//! of outbound bytes it therefore stops reading, which keeps its inbound
//! buffers from growing without bound.
//!
//! # Tokens
//!
//! Each registration carries a [`Token`] packing the descriptor and the low
//! 32 bits of the connection id.  The shard resolves the descriptor through
//! the registry and discards the event if the ids disagree: that happens when
//! a descriptor was closed and the kernel handed the same number to a newer
//! connection before the old event was processed.

use std::io;
use std::os::fd::RawFd;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(target_os = "linux", target_os = "android"))]
use epoll::Selector;

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
mod kqueue;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
use kqueue::Selector;

/// Reserved for the wake-up source; never produced by [`Token::new`]
/// because descriptors are non-negative.
pub(crate) const WAKE_TOKEN: u64 = u64::MAX;

/// Opaque registration tag returned with each event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Token(pub(crate) u64);

impl Token {
    pub(crate) fn new(fd: RawFd, conn_id: u64) -> Self {
        Token((conn_id & 0xFFFF_FFFF) << 32 | u64::from(fd as u32))
    }

    pub(crate) fn fd(self) -> RawFd {
        (self.0 & 0xFFFF_FFFF) as u32 as RawFd
    }

    /// Whether this token was issued for connection `conn_id`.
    pub(crate) fn matches(self, conn_id: u64) -> bool {
        self.0 >> 32 == conn_id & 0xFFFF_FFFF
    }
}

/// Which readiness a registration waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
    Read,
    Write,
}

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Event {
    pub(crate) token: Token,
    /// Readable, hung up or errored: a read will not block.
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

/// A polling instance plus its wake-up source.
///
/// All methods take `&self`: registration changes may come from handler
/// threads (a `send` that has to queue) while the owning shard sits in
/// [`wait`](Poller::wait).
pub(crate) struct Poller {
    index: usize,
    selector: Selector,
}

impl Poller {
    pub(crate) fn new(index: usize) -> io::Result<Self> {
        Ok(Self {
            index,
            selector: Selector::new()?,
        })
    }

    /// Shard index; connections remember it so a failed shard can evict
    /// exactly its own connections.
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn add_read(&self, fd: RawFd, token: Token) -> io::Result<()> {
        self.selector.add(fd, token, Interest::Read)
    }

    /// Replaces the registration of `fd` with read interest.
    pub(crate) fn mod_read(&self, fd: RawFd, token: Token) -> io::Result<()> {
        self.selector.modify(fd, token, Interest::Read)
    }

    /// Replaces the registration of `fd` with write interest.
    pub(crate) fn mod_write(&self, fd: RawFd, token: Token) -> io::Result<()> {
        self.selector.modify(fd, token, Interest::Write)
    }

    pub(crate) fn remove(&self, fd: RawFd) -> io::Result<()> {
        self.selector.delete(fd)
    }

    /// Blocks until at least one event is ready or [`wake`](Poller::wake)
    /// is called.  `events` is cleared first.
    ///
    /// An interrupted wait returns `Ok` with no events; any other error
    /// means the polling instance itself is broken.
    pub(crate) fn wait(&self, events: &mut Vec<Event>) -> io::Result<()> {
        events.clear();
        match self.selector.wait(events) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            other => other,
        }
    }

    /// Interrupts a blocked [`wait`](Poller::wait) from any thread.
    pub(crate) fn wake(&self) -> io::Result<()> {
        self.selector.wake()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
