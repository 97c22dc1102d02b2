//! Linux `epoll` selector.
//!
//! Registrations are level-triggered: a descriptor that still has unread
//! bytes (or still has send-buffer room) keeps reporting readiness, so a
//! connection that stops reading early to stay fair is woken again on the
//! next wait.

use std::io;
use std::os::fd::RawFd;
use std::sync::Mutex;

use libc::{
    epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT,
    EPOLLRDHUP, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
};

use super::{Event, Interest, Token, WAKE_TOKEN};
use crate::sys;

const EVENTS_CAPACITY: usize = 256;

pub(super) struct Selector {
    epoll: RawFd,
    eventfd: RawFd,
    /// Only the owning shard waits, so this lock is never contended.
    events: Mutex<Vec<epoll_event>>,
}

impl Selector {
    pub(super) fn new() -> io::Result<Self> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }

        let eventfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if eventfd < 0 {
            let err = io::Error::last_os_error();
            sys::close(epoll);
            return Err(err);
        }

        let selector = Self {
            epoll,
            eventfd,
            events: Mutex::new(Vec::with_capacity(EVENTS_CAPACITY)),
        };
        selector.ctl(EPOLL_CTL_ADD, eventfd, EPOLLIN as u32, WAKE_TOKEN)?;
        Ok(selector)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, flags: u32, token: u64) -> io::Result<()> {
        let mut event = epoll_event {
            events: flags,
            u64: token,
        };
        let rc = unsafe { epoll_ctl(self.epoll, op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn flags(interest: Interest) -> u32 {
        match interest {
            Interest::Read => (EPOLLIN | EPOLLRDHUP) as u32,
            Interest::Write => EPOLLOUT as u32,
        }
    }

    pub(super) fn add(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, Self::flags(interest), token.0)
    }

    pub(super) fn modify(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, Self::flags(interest), token.0)
    }

    pub(super) fn delete(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn wait(&self, out: &mut Vec<Event>) -> io::Result<()> {
        let mut raw = self
            .events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        raw.clear();

        let n = unsafe { epoll_wait(self.epoll, raw.as_mut_ptr(), raw.capacity() as i32, -1) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: epoll_wait initialised the first `n` entries.
        unsafe { raw.set_len(n as usize) };

        for ev in raw.iter() {
            let token = ev.u64;
            let flags = ev.events;

            if token == WAKE_TOKEN {
                let mut buf = 0u64;
                unsafe {
                    libc::read(self.eventfd, (&mut buf as *mut u64).cast(), 8);
                }
                continue;
            }

            out.push(Event {
                token: Token(token),
                readable: flags & (EPOLLIN | EPOLLERR | EPOLLHUP | EPOLLRDHUP) as u32 != 0,
                writable: flags & EPOLLOUT as u32 != 0,
            });
        }
        Ok(())
    }

    pub(super) fn wake(&self) -> io::Result<()> {
        let buf: u64 = 1;
        let rc = unsafe { libc::write(self.eventfd, (&buf as *const u64).cast(), 8) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // Counter saturated: a wake-up is already pending.
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        sys::close(self.eventfd);
        sys::close(self.epoll);
    }
}
