//! BSD / Darwin `kqueue` selector.
//!
//! kqueue tracks read and write readiness as separate filters, so switching
//! interest deletes one filter and adds the other.  Deleting a filter that
//! is not registered fails with `ENOENT`, which is ignored.

use std::io;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::Mutex;

use libc::{kevent, EVFILT_READ, EVFILT_USER, EVFILT_WRITE, EV_ADD, EV_CLEAR, EV_DELETE, EV_EOF, EV_ERROR, NOTE_TRIGGER};

use super::{Event, Interest, Token, WAKE_TOKEN};
use crate::sys;

const EVENTS_CAPACITY: usize = 256;
const WAKE_IDENT: usize = 0;

pub(super) struct Selector {
    kq: RawFd,
    events: Mutex<Vec<libc::kevent>>,
}

// SAFETY: `udata` only ever carries a token value, never a pointer that is
// dereferenced.
unsafe impl Send for Selector {}
unsafe impl Sync for Selector {}

fn change(ident: usize, filter: i16, flags: u16, fflags: u32, token: u64) -> libc::kevent {
    // Field sets differ between platforms (FreeBSD 12 added `ext`), so start zeroed.
    let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
    ev.ident = ident as _;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev.fflags = fflags as _;
    ev.udata = token as usize as *mut libc::c_void;
    ev
}

impl Selector {
    pub(super) fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        let rc = unsafe { libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            sys::close(kq);
            return Err(err);
        }

        let selector = Self {
            kq,
            events: Mutex::new(Vec::with_capacity(EVENTS_CAPACITY)),
        };
        selector.submit(&change(WAKE_IDENT, EVFILT_USER, EV_ADD | EV_CLEAR, 0, WAKE_TOKEN))?;
        Ok(selector)
    }

    fn submit(&self, ev: &libc::kevent) -> io::Result<()> {
        let rc = unsafe { kevent(self.kq, ev, 1, ptr::null_mut(), 0, ptr::null()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn submit_delete(&self, fd: RawFd, filter: i16) -> io::Result<()> {
        match self.submit(&change(fd as usize, filter, EV_DELETE, 0, 0)) {
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            other => other,
        }
    }

    fn filter(interest: Interest) -> i16 {
        match interest {
            Interest::Read => EVFILT_READ,
            Interest::Write => EVFILT_WRITE,
        }
    }

    pub(super) fn add(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.submit(&change(fd as usize, Self::filter(interest), EV_ADD, 0, token.0))
    }

    pub(super) fn modify(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let stale = match interest {
            Interest::Read => EVFILT_WRITE,
            Interest::Write => EVFILT_READ,
        };
        self.submit_delete(fd, stale)?;
        self.add(fd, token, interest)
    }

    pub(super) fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.submit_delete(fd, EVFILT_READ)?;
        self.submit_delete(fd, EVFILT_WRITE)
    }

    pub(super) fn wait(&self, out: &mut Vec<Event>) -> io::Result<()> {
        let mut raw = self
            .events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        raw.clear();

        let n = unsafe {
            kevent(
                self.kq,
                ptr::null(),
                0,
                raw.as_mut_ptr(),
                raw.capacity() as i32,
                ptr::null(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: kevent initialised the first `n` entries.
        unsafe { raw.set_len(n as usize) };

        for ev in raw.iter() {
            let token = ev.udata as usize as u64;
            if ev.filter == EVFILT_USER || token == WAKE_TOKEN {
                continue;
            }

            let failed = ev.flags & (EV_EOF | EV_ERROR) != 0;
            let token = Token(token);
            let readable = ev.filter == EVFILT_READ || failed;
            let writable = ev.filter == EVFILT_WRITE;

            // Read and write filters report separately; fold them per token.
            if let Some(existing) = out.iter_mut().find(|e| e.token == token) {
                existing.readable |= readable;
                existing.writable |= writable;
            } else {
                out.push(Event {
                    token,
                    readable,
                    writable,
                });
            }
        }
        Ok(())
    }

    pub(super) fn wake(&self) -> io::Result<()> {
        self.submit(&change(WAKE_IDENT, EVFILT_USER, 0, NOTE_TRIGGER, WAKE_TOKEN))
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        sys::close(self.kq);
    }
}
