//! Thin wrappers over the raw syscalls the reactor performs on connection
//! descriptors.
//!
//! Everything here operates on non-blocking descriptors and never sleeps.
//! `EINTR` is retried; every other failure is returned as `io::Error` so the
//! caller can tell `WouldBlock` apart from hard errors.

use std::io;
use std::os::fd::RawFd;

/// Reads into `buf`. `Ok(0)` means end of stream (or an empty datagram).
pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Writes from `buf`, returning how many bytes the kernel accepted.
///
/// Uses `send(MSG_NOSIGNAL)` where available so a peer reset surfaces as
/// `EPIPE` instead of killing the process with `SIGPIPE`.
pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
        let n = unsafe { libc::send(fd, buf.as_ptr().cast(), buf.len(), libc::MSG_NOSIGNAL) };
        #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };

        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Errors after which the descriptor is unusable.
pub(crate) fn is_fatal_write_error(err: &io::Error) -> bool {
    !matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Closes a descriptor that is not owned by any Rust type.
pub(crate) fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Sets `SO_NOSIGPIPE` on platforms without `MSG_NOSIGNAL`.
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub(crate) fn set_nosigpipe(fd: RawFd) -> io::Result<()> {
    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            (&one as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
pub(crate) fn set_nosigpipe(_fd: RawFd) -> io::Result<()> {
    Ok(())
}
