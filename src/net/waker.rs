// src/net/waker.rs - Cross-thread wake channel
//
// A single "readable when signaled" descriptor used to interrupt the loop's
// poll wait from other threads:
// - Linux: eventfd (one fd, counter semantics)
// - other unix: non-blocking pipe pair (portability fallback)
//
// Writers push one 8-byte token; the loop drains until WouldBlock and clears
// its signaled flag afterwards.

use std::io;
use std::os::unix::io::RawFd;

pub(crate) struct Waker {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Waker {
    #[cfg(target_os = "linux")]
    pub fn new() -> io::Result<Self> {
        // SAFETY: eventfd takes no pointers; the result is checked
        // immediately and owned exclusively by the returned Waker.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            read_fd: fd,
            write_fd: fd,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: fds points to a valid 2-element array; pipe initializes
        // both entries on success, and the result is checked immediately.
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            // SAFETY: fd is a valid descriptor we just created; F_SETFL with
            // O_NONBLOCK has no pointer arguments.
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Make the read end readable. Short or failed writes are ignored: a
    /// full pipe already means the loop has an unread wake pending.
    pub fn wake(&self) {
        let one: u64 = 1;
        // SAFETY: the buffer is a valid 8-byte local; write on a non-blocking
        // descriptor either succeeds, short-writes, or fails with EAGAIN, all
        // of which leave the wake channel in a signaled-or-already-signaled
        // state.
        unsafe {
            libc::write(
                self.write_fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

    /// Drain every pending wake token. Called by the loop thread after poll
    /// reported the descriptor readable.
    pub fn drain(fd: RawFd) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: buf is a valid writable 64-byte local; read returns
            // <= buf.len() bytes or -1 with errno (EAGAIN ends the drain).
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        // SAFETY: both descriptors were created in new() and are owned
        // exclusively by self; Drop runs once, so no double close.
        unsafe {
            libc::close(self.read_fd);
            if self.write_fd != self.read_fd {
                libc::close(self.write_fd);
            }
        }
    }
}
