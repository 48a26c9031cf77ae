// src/net/poller.rs - Two-descriptor poll(2) multiplexer
//
// The loop waits on exactly two descriptors: the datagram socket (slot 0,
// optional) and the wake descriptor (slot 1). Write interest on the socket
// is recomputed every iteration from the send-queue state, so there is no
// register/modify dance - the interest set is rebuilt in place before each
// wait.
//
// - EINTR auto-retry
// - POLLERR/POLLHUP on either slot is reported as `hangup` (loop exit)

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// What one poll wait observed.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Events {
    pub socket_readable: bool,
    pub socket_writable: bool,
    pub wake_readable: bool,
    /// POLLERR or POLLHUP on the socket or the wake descriptor.
    pub hangup: bool,
}

pub(crate) struct Poller {
    fds: [libc::pollfd; 2],
}

impl Poller {
    /// `socket_fd` may be negative, in which case slot 0 is ignored by the
    /// kernel and only the wake descriptor is waited on.
    pub fn new(socket_fd: RawFd, wake_fd: RawFd) -> Self {
        Self {
            fds: [
                libc::pollfd {
                    fd: socket_fd,
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: wake_fd,
                    events: libc::POLLIN,
                    revents: 0,
                },
            ],
        }
    }

    /// Wait for events. `want_write` enables write interest on the socket
    /// for this wait only. `timeout` of `None` blocks indefinitely.
    pub fn wait(&mut self, want_write: bool, timeout: Option<Duration>) -> io::Result<Events> {
        self.fds[0].events = if want_write {
            libc::POLLIN | libc::POLLOUT
        } else {
            libc::POLLIN
        };
        self.fds[0].revents = 0;
        self.fds[1].revents = 0;

        let timeout_ms: libc::c_int = match timeout {
            Some(d) => d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1,
        };

        loop {
            // SAFETY: self.fds is a valid 2-element pollfd array owned by
            // self; poll writes only revents. Errors (including EINTR) are
            // checked immediately.
            let ret = unsafe { libc::poll(self.fds.as_mut_ptr(), 2, timeout_ms) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue; // EINTR - retry
                }
                return Err(err);
            }

            let sock = self.fds[0].revents;
            let wake = self.fds[1].revents;
            return Ok(Events {
                socket_readable: sock & libc::POLLIN != 0,
                socket_writable: sock & libc::POLLOUT != 0,
                wake_readable: wake & libc::POLLIN != 0,
                hangup: (sock | wake) & (libc::POLLERR | libc::POLLHUP) != 0,
            });
        }
    }
}
