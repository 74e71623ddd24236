//! /dev/poll backend for Solaris-family systems.
//!
//! Registrations are plain `pollfd` records written to the device; a change
//! of interest writes `POLLREMOVE` followed by the new mask. Waiting is
//! `ioctl(DP_POLL)`.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::events::{EventMask, IoReadiness};

use super::{Backend, mask_to_poll_events, poll_revents_to_mask};

const MAX_DEV_POLL_EVENTS: usize = 128;

// Not exposed by the libc crate; values from <sys/devpoll.h>.
const POLLREMOVE: i16 = 0x0800;
const DP_POLL: libc::c_int = (b'D' as libc::c_int) << 8 | 1;

#[repr(C)]
struct DvPoll {
    dp_fds: *mut libc::pollfd,
    dp_nfds: libc::c_int,
    dp_timeout: libc::c_int,
}

pub(crate) struct DevPollBackend {
    dp: OwnedFd,
    events: Vec<libc::pollfd>,
}

impl DevPollBackend {
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: opening a device path; the path literal is NUL-terminated.
        let fd = unsafe { libc::open(c"/dev/poll".as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        crate::fd::set_close_on_exec(fd)?;
        Ok(DevPollBackend {
            // SAFETY: fd was just returned by open() and is owned exclusively
            // here.
            dp: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![
                libc::pollfd {
                    fd: -1,
                    events: 0,
                    revents: 0,
                };
                MAX_DEV_POLL_EVENTS
            ],
        })
    }

    fn write_registrations(&mut self, records: &[libc::pollfd]) {
        let bytes = std::mem::size_of_val(records);
        // SAFETY: writing a packed pollfd array to the device, sized exactly.
        let n = unsafe {
            libc::write(
                self.dp.as_raw_fd(),
                records.as_ptr() as *const libc::c_void,
                bytes,
            )
        };
        if n != bytes as isize {
            log::warn!(
                "/dev/poll registration write failed: {}",
                io::Error::last_os_error()
            );
        }
    }
}

impl Backend for DevPollBackend {
    fn name(&self) -> &'static str {
        "devpoll"
    }

    fn configure_fd(&mut self, fd: RawFd, old: EventMask, new: EventMask) {
        let (old, new) = (old.interest(), new.interest());
        if old == new {
            return;
        }
        let mut records = [libc::pollfd {
            fd,
            events: 0,
            revents: 0,
        }; 2];
        let mut n = 0;
        if !old.is_empty() {
            records[n].events = POLLREMOVE;
            n += 1;
        }
        if !new.is_empty() {
            records[n].events = mask_to_poll_events(new);
            n += 1;
        }
        self.write_registrations(&records[..n]);
    }

    fn wait(
        &mut self,
        timeout_ms: i32,
        max_events: usize,
        out: &mut Vec<IoReadiness>,
    ) -> io::Result<()> {
        let cap = max_events.clamp(1, MAX_DEV_POLL_EVENTS);
        let mut dv = DvPoll {
            dp_fds: self.events.as_mut_ptr(),
            dp_nfds: cap as libc::c_int,
            dp_timeout: timeout_ms,
        };
        // SAFETY: dv points into our events buffer which holds at least
        // `cap` records.
        let n = unsafe { libc::ioctl(self.dp.as_raw_fd(), DP_POLL as _, &mut dv) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        for raw in &self.events[..n as usize] {
            if raw.revents != 0 {
                out.push(IoReadiness {
                    fd: raw.fd,
                    events: poll_revents_to_mask(raw.revents),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::nonblocking_pipe;

    #[test]
    fn reports_readable_pipe() {
        let mut backend = DevPollBackend::new().unwrap();
        let (read, write) = nonblocking_pipe().unwrap();
        backend.configure_fd(read.as_raw_fd(), EventMask::empty(), EventMask::READABLE);

        let mut events = Vec::new();
        backend.wait(0, 16, &mut events).unwrap();
        assert!(events.is_empty());

        // SAFETY: writing one byte from a valid buffer into our own pipe.
        unsafe {
            libc::write(write.as_raw_fd(), b"x".as_ptr() as *const _, 1);
        }
        backend.wait(100, 16, &mut events).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, read.as_raw_fd());
        assert!(events[0].events.contains(EventMask::READABLE));
    }

    #[test]
    fn deregistered_fd_is_silent() {
        let mut backend = DevPollBackend::new().unwrap();
        let (read, write) = nonblocking_pipe().unwrap();
        let fd = read.as_raw_fd();
        backend.configure_fd(fd, EventMask::empty(), EventMask::READABLE);
        backend.configure_fd(fd, EventMask::READABLE, EventMask::empty());

        // SAFETY: writing one byte from a valid buffer into our own pipe.
        unsafe {
            libc::write(write.as_raw_fd(), b"x".as_ptr() as *const _, 1);
        }
        let mut events = Vec::new();
        backend.wait(0, 16, &mut events).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn interest_change_rewrites_registration() {
        let mut backend = DevPollBackend::new().unwrap();
        let (_read, write) = nonblocking_pipe().unwrap();
        let fd = write.as_raw_fd();
        // Watch the write end for readability first, then switch the
        // registration to writability; only the new mask may report.
        backend.configure_fd(fd, EventMask::empty(), EventMask::READABLE);
        backend.configure_fd(fd, EventMask::READABLE, EventMask::WRITABLE);

        let mut events = Vec::new();
        backend.wait(100, 16, &mut events).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].events.contains(EventMask::WRITABLE));
    }
}
