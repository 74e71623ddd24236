//! kqueue(2) backend for the BSDs and macOS.
//!
//! Read and write interest map to separate EVFILT_READ / EVFILT_WRITE
//! registrations. The kernel silently drops filters when a descriptor
//! closes, so EV_DELETE failures are expected and only traced.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::events::{EventMask, IoReadiness};

use super::Backend;

const MAX_KQUEUE_EVENTS: usize = 512;

pub(crate) struct KqueueBackend {
    kq: OwnedFd,
    events: Vec<libc::kevent>,
}

impl KqueueBackend {
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: kqueue() creates a new kernel event queue (always safe).
        let fd = unsafe { libc::kqueue() };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        crate::fd::set_close_on_exec(fd)?;
        Ok(KqueueBackend {
            // SAFETY: fd was just returned by kqueue() and is owned
            // exclusively here.
            kq: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![unsafe { std::mem::zeroed() }; MAX_KQUEUE_EVENTS],
        })
    }

    fn change(&mut self, fd: RawFd, filter: i16, add: bool) {
        // SAFETY: kevent is POD; zeroing is its documented neutral state.
        let mut kev: libc::kevent = unsafe { std::mem::zeroed() };
        kev.ident = fd as usize;
        kev.filter = filter as _;
        kev.flags = if add {
            libc::EV_ADD | libc::EV_ENABLE
        } else {
            libc::EV_DELETE
        } as _;
        // SAFETY: one changelist entry, no event output requested.
        let rc = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                &kev,
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if rc < 0 && add {
            log::warn!(
                "kevent: register fd={} filter={} failed: {}",
                fd,
                filter,
                io::Error::last_os_error()
            );
        }
    }
}

impl Backend for KqueueBackend {
    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn configure_fd(&mut self, fd: RawFd, old: EventMask, new: EventMask) {
        let (old, new) = (old.interest(), new.interest());
        let old_r = old.contains(EventMask::READABLE);
        let new_r = new.contains(EventMask::READABLE);
        if old_r != new_r {
            self.change(fd, libc::EVFILT_READ as i16, new_r);
        }
        let old_w = old.contains(EventMask::WRITABLE);
        let new_w = new.contains(EventMask::WRITABLE);
        if old_w != new_w {
            self.change(fd, libc::EVFILT_WRITE as i16, new_w);
        }
    }

    fn wait(
        &mut self,
        timeout_ms: i32,
        max_events: usize,
        out: &mut Vec<IoReadiness>,
    ) -> io::Result<()> {
        let cap = max_events.clamp(1, MAX_KQUEUE_EVENTS);
        let ts;
        let ts_ptr = if timeout_ms < 0 {
            std::ptr::null()
        } else {
            ts = libc::timespec {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_nsec: (timeout_ms % 1000) as libc::c_long * 1_000_000,
            };
            &ts as *const libc::timespec
        };
        // SAFETY: the events buffer holds at least `cap` entries; ts_ptr is
        // null or points at a timespec that outlives the call.
        let n = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                std::ptr::null(),
                0,
                self.events.as_mut_ptr(),
                cap as libc::c_int,
                ts_ptr,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        for raw in &self.events[..n as usize] {
            let mut mask = EventMask::empty();
            if raw.filter == libc::EVFILT_READ as _ {
                mask |= EventMask::READABLE;
            }
            if raw.filter == libc::EVFILT_WRITE as _ {
                mask |= EventMask::WRITABLE;
            }
            if raw.flags & libc::EV_EOF as libc::c_ushort != 0 {
                // A hung-up descriptor must still invoke the callback so the
                // consumer reads the EOF.
                mask |= EventMask::READABLE;
            }
            if raw.flags & libc::EV_ERROR as libc::c_ushort != 0 {
                mask |= EventMask::ERROR | EventMask::READABLE | EventMask::WRITABLE;
            }
            out.push(IoReadiness {
                fd: raw.ident as RawFd,
                events: mask,
            });
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
        let mut backend = KqueueBackend::new().unwrap();
        let (read, write) = nonblocking_pipe().unwrap();
        backend.configure_fd(read.as_raw_fd(), EventMask::empty(), EventMask::READABLE);

        // SAFETY: writing one byte from a valid buffer into our own pipe.
        unsafe {
            libc::write(write.as_raw_fd(), b"x".as_ptr() as *const _, 1);
        }
        let mut events = Vec::new();
        backend.wait(100, 16, &mut events).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, read.as_raw_fd());
        assert!(events[0].events.contains(EventMask::READABLE));
    }

    #[test]
    fn deregistered_fd_is_silent() {
        let mut backend = KqueueBackend::new().unwrap();
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
}
