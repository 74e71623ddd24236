//! select(2) backend, the portable last resort.
//!
//! Three bitmaps carry the registrations; an ordered set of the active fds
//! bounds the post-wait scan (and supplies the `nfds` argument) so we never
//! sweep the whole `FD_SETSIZE` range.

use std::collections::BTreeSet;
use std::io;
use std::os::unix::io::RawFd;

use crate::events::{EventMask, IoReadiness};

use super::Backend;

pub(crate) struct SelectBackend {
    read_set: libc::fd_set,
    write_set: libc::fd_set,
    except_set: libc::fd_set,
    active: BTreeSet<RawFd>,
}

fn empty_set() -> libc::fd_set {
    // SAFETY: fd_set is a plain bit array; FD_ZERO establishes its
    // documented empty state.
    unsafe {
        let mut set = std::mem::zeroed();
        libc::FD_ZERO(&mut set);
        set
    }
}

impl SelectBackend {
    pub(crate) fn new() -> Self {
        SelectBackend {
            read_set: empty_set(),
            write_set: empty_set(),
            except_set: empty_set(),
            active: BTreeSet::new(),
        }
    }
}

impl Backend for SelectBackend {
    fn name(&self) -> &'static str {
        "select"
    }

    fn configure_fd(&mut self, fd: RawFd, _old: EventMask, new: EventMask) {
        if fd as usize >= libc::FD_SETSIZE {
            log::warn!("select backend cannot watch fd {fd} (FD_SETSIZE limit)");
            return;
        }
        let new = new.interest();
        if new.is_empty() {
            self.active.remove(&fd);
        } else {
            self.active.insert(fd);
        }
        // SAFETY: fd < FD_SETSIZE was checked above; the sets are owned.
        unsafe {
            if new.contains(EventMask::READABLE) {
                libc::FD_SET(fd, &mut self.read_set);
            } else {
                libc::FD_CLR(fd, &mut self.read_set);
            }
            if new.contains(EventMask::WRITABLE) {
                libc::FD_SET(fd, &mut self.write_set);
            } else {
                libc::FD_CLR(fd, &mut self.write_set);
            }
            libc::FD_CLR(fd, &mut self.except_set);
        }
    }

    fn wait(
        &mut self,
        timeout_ms: i32,
        max_events: usize,
        out: &mut Vec<IoReadiness>,
    ) -> io::Result<()> {
        let mut read_ready = self.read_set;
        let mut write_ready = self.write_set;
        let mut except_ready = self.except_set;
        let max_fd = self.active.last().copied().unwrap_or(-1);

        let mut tv;
        let tv_ptr = if timeout_ms < 0 {
            std::ptr::null_mut()
        } else {
            tv = libc::timeval {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_usec: (timeout_ms % 1000) as libc::suseconds_t * 1000,
            };
            &mut tv as *mut libc::timeval
        };

        // SAFETY: the three sets are valid fd_sets covering fds <= max_fd;
        // tv_ptr is null or points at a timeval that outlives the call.
        let rv = unsafe {
            libc::select(max_fd + 1, &mut read_ready, &mut write_ready, &mut except_ready, tv_ptr)
        };
        if rv < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        if rv == 0 || max_events == 0 {
            return Ok(());
        }

        let mut emitted = 0;
        for &fd in &self.active {
            // SAFETY: every member of `active` passed the FD_SETSIZE check.
            let (readable, writable, errored) = unsafe {
                (
                    libc::FD_ISSET(fd, &read_ready),
                    libc::FD_ISSET(fd, &write_ready),
                    libc::FD_ISSET(fd, &except_ready),
                )
            };
            if !(readable || writable || errored) {
                continue;
            }
            let mut mask = EventMask::empty();
            if readable {
                mask |= EventMask::READABLE;
            }
            if writable {
                mask |= EventMask::WRITABLE;
            }
            if errored {
                mask |= EventMask::ERROR | EventMask::READABLE | EventMask::WRITABLE;
            }
            out.push(IoReadiness { fd, events: mask });
            emitted += 1;
            if emitted == max_events {
                break;
            }
        }
        Ok(())
    }
}
