//! epoll(7) backend.
//!
//! Level-triggered on purpose: sources are re-invoked every iteration until
//! the condition subsides, which is the dispatch contract the reactor makes.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::events::{EventMask, IoReadiness};

use super::Backend;

/// Upper bound on events pulled per wait; the reactor's own buffer doubling
/// handles sustained overload.
const MAX_EPOLL_EVENTS: usize = 512;

pub(crate) struct EpollBackend {
    epfd: OwnedFd,
    events: Vec<libc::epoll_event>,
}

impl EpollBackend {
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: epoll_create1 takes no pointers.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollBackend {
            // SAFETY: fd was just returned by epoll_create1 and is owned
            // exclusively here.
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EPOLL_EVENTS],
        })
    }
}

fn op_name(op: libc::c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "add",
        libc::EPOLL_CTL_MOD => "mod",
        libc::EPOLL_CTL_DEL => "del",
        _ => "op-unknown",
    }
}

impl Backend for EpollBackend {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn configure_fd(&mut self, fd: RawFd, old: EventMask, new: EventMask) {
        let (old, new) = (old.interest(), new.interest());
        if old.is_empty() && new.is_empty() {
            return;
        }
        let op = if new.is_empty() {
            libc::EPOLL_CTL_DEL
        } else if old.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut bits = 0u32;
        if new.contains(EventMask::READABLE) {
            bits |= libc::EPOLLIN as u32;
        }
        if new.contains(EventMask::WRITABLE) {
            bits |= libc::EPOLLOUT as u32;
        }
        let mut event = libc::epoll_event {
            events: bits,
            u64: fd as u64,
        };
        // SAFETY: epfd is a live epoll descriptor and `event` outlives the
        // call; the kernel copies it.
        if unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) } < 0 {
            log::warn!(
                "epoll_ctl: op={}, fd={}, events={:#x} failed: {}",
                op_name(op),
                fd,
                bits,
                io::Error::last_os_error()
            );
        }
    }

    fn wait(
        &mut self,
        timeout_ms: i32,
        max_events: usize,
        out: &mut Vec<IoReadiness>,
    ) -> io::Result<()> {
        let cap = max_events.clamp(1, MAX_EPOLL_EVENTS);
        // SAFETY: the events buffer holds at least `cap` entries and the
        // kernel writes no more than that.
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.events.as_mut_ptr(),
                cap as libc::c_int,
                timeout_ms,
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
            if raw.events & libc::EPOLLIN as u32 != 0 {
                mask |= EventMask::READABLE;
            }
            if raw.events & libc::EPOLLHUP as u32 != 0 {
                mask |= EventMask::READABLE;
            }
            if raw.events & libc::EPOLLERR as u32 != 0 {
                mask |= EventMask::ERROR | EventMask::READABLE | EventMask::WRITABLE;
            }
            if raw.events & libc::EPOLLOUT as u32 != 0 {
                mask |= EventMask::WRITABLE;
            }
            out.push(IoReadiness {
                fd: raw.u64 as RawFd,
                events: mask,
            });
        }
        Ok(())
    }
}
