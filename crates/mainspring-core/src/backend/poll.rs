//! poll(2) backend.
//!
//! The `pollfd` array is kept dense. Deregistered slots are threaded into a
//! free list *through the array itself*: a free slot's `fd` field stores
//! `-2 - next_free_index`, which poll(2) ignores (negative fds are skipped)
//! and which needs no side allocation. The array is compacted before each
//! wait so the kernel never scans dead slots.

use std::io;
use std::os::unix::io::RawFd;

use crate::events::{EventMask, IoReadiness};

use super::{Backend, mask_to_poll_events, poll_revents_to_mask};

pub(crate) struct PollBackend {
    poll_fds: Vec<libc::pollfd>,
    /// fd → index into `poll_fds`, -1 when absent.
    fd_to_index: Vec<i32>,
    /// Head of the free list threaded through `poll_fds`, -1 when empty.
    first_free: i32,
}

impl PollBackend {
    pub(crate) fn new() -> Self {
        PollBackend {
            poll_fds: Vec::new(),
            fd_to_index: Vec::new(),
            first_free: -1,
        }
    }

    fn compact(&mut self) {
        if self.first_free < 0 {
            return;
        }
        let mut dst = 0;
        for src in 0..self.poll_fds.len() {
            let slot = self.poll_fds[src];
            if slot.fd >= 0 {
                self.fd_to_index[slot.fd as usize] = dst as i32;
                self.poll_fds[dst] = slot;
                dst += 1;
            }
        }
        self.poll_fds.truncate(dst);
        self.first_free = -1;
    }
}

impl Backend for PollBackend {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn configure_fd(&mut self, fd: RawFd, old: EventMask, new: EventMask) {
        let (old, new) = (old.interest(), new.interest());
        if self.fd_to_index.len() <= fd as usize {
            self.fd_to_index.resize(fd as usize + 1, -1);
        }
        let mut index = self.fd_to_index[fd as usize];

        if index < 0 {
            debug_assert!(old.is_empty());
            if new.is_empty() {
                return;
            }
            if self.first_free >= 0 {
                index = self.first_free;
                let slot = &mut self.poll_fds[index as usize];
                self.first_free = -2 - slot.fd;
                slot.fd = fd;
            } else {
                index = self.poll_fds.len() as i32;
                self.poll_fds.push(libc::pollfd {
                    fd,
                    events: 0,
                    revents: 0,
                });
            }
            self.fd_to_index[fd as usize] = index;
        } else if new.is_empty() {
            let slot = &mut self.poll_fds[index as usize];
            slot.fd = -2 - self.first_free;
            self.first_free = index;
            self.fd_to_index[fd as usize] = -1;
            return;
        }
        self.poll_fds[index as usize].events = mask_to_poll_events(new);
    }

    fn wait(
        &mut self,
        timeout_ms: i32,
        max_events: usize,
        out: &mut Vec<IoReadiness>,
    ) -> io::Result<()> {
        self.compact();

        // SAFETY: the array is dense and sized by its own length; poll only
        // writes `revents`.
        let rv = unsafe {
            libc::poll(
                self.poll_fds.as_mut_ptr(),
                self.poll_fds.len() as libc::nfds_t,
                timeout_ms,
            )
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
        for slot in &self.poll_fds {
            if slot.revents != 0 {
                out.push(IoReadiness {
                    fd: slot.fd,
                    events: poll_revents_to_mask(slot.revents),
                });
                emitted += 1;
                if emitted == max_events {
                    break;
                }
            }
        }
        Ok(())
    }
}
