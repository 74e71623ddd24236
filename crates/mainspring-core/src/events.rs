//! Readiness masks and the event records the reactor dispatches on.

use std::os::unix::io::RawFd;

bitflags::bitflags! {
    /// Generic readiness conditions, independent of the backend in use.
    ///
    /// Backends translate their native condition bits into this set. Hangup
    /// conditions surface as `READABLE` (and `WRITABLE` where the OS reports
    /// them that way) so a watching callback always runs and observes EOF;
    /// `ERROR` is set alongside both directions so the callback can shut the
    /// descriptor down.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct EventMask: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const ERROR    = 1 << 2;
    }
}

impl EventMask {
    /// The subset a source can register interest in.
    pub(crate) fn interest(self) -> EventMask {
        self & (EventMask::READABLE | EventMask::WRITABLE)
    }
}

/// Termination record for a reaped child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitInfo {
    pub pid: libc::pid_t,
    /// True when the child exited; false when a signal terminated it.
    pub exited: bool,
    /// Exit status when `exited`, terminating signal number otherwise.
    pub status: i32,
    pub dumped_core: bool,
}

impl WaitInfo {
    /// Decode a `waitpid` status word.
    pub(crate) fn from_status(pid: libc::pid_t, status: i32) -> Self {
        if libc::WIFEXITED(status) {
            WaitInfo {
                pid,
                exited: true,
                status: libc::WEXITSTATUS(status),
                dumped_core: false,
            }
        } else {
            WaitInfo {
                pid,
                exited: false,
                status: libc::WTERMSIG(status),
                dumped_core: libc::WCOREDUMP(status),
            }
        }
    }
}

/// One readiness fact returned from a backend wait.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IoReadiness {
    pub fd: RawFd,
    pub events: EventMask,
}

/// Everything a single reactor iteration can dispatch on.
#[derive(Debug, Clone)]
pub(crate) enum ReactorEvent {
    Io(IoReadiness),
    Signal(i32),
    Process(WaitInfo),
}
