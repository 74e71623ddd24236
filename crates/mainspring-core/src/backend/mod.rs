//! OS readiness backends.
//!
//! A backend answers exactly two questions: "which conditions should this
//! descriptor be watched for?" ([`Backend::configure_fd`]) and "which
//! descriptors are ready right now?" ([`Backend::wait`]). Everything else
//! (timers, signals, child processes, dispatch) is layered above in the
//! reactor, so each backend stays a thin translation onto one OS facility.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::ReactorError;
use crate::events::{EventMask, IoReadiness};

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue;
#[cfg(any(target_os = "solaris", target_os = "illumos"))]
mod devpoll;
mod poll;
mod select;

/// Environment variable naming the backend to prefer.
pub const LOOP_TYPE_ENV: &str = "MAINSPRING_LOOP_TYPE";

/// One OS readiness engine.
pub(crate) trait Backend {
    fn name(&self) -> &'static str;

    /// Reconcile the kernel's registration for `fd` from `old` to `new`.
    /// `new` empty means forget the descriptor entirely. Registration
    /// failures are logged, not returned: by the time they happen the caller
    /// has already updated its own tables, and every backend degrades to
    /// "no events for that fd".
    fn configure_fd(&mut self, fd: RawFd, old: EventMask, new: EventMask);

    /// Block for up to `timeout_ms` milliseconds (negative means forever) and
    /// append up to `max_events` readiness facts to `out`. An interrupted
    /// wait returns `Ok` with nothing appended.
    fn wait(
        &mut self,
        timeout_ms: i32,
        max_events: usize,
        out: &mut Vec<IoReadiness>,
    ) -> io::Result<()>;
}

/// The selectable backend families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Epoll,
    DevPoll,
    Kqueue,
    Poll,
    Select,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Epoll => "epoll",
            BackendKind::DevPoll => "devpoll",
            BackendKind::Kqueue => "kqueue",
            BackendKind::Poll => "poll",
            BackendKind::Select => "select",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "epoll" => Some(BackendKind::Epoll),
            "devpoll" => Some(BackendKind::DevPoll),
            "kqueue" => Some(BackendKind::Kqueue),
            "poll" => Some(BackendKind::Poll),
            "select" => Some(BackendKind::Select),
            _ => None,
        }
    }

    /// Whether the backend may be driven from a reactor that shares process
    /// state with other threads. kqueue descriptors historically misbehave
    /// across fork/thread boundaries, so it is only offered to
    /// single-threaded callers.
    pub fn supports_threads(self) -> bool {
        !matches!(self, BackendKind::Kqueue)
    }

    fn available_on_this_platform(self) -> bool {
        match self {
            BackendKind::Epoll => cfg!(target_os = "linux"),
            BackendKind::DevPoll => cfg!(any(target_os = "solaris", target_os = "illumos")),
            BackendKind::Kqueue => cfg!(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd"
            )),
            BackendKind::Poll | BackendKind::Select => cfg!(unix),
        }
    }

    fn construct(self) -> io::Result<Box<dyn Backend>> {
        match self {
            #[cfg(target_os = "linux")]
            BackendKind::Epoll => Ok(Box::new(epoll::EpollBackend::new()?)),
            #[cfg(any(target_os = "solaris", target_os = "illumos"))]
            BackendKind::DevPoll => Ok(Box::new(devpoll::DevPollBackend::new()?)),
            #[cfg(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            BackendKind::Kqueue => Ok(Box::new(kqueue::KqueueBackend::new()?)),
            BackendKind::Poll => Ok(Box::new(poll::PollBackend::new())),
            BackendKind::Select => Ok(Box::new(select::SelectBackend::new())),
            #[allow(unreachable_patterns)]
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("backend `{}` is not available on this platform", self.name()),
            )),
        }
    }
}

/// Platform preference order.
const DEFAULT_ORDER: &[BackendKind] = &[
    BackendKind::Epoll,
    BackendKind::DevPoll,
    BackendKind::Kqueue,
    BackendKind::Poll,
    BackendKind::Select,
];

/// Construct a specific backend, without fallback.
pub(crate) fn create_named(kind: BackendKind) -> Result<Box<dyn Backend>, ReactorError> {
    if !kind.available_on_this_platform() {
        return Err(ReactorError::BackendSetup {
            name: kind.name(),
            source: io::Error::new(io::ErrorKind::Unsupported, "not available on this platform"),
        });
    }
    kind.construct().map_err(|source| ReactorError::BackendSetup {
        name: kind.name(),
        source,
    })
}

/// Construct the best available backend: the environment-selected one when it
/// is usable, then the platform preference order. `needs_threads` filters out
/// backends that cannot be shared across threads.
pub(crate) fn create_default(needs_threads: bool) -> Result<Box<dyn Backend>, ReactorError> {
    if let Ok(raw) = std::env::var(LOOP_TYPE_ENV) {
        let requested = raw.trim();
        if !requested.is_empty() {
            match BackendKind::from_name(requested) {
                Some(kind) if needs_threads && !kind.supports_threads() => {
                    log::warn!(
                        "{} does not support threads; falling back to the default backend",
                        requested
                    );
                }
                Some(kind) if !kind.available_on_this_platform() => {
                    log::warn!(
                        "{LOOP_TYPE_ENV} set to {requested}: not available on this platform"
                    );
                }
                Some(kind) => match kind.construct() {
                    Ok(backend) => return Ok(backend),
                    Err(err) => {
                        log::warn!("could not set up backend {requested}: {err}");
                    }
                },
                None => {
                    log::warn!("{LOOP_TYPE_ENV} set to {requested}: unsupported");
                }
            }
        }
    }

    for &kind in DEFAULT_ORDER {
        if !kind.available_on_this_platform() {
            continue;
        }
        if needs_threads && !kind.supports_threads() {
            continue;
        }
        match kind.construct() {
            Ok(backend) => return Ok(backend),
            Err(err) => {
                log::warn!("could not set up backend {}: {err}", kind.name());
            }
        }
    }
    Err(ReactorError::NoBackend)
}

// ---------------------------------------------------------------------------
// poll(2)-style bit translation, shared by the poll and /dev/poll backends
// ---------------------------------------------------------------------------

pub(crate) fn mask_to_poll_events(mask: EventMask) -> i16 {
    let mut events = 0;
    if mask.contains(EventMask::READABLE) {
        events |= libc::POLLIN;
    }
    if mask.contains(EventMask::WRITABLE) {
        events |= libc::POLLOUT;
    }
    events
}

pub(crate) fn poll_revents_to_mask(revents: i16) -> EventMask {
    let mut mask = EventMask::empty();
    if revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
        mask |= EventMask::READABLE;
    }
    if revents & (libc::POLLOUT | libc::POLLERR) != 0 {
        mask |= EventMask::WRITABLE;
    }
    if revents & libc::POLLERR != 0 {
        mask |= EventMask::ERROR;
    }
    mask
}
