//! Bridge for embedding a foreign event loop inside a reactor.
//!
//! Some libraries insist on owning their own loop abstraction. Registering
//! such a loop as an [`ExternalContext`] lets one reactor drive both: each
//! iteration the reactor asks the context which descriptors and deadline it
//! needs, watches those descriptors for the duration of the wait, and hands
//! the observed readiness back.

use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use crate::events::EventMask;

use super::source::SourceHandle;

/// One descriptor a context wants watched for one iteration.
#[derive(Debug, Clone, Copy)]
pub struct PollRequest {
    pub fd: RawFd,
    /// Conditions the context wants watched.
    pub events: EventMask,
    /// Conditions observed during the wait; filled in by the reactor.
    pub revents: EventMask,
}

impl PollRequest {
    pub fn new(fd: RawFd, events: EventMask) -> Self {
        PollRequest {
            fd,
            events,
            revents: EventMask::empty(),
        }
    }
}

/// A foreign event loop driven by the reactor.
///
/// Call order per reactor iteration: [`prepare`](ExternalContext::prepare),
/// then [`query`](ExternalContext::query), then (after the backend wait)
/// [`check`](ExternalContext::check) and [`dispatch`](ExternalContext::dispatch).
/// `dispatch` runs unconditionally; `check`'s return value is informational,
/// mirroring loops whose dispatch step is a no-op when nothing is ready.
pub trait ExternalContext {
    /// Settle internal state; returns the priority to pass to `query` and
    /// `check`.
    fn prepare(&mut self) -> i32;

    /// Append the descriptors to watch this iteration and return the maximum
    /// time the reactor may sleep, or `None` for no constraint.
    fn query(&mut self, priority: i32, requests: &mut Vec<PollRequest>) -> Option<Duration>;

    /// Inspect the filled-in `revents`; returns whether anything is ready.
    fn check(&mut self, priority: i32, requests: &[PollRequest]) -> bool;

    /// Run whatever became ready.
    fn dispatch(&mut self);
}

/// Per-context bookkeeping held by the reactor.
pub(crate) struct ContextEntry {
    pub ctx: RefCell<Box<dyn ExternalContext>>,
    pub priority: Cell<i32>,
    /// Shared with the transient I/O callbacks that record readiness.
    pub requests: Rc<RefCell<Vec<PollRequest>>>,
    /// Sources registered for this iteration only.
    pub transient: RefCell<Vec<SourceHandle>>,
}

impl ContextEntry {
    pub(crate) fn new(ctx: Box<dyn ExternalContext>) -> Self {
        ContextEntry {
            ctx: RefCell::new(ctx),
            priority: Cell::new(0),
            requests: Rc::new(RefCell::new(Vec::new())),
            transient: RefCell::new(Vec::new()),
        }
    }
}
