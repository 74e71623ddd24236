//! Source records and the lifetime bookkeeping shared by every kind.
//!
//! A source's life: created → run (maybe recursively, maybe repeatedly) →
//! detached from the reactor's tables → destroy hook → storage dropped.
//! `run_count` counts the in-flight invocations so removal from inside a
//! callback (including the source's own) defers destruction until the
//! outermost invocation returns; `must_remove` is the sticky note that makes
//! that happen.

use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use crate::events::{EventMask, WaitInfo};
use crate::time::TimeVal;

use super::Reactor;

pub(crate) type IdleFn = Box<dyn Fn(&Reactor) -> bool>;
pub(crate) type TimerFn = Box<dyn Fn(&Reactor) -> bool>;
pub(crate) type IoFn = Box<dyn Fn(&Reactor, RawFd, EventMask) -> bool>;
pub(crate) type SignalFn = Box<dyn Fn(&Reactor, i32) -> bool>;
pub(crate) type ProcessFn = Box<dyn Fn(&Reactor, &WaitInfo)>;

pub(crate) struct TimerState {
    pub expire: Cell<TimeVal>,
    /// Re-arm period; `None` is a one-shot.
    pub period_ms: Cell<Option<u64>>,
    /// Stable identity breaking expiry ties in the timer tree.
    pub seq: u64,
    pub in_tree: Cell<bool>,
    /// Set when `adjust_timer` ran inside this timer's own callback; the
    /// expiry it installed must survive the post-callback re-arm.
    pub adjusted_while_running: Cell<bool>,
    pub func: TimerFn,
}

pub(crate) struct IoState {
    pub fd: RawFd,
    pub events: Cell<EventMask>,
    pub func: IoFn,
}

pub(crate) enum SourceKind {
    Idle { func: IdleFn },
    Timer(TimerState),
    Io(IoState),
    Signal { signo: i32, func: SignalFn },
    Process { pid: libc::pid_t, func: ProcessFn },
}

pub(crate) struct Source {
    pub kind: SourceKind,
    /// Number of in-flight invocations of this source's callback.
    pub run_count: Cell<u32>,
    /// Removal was requested while running; honored at run_count == 0.
    pub must_remove: Cell<bool>,
    /// The destroy hook ran; set exactly once.
    pub is_destroyed: Cell<bool>,
    /// When false, the loop will not re-invoke this source while an
    /// invocation is in flight.
    pub is_reentrant: Cell<bool>,
    pub on_destroy: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl Source {
    pub(crate) fn new(kind: SourceKind) -> Rc<Self> {
        Rc::new(Source {
            kind,
            run_count: Cell::new(0),
            must_remove: Cell::new(false),
            is_destroyed: Cell::new(false),
            is_reentrant: Cell::new(false),
            on_destroy: RefCell::new(None),
        })
    }

    pub(crate) fn timer(&self) -> &TimerState {
        match &self.kind {
            SourceKind::Timer(state) => state,
            _ => panic!("not a timer source"),
        }
    }

    pub(crate) fn io(&self) -> &IoState {
        match &self.kind {
            SourceKind::Io(state) => state,
            _ => panic!("not an I/O source"),
        }
    }

    /// True when the loop may invoke the callback right now.
    pub(crate) fn can_dispatch(&self) -> bool {
        !self.is_destroyed.get()
            && !self.must_remove.get()
            && (self.run_count.get() == 0 || self.is_reentrant.get())
    }

    #[cfg(test)]
    pub(crate) fn idle_for_tests() -> Rc<Self> {
        Source::new(SourceKind::Idle {
            func: Box::new(|_| true),
        })
    }
}

/// Opaque, non-owning reference to a registered source.
///
/// The reactor owns the source; a handle only names it. Using a handle after
/// the source was destroyed is harmless; the operation degrades to a no-op.
#[derive(Clone)]
pub struct SourceHandle {
    pub(crate) source: Weak<Source>,
}

impl SourceHandle {
    /// Whether the source is still registered (not yet destroyed).
    pub fn is_attached(&self) -> bool {
        self.source
            .upgrade()
            .is_some_and(|s| !s.is_destroyed.get())
    }
}

impl std::fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.source.upgrade() {
            None => "dropped",
            Some(s) => match &s.kind {
                SourceKind::Idle { .. } => "idle",
                SourceKind::Timer(_) => "timer",
                SourceKind::Io(_) => "io",
                SourceKind::Signal { .. } => "signal",
                SourceKind::Process { .. } => "process",
            },
        };
        f.debug_struct("SourceHandle").field("kind", &kind).finish()
    }
}
