//! The reactor: a single-threaded cooperative event loop.
//!
//! User code registers *sources* (idle functions, timers, I/O watches,
//! signal subscriptions, child-process watches) and drives the loop with
//! [`Reactor::run`]. One iteration asks the backend for readiness, then
//! dispatches in a fixed, observable order: I/O events, then signals, then
//! child terminations, then embedded external loops, then idle functions,
//! then expired timers.
//!
//! Callbacks run to completion on the reactor's thread and may register or
//! remove any source, including the one currently running, or invoke the
//! reactor recursively. The lifetime protocol in [`source`] makes all of
//! that safe: a source removed mid-callback is only destroyed once its
//! outermost invocation returns.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{self, Backend, BackendKind};
use crate::demux::{self, Mailbox, SignalRegistration};
use crate::error::ReactorError;
use crate::events::{EventMask, IoReadiness, ReactorEvent, WaitInfo};
use crate::fd::nonblocking_pipe;
use crate::time::{TimeVal, current_time};

pub(crate) mod context;
pub(crate) mod source;
pub(crate) mod timers;

pub use context::{ExternalContext, PollRequest};
pub use source::SourceHandle;

use context::ContextEntry;
use source::{IoState, Source, SourceKind, TimerState};
use timers::{TimerKey, TimerTree};

/// Starting size of the per-wait event budget; doubled whenever a wait
/// returns a full buffer.
const INITIAL_MAX_EVENTS: usize = 2048;

/// What one [`Reactor::run`] call did.
#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    /// Number of source callbacks invoked.
    pub dispatched: usize,
    /// Wall time consumed, measured on the reactor's cached clock.
    pub elapsed: Duration,
}

/// Cross-thread wake handle, detached from the reactor's lifetime.
///
/// Cloneable and `Send`; waking a reactor that has since been dropped is a
/// no-op.
#[derive(Clone)]
pub struct WakeupHandle {
    mailbox: Arc<Mailbox>,
}

impl WakeupHandle {
    /// Break the reactor's current (or next) backend wait.
    pub fn wake(&self) {
        self.mailbox.wake();
    }
}

pub struct Reactor {
    backend: RefCell<Box<dyn Backend>>,
    backend_name: &'static str,

    cached_time: Cell<TimeVal>,

    idle: RefCell<Vec<Rc<Source>>>,
    timers: RefCell<TimerTree>,
    timer_seq: Cell<u64>,
    read_sources: RefCell<HashMap<RawFd, Rc<Source>>>,
    write_sources: RefCell<HashMap<RawFd, Rc<Source>>>,
    signal_sources: RefCell<HashMap<i32, Vec<Rc<Source>>>>,
    process_sources: RefCell<HashMap<libc::pid_t, Vec<Rc<Source>>>>,
    /// Watched pids that have not been reaped yet.
    alive_pids: RefCell<HashSet<libc::pid_t>>,
    contexts: RefCell<Vec<Rc<ContextEntry>>>,

    num_sources: Cell<usize>,
    max_events: Cell<usize>,
    quit_requested: Cell<bool>,
    /// Set when this reactor just installed the SIGCHLD reaper: the next run
    /// drains children that terminated before the handler existed.
    try_waitpid: Cell<bool>,

    mailbox: Arc<Mailbox>,
    /// Read ends of signal group pipes this reactor watches.
    group_pipes: RefCell<Vec<OwnedFd>>,
    _wakeup_read: OwnedFd,
    _wakeup_write: OwnedFd,
}

impl Reactor {
    /// Build a reactor on the best available backend, honouring the
    /// `MAINSPRING_LOOP_TYPE` environment variable.
    pub fn new() -> Result<Self, ReactorError> {
        Self::from_backend(backend::create_default(false)?)
    }

    /// Like [`Reactor::new`], but restricted to backends that are safe when
    /// the process uses threads.
    pub fn new_thread_safe() -> Result<Self, ReactorError> {
        Self::from_backend(backend::create_default(true)?)
    }

    /// Build a reactor on a specific backend, without fallback.
    pub fn with_backend(kind: BackendKind) -> Result<Self, ReactorError> {
        Self::from_backend(backend::create_named(kind)?)
    }

    fn from_backend(backend: Box<dyn Backend>) -> Result<Self, ReactorError> {
        let (wakeup_read, wakeup_write) = nonblocking_pipe().map_err(ReactorError::WakeupPipe)?;
        let backend_name = backend.name();
        let mailbox = Arc::new(Mailbox::new(wakeup_write.as_raw_fd()));
        let reactor = Reactor {
            backend: RefCell::new(backend),
            backend_name,
            cached_time: Cell::new(current_time()),
            idle: RefCell::new(Vec::new()),
            timers: RefCell::new(TimerTree::default()),
            timer_seq: Cell::new(0),
            read_sources: RefCell::new(HashMap::new()),
            write_sources: RefCell::new(HashMap::new()),
            signal_sources: RefCell::new(HashMap::new()),
            process_sources: RefCell::new(HashMap::new()),
            alive_pids: RefCell::new(HashSet::new()),
            contexts: RefCell::new(Vec::new()),
            num_sources: Cell::new(0),
            max_events: Cell::new(INITIAL_MAX_EVENTS),
            quit_requested: Cell::new(false),
            try_waitpid: Cell::new(false),
            mailbox,
            group_pipes: RefCell::new(Vec::new()),
            _wakeup_read: wakeup_read,
            _wakeup_write: wakeup_write,
        };
        let wakeup_fd = reactor._wakeup_read.as_raw_fd();
        reactor.add_io(wakeup_fd, EventMask::READABLE, move |_reactor, fd, cond| {
            if cond.contains(EventMask::READABLE) {
                drain_pipe(fd);
            }
            true
        });
        Ok(reactor)
    }

    /// The reactor associated with the calling thread, created on first use.
    pub fn thread_default() -> Result<Rc<Reactor>, ReactorError> {
        THREAD_DEFAULT.with(|slot| {
            if let Some(reactor) = slot.borrow().as_ref() {
                return Ok(reactor.clone());
            }
            let reactor = Rc::new(Reactor::new_thread_safe()?);
            *slot.borrow_mut() = Some(reactor.clone());
            Ok(reactor)
        })
    }

    /// Name of the readiness backend in use.
    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    /// Number of live sources, internal ones included.
    pub fn num_sources(&self) -> usize {
        self.num_sources.get()
    }

    /// The cached time, updated at each iteration boundary.
    pub fn current_time(&self) -> TimeVal {
        self.cached_time.get()
    }

    /// Re-query the clock into the cache.
    pub fn update_current_time(&self) {
        self.cached_time.set(current_time());
    }

    /// Ask the loop to stop; [`Reactor::should_continue`] turns false.
    pub fn quit(&self) {
        self.quit_requested.set(true);
    }

    pub fn should_continue(&self) -> bool {
        !self.quit_requested.get()
    }

    /// Break the current (or next) backend wait from this thread.
    pub fn wakeup(&self) {
        self.mailbox.wake();
    }

    /// A `Send + Clone` handle other threads can use to break this
    /// reactor's wait.
    pub fn wakeup_handle(&self) -> WakeupHandle {
        WakeupHandle {
            mailbox: self.mailbox.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Source registration
    // -----------------------------------------------------------------------

    /// Add an idle function: runs once per iteration, and while any idle
    /// source exists the loop never blocks. Returning `false` removes it.
    pub fn add_idle(&self, func: impl Fn(&Reactor) -> bool + 'static) -> SourceHandle {
        let src = Source::new(SourceKind::Idle {
            func: Box::new(func),
        });
        self.idle.borrow_mut().push(src.clone());
        self.num_sources.set(self.num_sources.get() + 1);
        SourceHandle {
            source: Rc::downgrade(&src),
        }
    }

    /// Add a timer firing `relative` from now, then every `period`
    /// (`None` makes it a one-shot). Returning `false` removes it early.
    pub fn add_timer(
        &self,
        relative: Duration,
        period: Option<Duration>,
        func: impl Fn(&Reactor) -> bool + 'static,
    ) -> SourceHandle {
        let mut expire = self.cached_time.get();
        expire.add_duration(relative);
        self.insert_timer(expire, period.map(duration_millis), func)
    }

    /// Add a one-shot timer expiring at an absolute point in time (seconds
    /// and microseconds since the epoch).
    pub fn add_timer_absolute(
        &self,
        sec: i64,
        usec: i32,
        func: impl Fn(&Reactor) -> bool + 'static,
    ) -> SourceHandle {
        self.insert_timer(TimeVal::new(sec, usec), None, func)
    }

    fn insert_timer(
        &self,
        expire: TimeVal,
        period_ms: Option<u64>,
        func: impl Fn(&Reactor) -> bool + 'static,
    ) -> SourceHandle {
        let seq = self.timer_seq.get();
        self.timer_seq.set(seq + 1);
        let src = Source::new(SourceKind::Timer(TimerState {
            expire: Cell::new(expire),
            period_ms: Cell::new(period_ms),
            seq,
            in_tree: Cell::new(true),
            adjusted_while_running: Cell::new(false),
            func: Box::new(func),
        }));
        self.timers
            .borrow_mut()
            .insert(TimerKey { expire, seq }, src.clone());
        self.num_sources.set(self.num_sources.get() + 1);
        SourceHandle {
            source: Rc::downgrade(&src),
        }
    }

    /// Watch a file descriptor. At most one source may watch a given fd for
    /// reading and one for writing (they may be the same source); violating
    /// that is a programming error and panics.
    ///
    /// The callback receives the ready conditions; `ERROR` is set when the
    /// descriptor failed and the callback is responsible for shutting it
    /// down. The watch is level-triggered: an unconsumed condition
    /// re-invokes the callback every iteration.
    pub fn add_io(
        &self,
        fd: RawFd,
        events: EventMask,
        func: impl Fn(&Reactor, RawFd, EventMask) -> bool + 'static,
    ) -> SourceHandle {
        assert!(fd >= 0, "invalid file descriptor");
        let events = events.interest();
        let old = self.io_events_for(fd);
        assert!(
            (old & events).is_empty(),
            "fd {fd} already has a source registered for those events"
        );
        let src = Source::new(SourceKind::Io(IoState {
            fd,
            events: Cell::new(events),
            func: Box::new(func),
        }));
        if events.contains(EventMask::READABLE) {
            self.read_sources.borrow_mut().insert(fd, src.clone());
        }
        if events.contains(EventMask::WRITABLE) {
            self.write_sources.borrow_mut().insert(fd, src.clone());
        }
        self.change_io(old, fd);
        self.num_sources.set(self.num_sources.get() + 1);
        SourceHandle {
            source: Rc::downgrade(&src),
        }
    }

    /// Run a callback when a Unix signal arrives. Delivery is synchronous on
    /// the reactor's thread, so non-reentrant code is safe; rapid repeats of
    /// a signal may coalesce. Multiple sources per signal are fine.
    pub fn add_signal(
        &self,
        signo: i32,
        func: impl Fn(&Reactor, i32) -> bool + 'static,
    ) -> SourceHandle {
        let src = Source::new(SourceKind::Signal {
            signo,
            func: Box::new(func),
        });
        let first_for_signal = {
            let mut map = self.signal_sources.borrow_mut();
            let chain = map.entry(signo).or_default();
            chain.push(src.clone());
            chain.len() == 1
        };
        if first_for_signal {
            match demux::register_signal(signo, &self.mailbox) {
                Ok(SignalRegistration::NewGroupPipe {
                    read_end,
                    high_bits,
                }) => {
                    let pipe_fd = read_end.as_raw_fd();
                    self.group_pipes.borrow_mut().push(read_end);
                    self.add_io(pipe_fd, EventMask::READABLE, move |reactor, fd, cond| {
                        if cond.contains(EventMask::READABLE) {
                            reactor.drain_signal_pipe(fd, high_bits);
                        }
                        true
                    });
                }
                Ok(SignalRegistration::Joined) => {}
                Err(err) => log::warn!("error creating signal pipe: {err}"),
            }
        }
        self.num_sources.set(self.num_sources.get() + 1);
        SourceHandle {
            source: Rc::downgrade(&src),
        }
    }

    /// Run a callback once when the given child process terminates. Process
    /// sources are one-shot: after delivery the source is removed.
    pub fn add_waitpid(
        &self,
        pid: libc::pid_t,
        func: impl Fn(&Reactor, &WaitInfo) + 'static,
    ) -> SourceHandle {
        let src = Source::new(SourceKind::Process {
            pid,
            func: Box::new(func),
        });
        let first_for_pid = {
            let mut map = self.process_sources.borrow_mut();
            let chain = map.entry(pid).or_default();
            chain.push(src.clone());
            chain.len() == 1
        };
        if first_for_pid {
            self.alive_pids.borrow_mut().insert(pid);
            if demux::register_pid(pid, &self.mailbox) {
                self.add_signal(libc::SIGCHLD, |_reactor, _signo| {
                    demux::reap_children();
                    true
                });
                self.try_waitpid.set(true);
            }
        }
        self.num_sources.set(self.num_sources.get() + 1);
        SourceHandle {
            source: Rc::downgrade(&src),
        }
    }

    /// Take responsibility for driving a foreign event loop.
    pub fn add_context(&self, ctx: Box<dyn ExternalContext>) {
        self.contexts.borrow_mut().push(Rc::new(ContextEntry::new(ctx)));
    }

    // -----------------------------------------------------------------------
    // Source manipulation
    // -----------------------------------------------------------------------

    /// Replace the set of conditions an I/O source watches.
    ///
    /// Reuse the source only for the same open descriptor: some backends
    /// (kqueue) drop registrations when a descriptor closes, and a
    /// same-number reuse would go unnoticed.
    pub fn adjust_io(&self, handle: &SourceHandle, events: EventMask) {
        let Some(src) = self.live_source(handle) else {
            return;
        };
        let io = src.io();
        let events = events.interest();
        if events == io.events.get().interest() {
            return;
        }
        let fd = io.fd;
        let old = self.io_events_for(fd);
        {
            let mut reads = self.read_sources.borrow_mut();
            if events.contains(EventMask::READABLE) {
                let existing = reads.get(&fd);
                assert!(
                    existing.is_none_or(|e| Rc::ptr_eq(e, &src)),
                    "fd {fd} readable interest belongs to another source"
                );
                reads.insert(fd, src.clone());
            } else if reads.get(&fd).is_some_and(|e| Rc::ptr_eq(e, &src)) {
                reads.remove(&fd);
            }
        }
        {
            let mut writes = self.write_sources.borrow_mut();
            if events.contains(EventMask::WRITABLE) {
                let existing = writes.get(&fd);
                assert!(
                    existing.is_none_or(|e| Rc::ptr_eq(e, &src)),
                    "fd {fd} writable interest belongs to another source"
                );
                writes.insert(fd, src.clone());
            } else if writes.get(&fd).is_some_and(|e| Rc::ptr_eq(e, &src)) {
                writes.remove(&fd);
            }
        }
        io.events.set(events);
        self.change_io(old, fd);
    }

    /// Watch additional conditions on an I/O source.
    pub fn add_io_events(&self, handle: &SourceHandle, events: EventMask) {
        if let Some(src) = self.live_source(handle) {
            let current = src.io().events.get();
            self.adjust_io(handle, current | events);
        }
    }

    /// Stop watching some conditions on an I/O source.
    pub fn remove_io_events(&self, handle: &SourceHandle, events: EventMask) {
        if let Some(src) = self.live_source(handle) {
            let current = src.io().events.get();
            self.adjust_io(handle, current - events);
        }
    }

    /// Re-arm a timer: next expiry `relative` from now, then every `period`.
    ///
    /// Called from inside the timer's own callback, the new schedule
    /// replaces the default advance-by-period re-arm.
    pub fn adjust_timer(&self, handle: &SourceHandle, relative: Duration, period: Option<Duration>) {
        let Some(src) = self.live_source(handle) else {
            return;
        };
        let timer = src.timer();
        if timer.in_tree.replace(false) {
            self.timers.borrow_mut().remove(&TimerKey {
                expire: timer.expire.get(),
                seq: timer.seq,
            });
        }
        let mut expire = self.cached_time.get();
        expire.add_duration(relative);
        timer.expire.set(expire);
        timer.period_ms.set(period.map(duration_millis));
        if src.run_count.get() == 0 {
            self.timers.borrow_mut().insert(
                TimerKey {
                    expire,
                    seq: timer.seq,
                },
                src.clone(),
            );
            timer.in_tree.set(true);
        } else {
            timer.adjusted_while_running.set(true);
        }
    }

    /// Allow (or forbid) dispatching this source while one of its
    /// invocations is already running. Off by default.
    pub fn set_reentrant(&self, handle: &SourceHandle, reentrant: bool) {
        if let Some(src) = self.live_source(handle) {
            src.is_reentrant.set(reentrant);
        }
    }

    /// Install a hook that runs exactly once when the source is destroyed.
    pub fn set_destroy_hook(&self, handle: &SourceHandle, hook: impl FnOnce() + 'static) {
        if let Some(src) = self.live_source(handle) {
            *src.on_destroy.borrow_mut() = Some(Box::new(hook));
        }
    }

    /// Destroy a source.
    ///
    /// If the source's callback is currently running, destruction is
    /// deferred until it returns, but an I/O source's descriptor
    /// registration is cleared immediately, so the caller may `close` the fd
    /// right away.
    pub fn remove(&self, handle: &SourceHandle) {
        let Some(src) = handle.source.upgrade() else {
            log::warn!("remove called on an already-destroyed source");
            return;
        };
        self.remove_source(&src);
    }

    /// Destroy every source, running destroy hooks. Intended for teardown;
    /// the internal wakeup watch goes away too.
    pub fn destroy_all_sources(&self) {
        let mut all: Vec<Rc<Source>> = Vec::new();
        all.extend(self.idle.borrow().iter().cloned());
        all.extend(self.timers.borrow().sources());
        all.extend(self.read_sources.borrow().values().cloned());
        all.extend(self.write_sources.borrow().values().cloned());
        for chain in self.signal_sources.borrow().values() {
            all.extend(chain.iter().cloned());
        }
        for chain in self.process_sources.borrow().values() {
            all.extend(chain.iter().cloned());
        }
        for src in all {
            if !src.is_destroyed.get() {
                self.remove_source(&src);
            }
        }
    }

    // -----------------------------------------------------------------------
    // The loop
    // -----------------------------------------------------------------------

    /// Run one iteration, waiting at most `timeout` (`None` waits until
    /// something happens).
    pub fn run(&self, timeout: Option<Duration>) -> RunSummary {
        let mut dispatched = 0usize;
        self.update_current_time();
        let start = self.cached_time.get();

        let mut timeout_ms: i64 = match timeout {
            None => -1,
            Some(d) => duration_millis(d).min(i32::MAX as u64) as i64,
        };
        if !self.idle.borrow().is_empty() {
            timeout_ms = 0;
        }
        if let Some(key) = self.timers.borrow().first_key() {
            let wait = key.expire.millis_until_ceil(&start) as i64;
            if timeout_ms < 0 || wait < timeout_ms {
                timeout_ms = wait;
            }
        }

        let ctx_entries: Vec<Rc<ContextEntry>> = self.contexts.borrow().clone();
        for entry in &ctx_entries {
            timeout_ms = self.prepare_context(entry, timeout_ms);
        }

        if self.try_waitpid.replace(false) {
            // Children that died before the reaper's handler existed.
            demux::reap_children();
        }
        if self.mailbox.has_pending() {
            timeout_ms = 0;
        }

        let max_events = self.max_events.get();
        let mut io_events: Vec<IoReadiness> = Vec::new();
        let timeout_arg = if timeout_ms < 0 {
            -1
        } else {
            timeout_ms.min(i32::MAX as i64) as i32
        };
        let wait_result = self
            .backend
            .borrow_mut()
            .wait(timeout_arg, max_events, &mut io_events);
        if let Err(err) = wait_result {
            log::warn!("backend wait failed: {err}");
        }
        self.update_current_time();
        let n_io = io_events.len();

        // Dispatch, pulling newly-arrived signal and process notifications
        // until none remain: an I/O event on a signal pipe queues signals,
        // and a SIGCHLD dispatch queues terminations.
        let mut pending: Vec<ReactorEvent> =
            io_events.drain(..).map(ReactorEvent::Io).collect();
        loop {
            for event in std::mem::take(&mut pending) {
                dispatched += match event {
                    ReactorEvent::Io(io) => self.run_io_sources(io.fd, io.events),
                    ReactorEvent::Signal(signo) => self.run_signal_sources(signo),
                    ReactorEvent::Process(info) => self.run_process_sources(&info),
                };
            }
            let mut signals = Vec::new();
            self.mailbox.drain_signals(&mut signals);
            let mut reaped = Vec::new();
            self.mailbox.drain_reaped(&mut reaped);
            if signals.is_empty() && reaped.is_empty() {
                break;
            }
            pending.extend(signals.into_iter().map(ReactorEvent::Signal));
            pending.extend(reaped.into_iter().map(ReactorEvent::Process));
        }

        for entry in &ctx_entries {
            self.finish_context(entry);
        }

        dispatched += self.run_idle_sources();
        dispatched += self.expire_timers();

        if n_io == max_events {
            // A full buffer means there may have been more; give the next
            // wait twice the room.
            self.max_events.set(max_events * 2);
        }

        let elapsed_ms = self.cached_time.get().millis_since(&start).max(0) as u64;
        RunSummary {
            dispatched,
            elapsed: Duration::from_millis(elapsed_ms),
        }
    }

    /// Drive the loop until [`Reactor::quit`] is called.
    pub fn run_until_quit(&self) {
        while self.should_continue() {
            self.run(None);
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn run_io_sources(&self, fd: RawFd, cond: EventMask) -> usize {
        let read_source = if cond.contains(EventMask::READABLE) {
            self.read_sources.borrow().get(&fd).cloned()
        } else {
            None
        };
        let write_source = if cond.contains(EventMask::WRITABLE) {
            self.write_sources.borrow().get(&fd).cloned()
        } else {
            None
        };
        let error = cond & EventMask::ERROR;

        match (read_source, write_source) {
            (None, None) => {
                log::warn!("got event {cond:?} for unknown file descriptor {fd}");
                0
            }
            (Some(read), Some(write)) if Rc::ptr_eq(&read, &write) => {
                self.invoke_io(&read, fd, EventMask::READABLE | EventMask::WRITABLE | error)
                    as usize
            }
            (read, write) => {
                let mut invoked = 0;
                if let Some(src) = read {
                    invoked += self.invoke_io(&src, fd, EventMask::READABLE | error) as usize;
                }
                if let Some(src) = write {
                    invoked += self.invoke_io(&src, fd, EventMask::WRITABLE | error) as usize;
                }
                invoked
            }
        }
    }

    fn invoke_io(&self, src: &Rc<Source>, fd: RawFd, cond: EventMask) -> bool {
        if !src.can_dispatch() {
            return false;
        }
        src.run_count.set(src.run_count.get() + 1);
        let keep = (src.io().func)(self, fd, cond);
        if !keep {
            src.must_remove.set(true);
        }
        src.run_count.set(src.run_count.get() - 1);
        if src.run_count.get() == 0 && src.must_remove.get() {
            self.finish_remove(src);
        }
        true
    }

    fn run_signal_sources(&self, signo: i32) -> usize {
        let chain: Vec<Rc<Source>> = self
            .signal_sources
            .borrow()
            .get(&signo)
            .cloned()
            .unwrap_or_default();
        let mut invoked = 0;
        for src in chain {
            if !src.can_dispatch() {
                continue;
            }
            let SourceKind::Signal { func, .. } = &src.kind else {
                continue;
            };
            src.run_count.set(src.run_count.get() + 1);
            let keep = func(self, signo);
            if !keep {
                src.must_remove.set(true);
            }
            src.run_count.set(src.run_count.get() - 1);
            if src.run_count.get() == 0 && src.must_remove.get() {
                self.finish_remove(&src);
            }
            invoked += 1;
        }
        invoked
    }

    fn run_process_sources(&self, info: &WaitInfo) -> usize {
        self.alive_pids.borrow_mut().remove(&info.pid);
        let chain: Vec<Rc<Source>> = self
            .process_sources
            .borrow()
            .get(&info.pid)
            .cloned()
            .unwrap_or_default();
        let mut invoked = 0;
        for src in chain {
            if !src.can_dispatch() {
                continue;
            }
            let SourceKind::Process { func, .. } = &src.kind else {
                continue;
            };
            src.run_count.set(src.run_count.get() + 1);
            func(self, info);
            // One notification per watcher, ever.
            src.must_remove.set(true);
            src.run_count.set(src.run_count.get() - 1);
            if src.run_count.get() == 0 {
                self.finish_remove(&src);
            }
            invoked += 1;
        }
        invoked
    }

    fn run_idle_sources(&self) -> usize {
        let snapshot: Vec<Rc<Source>> = self.idle.borrow().clone();
        let mut invoked = 0;
        for src in snapshot {
            if !src.can_dispatch() {
                continue;
            }
            let SourceKind::Idle { func } = &src.kind else {
                continue;
            };
            src.run_count.set(src.run_count.get() + 1);
            let keep = func(self);
            if !keep {
                src.must_remove.set(true);
            }
            src.run_count.set(src.run_count.get() - 1);
            if src.run_count.get() == 0 && src.must_remove.get() {
                self.finish_remove(&src);
            }
            invoked += 1;
        }
        invoked
    }

    fn expire_timers(&self) -> usize {
        let now = self.cached_time.get();
        let mut invoked = 0;
        // Tracks the expiry each timer last fired at in this pass: a timer
        // whose expiry does not advance (zero period) fires once per
        // iteration instead of spinning here forever.
        let mut fired_at: HashMap<u64, TimeVal> = HashMap::new();
        loop {
            let Some(key) = self.timers.borrow().first_key() else {
                break;
            };
            if key.expire > now {
                break;
            }
            if fired_at.get(&key.seq) == Some(&key.expire) {
                break;
            }
            fired_at.insert(key.seq, key.expire);

            let Some(src) = self.timers.borrow_mut().remove(&key) else {
                break;
            };
            let timer = src.timer();
            timer.in_tree.set(false);
            if !src.can_dispatch() {
                continue;
            }
            src.run_count.set(src.run_count.get() + 1);
            let keep = (timer.func)(self);
            if !keep {
                src.must_remove.set(true);
            }
            invoked += 1;
            src.run_count.set(src.run_count.get() - 1);

            if src.run_count.get() == 0 && src.must_remove.get() {
                self.finish_remove(&src);
                continue;
            }
            let timer = src.timer();
            if timer.adjusted_while_running.replace(false) {
                // The callback re-armed itself; its schedule wins.
            } else {
                match timer.period_ms.get() {
                    Some(period) => {
                        let mut expire = timer.expire.get();
                        expire.add_millis(period);
                        timer.expire.set(expire);
                    }
                    None => {
                        self.finish_remove(&src);
                        continue;
                    }
                }
            }
            if !timer.in_tree.get() {
                self.timers.borrow_mut().insert(
                    TimerKey {
                        expire: timer.expire.get(),
                        seq: timer.seq,
                    },
                    src.clone(),
                );
                timer.in_tree.set(true);
            }
        }
        invoked
    }

    // -----------------------------------------------------------------------
    // Embedded contexts
    // -----------------------------------------------------------------------

    fn prepare_context(&self, entry: &Rc<ContextEntry>, mut timeout_ms: i64) -> i64 {
        let priority = entry.ctx.borrow_mut().prepare();
        entry.priority.set(priority);
        {
            let mut requests = entry.requests.borrow_mut();
            requests.clear();
            let ctx_timeout = entry.ctx.borrow_mut().query(priority, &mut requests);
            for request in requests.iter_mut() {
                request.revents = EventMask::empty();
            }
            if let Some(limit) = ctx_timeout {
                let limit = duration_millis(limit).min(i32::MAX as u64) as i64;
                if timeout_ms < 0 || limit < timeout_ms {
                    timeout_ms = limit;
                }
            }
        }
        let count = entry.requests.borrow().len();
        let mut transient = entry.transient.borrow_mut();
        for index in 0..count {
            let (fd, events) = {
                let requests = entry.requests.borrow();
                (requests[index].fd, requests[index].events.interest())
            };
            let requests = entry.requests.clone();
            let handle = self.add_io(fd, events, move |_reactor, _fd, cond| {
                if let Some(request) = requests.borrow_mut().get_mut(index) {
                    request.revents |= cond;
                }
                true
            });
            transient.push(handle);
        }
        timeout_ms
    }

    fn finish_context(&self, entry: &Rc<ContextEntry>) {
        for handle in entry.transient.borrow_mut().drain(..) {
            self.remove(&handle);
        }
        let priority = entry.priority.get();
        {
            let requests = entry.requests.borrow();
            entry.ctx.borrow_mut().check(priority, &requests);
        }
        entry.ctx.borrow_mut().dispatch();
    }

    // -----------------------------------------------------------------------
    // Lifetime plumbing
    // -----------------------------------------------------------------------

    fn live_source(&self, handle: &SourceHandle) -> Option<Rc<Source>> {
        match handle.source.upgrade() {
            Some(src) if !src.is_destroyed.get() => Some(src),
            _ => {
                log::warn!("operation on a destroyed source ignored");
                None
            }
        }
    }

    fn io_events_for(&self, fd: RawFd) -> EventMask {
        let mut mask = EventMask::empty();
        if self.read_sources.borrow().contains_key(&fd) {
            mask |= EventMask::READABLE;
        }
        if self.write_sources.borrow().contains_key(&fd) {
            mask |= EventMask::WRITABLE;
        }
        mask
    }

    fn change_io(&self, old: EventMask, fd: RawFd) {
        let new = self.io_events_for(fd);
        self.backend.borrow_mut().configure_fd(fd, old, new);
    }

    fn remove_source(&self, src: &Rc<Source>) {
        if src.is_destroyed.get() {
            log::warn!("remove called on an already-destroyed source");
            return;
        }
        if src.run_count.get() > 0 {
            // Clear descriptor interest immediately even though destruction
            // is deferred: the caller may be about to close the fd.
            if let SourceKind::Io(io) = &src.kind {
                let fd = io.fd;
                let old = self.io_events_for(fd);
                if !old.is_empty() {
                    let events = io.events.get();
                    if events.contains(EventMask::READABLE) {
                        let mut reads = self.read_sources.borrow_mut();
                        if reads.get(&fd).is_some_and(|e| Rc::ptr_eq(e, src)) {
                            reads.remove(&fd);
                        }
                    }
                    if events.contains(EventMask::WRITABLE) {
                        let mut writes = self.write_sources.borrow_mut();
                        if writes.get(&fd).is_some_and(|e| Rc::ptr_eq(e, src)) {
                            writes.remove(&fd);
                        }
                    }
                    io.events.set(EventMask::empty());
                    self.change_io(old, fd);
                }
            }
            src.must_remove.set(true);
            return;
        }
        self.finish_remove(src);
    }

    fn finish_remove(&self, src: &Rc<Source>) {
        if src.is_destroyed.replace(true) {
            return;
        }
        if let Some(hook) = src.on_destroy.borrow_mut().take() {
            hook();
        }
        self.detach(src);
        self.num_sources.set(self.num_sources.get() - 1);
    }

    fn detach(&self, src: &Rc<Source>) {
        match &src.kind {
            SourceKind::Idle { .. } => {
                self.idle.borrow_mut().retain(|s| !Rc::ptr_eq(s, src));
            }
            SourceKind::Timer(timer) => {
                if timer.in_tree.replace(false) {
                    self.timers.borrow_mut().remove(&TimerKey {
                        expire: timer.expire.get(),
                        seq: timer.seq,
                    });
                }
            }
            SourceKind::Io(io) => {
                let fd = io.fd;
                let old = self.io_events_for(fd);
                let events = io.events.get();
                if events.contains(EventMask::READABLE) {
                    let mut reads = self.read_sources.borrow_mut();
                    if reads.get(&fd).is_some_and(|e| Rc::ptr_eq(e, src)) {
                        reads.remove(&fd);
                    }
                }
                if events.contains(EventMask::WRITABLE) {
                    let mut writes = self.write_sources.borrow_mut();
                    if writes.get(&fd).is_some_and(|e| Rc::ptr_eq(e, src)) {
                        writes.remove(&fd);
                    }
                }
                if !old.is_empty() {
                    self.change_io(old, fd);
                }
            }
            SourceKind::Signal { signo, .. } => {
                let empty = {
                    let mut map = self.signal_sources.borrow_mut();
                    if let Some(chain) = map.get_mut(signo) {
                        chain.retain(|s| !Rc::ptr_eq(s, src));
                        if chain.is_empty() {
                            map.remove(signo);
                            true
                        } else {
                            false
                        }
                    } else {
                        false
                    }
                };
                if empty {
                    demux::unregister_signal(*signo, &self.mailbox);
                }
            }
            SourceKind::Process { pid, .. } => {
                let empty = {
                    let mut map = self.process_sources.borrow_mut();
                    if let Some(chain) = map.get_mut(pid) {
                        chain.retain(|s| !Rc::ptr_eq(s, src));
                        if chain.is_empty() {
                            map.remove(pid);
                            true
                        } else {
                            false
                        }
                    } else {
                        false
                    }
                };
                if empty {
                    self.alive_pids.borrow_mut().remove(pid);
                    demux::unregister_pid(*pid, &self.mailbox);
                }
            }
        }
    }

    fn drain_signal_pipe(&self, fd: RawFd, high_bits: i32) {
        let mut buf = [0u8; 1024];
        // SAFETY: reading into a valid buffer from our own pipe fd.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n > 0 {
            demux::route_signal_bytes(high_bits, &buf[..n as usize]);
        } else if n == 0 {
            log::warn!("unexpected end-of-file on a signal pipe");
        } else {
            let err = std::io::Error::last_os_error();
            if !matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
            ) {
                log::warn!("error reading from a signal pipe: {err}");
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.mailbox.retire();
        self.destroy_all_sources();
        demux::release_reactor(&self.mailbox);
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("backend", &self.backend_name)
            .field("num_sources", &self.num_sources.get())
            .finish()
    }
}

thread_local! {
    static THREAD_DEFAULT: RefCell<Option<Rc<Reactor>>> = const { RefCell::new(None) };
}

/// Drop the calling thread's default-reactor reference (fork support).
pub(crate) fn clear_thread_default() {
    THREAD_DEFAULT.with(|slot| {
        slot.borrow_mut().take();
    });
}

fn duration_millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

fn drain_pipe(fd: RawFd) {
    let mut buf = [0u8; 4096];
    loop {
        // SAFETY: reading into a valid buffer from our own pipe fd.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < buf.len() as isize {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Signal dispositions and the demultiplexer tables are process-wide, so
    /// tests touching them take turns.
    static SIGNAL_TEST_LOCK: Mutex<()> = Mutex::new(());

    /// Surface `log` output from the demultiplexer and backends when a test
    /// is run with `RUST_LOG` set.
    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn counter() -> Rc<Cell<usize>> {
        Rc::new(Cell::new(0))
    }

    fn run_until(reactor: &Reactor, deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            reactor.run(Some(Duration::from_millis(25)));
        }
        done()
    }

    #[test]
    fn one_shot_timer_fires_once() {
        let reactor = Reactor::new().unwrap();
        let fired = counter();
        let fired2 = fired.clone();
        reactor.add_timer(Duration::from_millis(50), None, move |_| {
            fired2.set(fired2.get() + 1);
            true
        });
        let summary = reactor.run(Some(Duration::from_millis(100)));
        assert_eq!(fired.get(), 1);
        assert!(summary.elapsed >= Duration::from_millis(45), "{summary:?}");
        assert!(summary.dispatched >= 1);

        // One-shot: gone even though the callback returned true.
        reactor.run(Some(Duration::from_millis(10)));
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn periodic_timer_keeps_schedule() {
        let reactor = Reactor::new().unwrap();
        let fired = counter();
        let fired2 = fired.clone();
        reactor.add_timer(Duration::ZERO, Some(Duration::from_millis(10)), move |_| {
            fired2.set(fired2.get() + 1);
            true
        });
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(200) {
            reactor.run(Some(Duration::from_millis(20)));
        }
        let count = fired.get();
        assert!((15..=25).contains(&count), "fired {count} times");
    }

    #[test]
    fn self_removal_from_timer_callback() {
        let reactor = Reactor::new().unwrap();
        let fired = counter();
        let destroyed = counter();
        let handle_slot: Rc<RefCell<Option<SourceHandle>>> = Rc::new(RefCell::new(None));

        let fired2 = fired.clone();
        let slot2 = handle_slot.clone();
        let handle = reactor.add_timer(Duration::ZERO, Some(Duration::from_millis(5)), move |r| {
            fired2.set(fired2.get() + 1);
            r.remove(slot2.borrow().as_ref().unwrap());
            true
        });
        *handle_slot.borrow_mut() = Some(handle.clone());
        let destroyed2 = destroyed.clone();
        reactor.set_destroy_hook(&handle, move || destroyed2.set(destroyed2.get() + 1));

        reactor.run(Some(Duration::from_millis(50)));
        reactor.run(Some(Duration::from_millis(20)));
        assert_eq!(fired.get(), 1);
        assert_eq!(destroyed.get(), 1);
        assert!(!handle.is_attached());
    }

    #[test]
    fn signal_delivery() {
        init_logging();
        let _guard = SIGNAL_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let reactor = Reactor::new().unwrap();
        let seen: Rc<Cell<Option<i32>>> = Rc::new(Cell::new(None));
        let seen2 = seen.clone();
        reactor.add_signal(libc::SIGUSR1, move |_, signo| {
            seen2.set(Some(signo));
            true
        });
        // SAFETY: signalling our own process.
        unsafe {
            libc::kill(libc::getpid(), libc::SIGUSR1);
        }
        assert!(run_until(&reactor, Duration::from_secs(5), || seen.get().is_some()));
        assert_eq!(seen.get(), Some(libc::SIGUSR1));
    }

    #[test]
    fn child_reap() {
        init_logging();
        let _guard = SIGNAL_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let reactor = Reactor::new().unwrap();

        // SAFETY: the child calls nothing but _exit.
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            // SAFETY: async-signal-safe, terminates the child immediately.
            unsafe {
                libc::_exit(7);
            }
        }

        let seen: Rc<Cell<Option<WaitInfo>>> = Rc::new(Cell::new(None));
        let seen2 = seen.clone();
        let handle = reactor.add_waitpid(pid, move |_, info| {
            seen2.set(Some(*info));
        });
        assert!(run_until(&reactor, Duration::from_secs(5), || seen.get().is_some()));
        let info = seen.get().unwrap();
        assert_eq!(info.pid, pid);
        assert!(info.exited);
        assert_eq!(info.status, 7);
        assert!(!info.dumped_core);
        // Process sources are one-shot.
        assert!(!handle.is_attached());
    }

    #[test]
    fn destroy_hook_runs_exactly_once() {
        let reactor = Reactor::new().unwrap();
        let destroyed = counter();

        let handle = reactor.add_idle(|_| true);
        let destroyed2 = destroyed.clone();
        reactor.set_destroy_hook(&handle, move || destroyed2.set(destroyed2.get() + 1));

        // Removal outside any callback destroys immediately.
        reactor.remove(&handle);
        assert_eq!(destroyed.get(), 1);
        assert!(!handle.is_attached());

        // A second remove is a no-op.
        reactor.remove(&handle);
        reactor.run(Some(Duration::ZERO));
        assert_eq!(destroyed.get(), 1);
    }

    #[test]
    fn io_watch_is_level_triggered() {
        let reactor = Reactor::new().unwrap();
        let (read, write) = nonblocking_pipe().unwrap();
        let invoked = counter();
        let invoked2 = invoked.clone();
        reactor.add_io(read.as_raw_fd(), EventMask::READABLE, move |_, _, cond| {
            assert!(cond.contains(EventMask::READABLE));
            invoked2.set(invoked2.get() + 1);
            true
        });

        // SAFETY: writing one byte from a valid buffer into our own pipe.
        unsafe {
            libc::write(write.as_raw_fd(), b"x".as_ptr() as *const _, 1);
        }
        reactor.run(Some(Duration::from_millis(50)));
        assert_eq!(invoked.get(), 1);
        // Unconsumed data re-invokes the callback next iteration.
        reactor.run(Some(Duration::from_millis(50)));
        assert_eq!(invoked.get(), 2);

        let mut buf = [0u8; 4];
        // SAFETY: reading into a valid buffer from our own pipe.
        unsafe {
            libc::read(read.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len());
        }
        reactor.run(Some(Duration::ZERO));
        assert_eq!(invoked.get(), 2);
    }

    #[test]
    fn io_source_removable_then_closeable_from_callback() {
        use std::os::unix::io::IntoRawFd;

        init_logging();
        let reactor = Reactor::new().unwrap();
        let (read, write) = nonblocking_pipe().unwrap();
        let read_fd = read.into_raw_fd();
        let destroyed = counter();
        let handle_slot: Rc<RefCell<Option<SourceHandle>>> = Rc::new(RefCell::new(None));

        let slot2 = handle_slot.clone();
        let handle = reactor.add_io(read_fd, EventMask::READABLE, move |r, fd, _| {
            r.remove(slot2.borrow().as_ref().unwrap());
            // Registration is already gone, so closing is safe here.
            // SAFETY: fd is the pipe read end this callback owns.
            unsafe {
                libc::close(fd);
            }
            true
        });
        *handle_slot.borrow_mut() = Some(handle.clone());
        let destroyed2 = destroyed.clone();
        reactor.set_destroy_hook(&handle, move || destroyed2.set(destroyed2.get() + 1));

        // SAFETY: writing one byte from a valid buffer into our own pipe.
        unsafe {
            libc::write(write.as_raw_fd(), b"x".as_ptr() as *const _, 1);
        }
        reactor.run(Some(Duration::from_millis(50)));
        assert_eq!(destroyed.get(), 1);
        reactor.run(Some(Duration::ZERO));
        assert_eq!(destroyed.get(), 1);
    }

    #[test]
    fn idle_sources_run_in_registration_order() {
        let reactor = Reactor::new().unwrap();
        let order: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        for tag in [b'a', b'b', b'c'] {
            let order2 = order.clone();
            reactor.add_idle(move |_| {
                order2.borrow_mut().push(tag);
                false
            });
        }
        reactor.run(Some(Duration::from_millis(10)));
        assert_eq!(*order.borrow(), vec![b'a', b'b', b'c']);

        reactor.run(Some(Duration::ZERO));
        assert_eq!(order.borrow().len(), 3);
    }

    #[test]
    fn idle_forces_zero_timeout() {
        let reactor = Reactor::new().unwrap();
        reactor.add_idle(|_| true);
        let summary = reactor.run(Some(Duration::from_secs(2)));
        assert!(summary.elapsed < Duration::from_millis(500), "{summary:?}");
    }

    #[test]
    fn non_reentrant_source_not_reinvoked_recursively() {
        let reactor = Reactor::new().unwrap();
        let invoked = counter();
        let recursed = Rc::new(Cell::new(false));

        let invoked2 = invoked.clone();
        let recursed2 = recursed.clone();
        reactor.add_idle(move |r| {
            invoked2.set(invoked2.get() + 1);
            if !recursed2.replace(true) {
                r.run(Some(Duration::ZERO));
            }
            false
        });
        reactor.run(Some(Duration::ZERO));
        assert_eq!(invoked.get(), 1);
    }

    #[test]
    fn reentrant_source_reinvoked_recursively() {
        let reactor = Reactor::new().unwrap();
        let invoked = counter();
        let destroyed = counter();

        let invoked2 = invoked.clone();
        let handle = reactor.add_idle(move |r| {
            invoked2.set(invoked2.get() + 1);
            if invoked2.get() == 1 {
                r.run(Some(Duration::ZERO));
            }
            false
        });
        reactor.set_reentrant(&handle, true);
        let destroyed2 = destroyed.clone();
        reactor.set_destroy_hook(&handle, move || destroyed2.set(destroyed2.get() + 1));

        reactor.run(Some(Duration::ZERO));
        assert_eq!(invoked.get(), 2);
        assert_eq!(destroyed.get(), 1);
    }

    #[test]
    fn adjust_timer_inside_callback_overrides_rearm() {
        let reactor = Reactor::new().unwrap();
        let fire_times: Rc<RefCell<Vec<Instant>>> = Rc::new(RefCell::new(Vec::new()));
        let handle_slot: Rc<RefCell<Option<SourceHandle>>> = Rc::new(RefCell::new(None));

        let times2 = fire_times.clone();
        let slot2 = handle_slot.clone();
        let handle = reactor.add_timer(Duration::ZERO, Some(Duration::from_millis(5)), move |r| {
            times2.borrow_mut().push(Instant::now());
            if times2.borrow().len() == 1 {
                r.adjust_timer(
                    slot2.borrow().as_ref().unwrap(),
                    Duration::from_millis(40),
                    None,
                );
            }
            true
        });
        *handle_slot.borrow_mut() = Some(handle.clone());

        assert!(run_until(&reactor, Duration::from_secs(2), || {
            fire_times.borrow().len() >= 2
        }));
        let times = fire_times.borrow();
        assert_eq!(times.len(), 2);
        let gap = times[1].duration_since(times[0]);
        assert!(gap >= Duration::from_millis(35), "gap was {gap:?}");
        // The adjusted schedule had no period, so the timer is gone.
        assert!(!handle.is_attached());
    }

    #[test]
    fn quit_stops_run_until_quit() {
        let reactor = Reactor::new().unwrap();
        let iterations = counter();
        let iterations2 = iterations.clone();
        reactor.add_idle(move |r| {
            iterations2.set(iterations2.get() + 1);
            if iterations2.get() >= 3 {
                r.quit();
            }
            true
        });
        reactor.run_until_quit();
        assert!(!reactor.should_continue());
        assert_eq!(iterations.get(), 3);
    }

    #[test]
    fn cross_thread_wakeup_breaks_wait() {
        let reactor = Reactor::new().unwrap();
        let handle = reactor.wakeup_handle();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.wake();
        });
        let summary = reactor.run(Some(Duration::from_secs(5)));
        thread.join().unwrap();
        assert!(summary.elapsed < Duration::from_secs(4), "{summary:?}");
    }

    #[test]
    fn external_context_is_driven() {
        struct PipeContext {
            fd: RawFd,
            saw: Rc<Cell<EventMask>>,
            dispatched: Rc<Cell<bool>>,
        }
        impl ExternalContext for PipeContext {
            fn prepare(&mut self) -> i32 {
                0
            }
            fn query(&mut self, _priority: i32, requests: &mut Vec<PollRequest>) -> Option<Duration> {
                requests.push(PollRequest::new(self.fd, EventMask::READABLE));
                Some(Duration::from_millis(250))
            }
            fn check(&mut self, _priority: i32, requests: &[PollRequest]) -> bool {
                self.saw.set(requests[0].revents);
                !requests[0].revents.is_empty()
            }
            fn dispatch(&mut self) {
                if self.saw.get().contains(EventMask::READABLE) {
                    self.dispatched.set(true);
                }
            }
        }

        let reactor = Reactor::new().unwrap();
        let (read, write) = nonblocking_pipe().unwrap();
        let saw = Rc::new(Cell::new(EventMask::empty()));
        let dispatched = Rc::new(Cell::new(false));
        reactor.add_context(Box::new(PipeContext {
            fd: read.as_raw_fd(),
            saw: saw.clone(),
            dispatched: dispatched.clone(),
        }));

        // SAFETY: writing one byte from a valid buffer into our own pipe.
        unsafe {
            libc::write(write.as_raw_fd(), b"x".as_ptr() as *const _, 1);
        }
        reactor.run(Some(Duration::from_secs(2)));
        assert!(saw.get().contains(EventMask::READABLE));
        assert!(dispatched.get());

        // The transient watch is gone between iterations.
        assert_eq!(reactor.read_sources.borrow().len(), 1); // wakeup pipe only
    }

    #[test]
    fn destroy_all_sources_clears_everything() {
        let reactor = Reactor::new().unwrap();
        let destroyed = counter();
        let base_sources = reactor.num_sources();

        let (read, _write) = nonblocking_pipe().unwrap();
        let handles = [
            reactor.add_idle(|_| true),
            reactor.add_timer(Duration::from_secs(60), None, |_| true),
            reactor.add_io(read.as_raw_fd(), EventMask::READABLE, |_, _, _| true),
        ];
        for handle in &handles {
            let destroyed2 = destroyed.clone();
            reactor.set_destroy_hook(handle, move || destroyed2.set(destroyed2.get() + 1));
        }
        assert_eq!(reactor.num_sources(), base_sources + 3);

        reactor.destroy_all_sources();
        assert_eq!(destroyed.get(), 3);
        assert_eq!(reactor.num_sources(), 0);
        for handle in &handles {
            assert!(!handle.is_attached());
        }
    }

    #[test]
    fn thread_default_is_cached_per_thread() {
        let a = Reactor::thread_default().unwrap();
        let b = Reactor::thread_default().unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        clear_thread_default();
    }
}
