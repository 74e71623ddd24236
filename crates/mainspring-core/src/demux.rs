//! Process-wide signal and child-termination demultiplexing.
//!
//! Unix delivers signals to the process, not to a reactor, so one set of
//! process-wide tables fans deliveries out to every interested reactor:
//!
//! * Per signal *group* there is one pipe. The installed handler does the
//!   only thing an async-signal-safe handler can do: write the signal
//!   number as a single byte to the group pipe. No locks, no allocation, and
//!   failures are silently dropped (there is nobody to tell).
//! * The reactor that created a group pipe watches its read end. On
//!   readability it converts the bytes back into signal numbers and routes
//!   each to every subscribed reactor's [`Mailbox`], then wakes them.
//! * One SIGCHLD subscription (owned by the first reactor to watch any pid)
//!   drains `waitpid(-1, WNOHANG)` and routes termination records the same
//!   way, so every reactor sees every child it subscribed to without a
//!   thundering herd of wait loops.
//!
//! Mailboxes are appended to and drained under their own locks; wakeup
//! writes happen after the route table lock is released.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::{IntoRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use crate::events::WaitInfo;
use crate::fd::nonblocking_pipe;

/// The in-pipe payload is one byte, so signals are grouped by the bits above
/// it. Every real Unix signal number fits group 0; the extra slots keep the
/// arithmetic honest on platforms with large realtime-signal ranges.
const GROUP_SHIFT: u32 = 8;
const MAX_SIGNAL_GROUPS: usize = 4;

pub(crate) fn group_index(signo: i32) -> usize {
    (signo as u32 >> GROUP_SHIFT) as usize
}

pub(crate) fn group_high_bits(group: usize) -> i32 {
    (group as i32) << GROUP_SHIFT
}

/// Write ends of the group pipes, readable from the signal handler. -1 means
/// "no pipe yet".
static SIGNAL_PIPES: [AtomicI32; MAX_SIGNAL_GROUPS] =
    [const { AtomicI32::new(-1) }; MAX_SIGNAL_GROUPS];

struct Tables {
    signal_routes: HashMap<i32, Vec<Arc<Mailbox>>>,
    pid_routes: HashMap<libc::pid_t, Vec<Arc<Mailbox>>>,
    /// Which reactor's mailbox owns each group pipe's read end.
    group_owners: [Option<Arc<Mailbox>>; MAX_SIGNAL_GROUPS],
    /// Which reactor hosts the SIGCHLD reaper, if any.
    reaper: Option<Arc<Mailbox>>,
}

static TABLES: LazyLock<Mutex<Tables>> = LazyLock::new(|| {
    Mutex::new(Tables {
        signal_routes: HashMap::new(),
        pid_routes: HashMap::new(),
        group_owners: [const { None }; MAX_SIGNAL_GROUPS],
        reaper: None,
    })
});

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

/// Cross-thread notification box owned by one reactor.
///
/// The demultiplexer appends pending signal numbers and termination records
/// here from whichever thread hosts the delivering reactor; the owning
/// reactor drains them on its own thread.
pub(crate) struct Mailbox {
    /// Write end of the owner's wakeup pipe; -1 once the owner is gone.
    wakeup_fd: AtomicI32,
    signals: Mutex<VecDeque<i32>>,
    reaped: Mutex<VecDeque<WaitInfo>>,
}

impl Mailbox {
    pub(crate) fn new(wakeup_fd: i32) -> Self {
        Mailbox {
            wakeup_fd: AtomicI32::new(wakeup_fd),
            signals: Mutex::new(VecDeque::new()),
            reaped: Mutex::new(VecDeque::new()),
        }
    }

    /// Break the owner's backend wait by writing one byte to its wakeup
    /// pipe. Callable from any thread.
    pub(crate) fn wake(&self) {
        let fd = self.wakeup_fd.load(Ordering::Acquire);
        if fd >= 0 {
            let byte = 0u8;
            // SAFETY: writing one byte from a valid buffer; a full or closed
            // pipe is fine (the owner either wakes anyway or is gone).
            unsafe {
                libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
            }
        }
    }

    /// Called when the owning reactor goes away; later wakes become no-ops.
    pub(crate) fn retire(&self) {
        self.wakeup_fd.store(-1, Ordering::Release);
    }

    fn push_signal(&self, signo: i32) {
        self.signals.lock().expect("mailbox lock").push_back(signo);
    }

    fn push_reaped(&self, info: WaitInfo) {
        self.reaped.lock().expect("mailbox lock").push_back(info);
    }

    pub(crate) fn drain_signals(&self, out: &mut Vec<i32>) {
        out.extend(self.signals.lock().expect("mailbox lock").drain(..));
    }

    pub(crate) fn drain_reaped(&self, out: &mut Vec<WaitInfo>) {
        out.extend(self.reaped.lock().expect("mailbox lock").drain(..));
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.signals.lock().expect("mailbox lock").is_empty()
            || !self.reaped.lock().expect("mailbox lock").is_empty()
    }
}

// ---------------------------------------------------------------------------
// The signal handler
// ---------------------------------------------------------------------------

extern "C" fn deliver_signal(signo: libc::c_int) {
    let group = group_index(signo);
    if group >= MAX_SIGNAL_GROUPS {
        return;
    }
    let fd = SIGNAL_PIPES[group].load(Ordering::Acquire);
    if fd >= 0 {
        let byte = signo as u8;
        // SAFETY: write(2) is async-signal-safe; one byte from a stack
        // buffer. A failed or short write is dropped by contract.
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

fn install_handler(signo: i32) {
    // SAFETY: sigaction is POD and zeroed is a valid starting state; the
    // handler is async-signal-safe. SA_RESTART keeps interruptible syscalls
    // out of the EINTR business where possible.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        let handler: extern "C" fn(libc::c_int) = deliver_signal;
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signo, &action, std::ptr::null_mut());
    }
}

fn ignore_signal(signo: i32) {
    // SAFETY: as above, with the documented SIG_IGN disposition.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_IGN;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signo, &action, std::ptr::null_mut());
    }
}

// ---------------------------------------------------------------------------
// Signal subscription
// ---------------------------------------------------------------------------

/// Result of subscribing a reactor to a signal.
pub(crate) enum SignalRegistration {
    /// First subscriber in the whole process for this signal group: the
    /// calling reactor must watch `read_end` and route its bytes with
    /// `high_bits`.
    NewGroupPipe { read_end: OwnedFd, high_bits: i32 },
    /// The group pipe already exists and is watched elsewhere.
    Joined,
}

pub(crate) fn register_signal(
    signo: i32,
    mailbox: &Arc<Mailbox>,
) -> io::Result<SignalRegistration> {
    let group = group_index(signo);
    assert!(group < MAX_SIGNAL_GROUPS, "signal number {signo} out of range");

    let mut tables = TABLES.lock().expect("demux lock");
    let mut registration = SignalRegistration::Joined;
    let first_for_signal = tables
        .signal_routes
        .get(&signo)
        .is_none_or(|routes| routes.is_empty());

    if first_for_signal && SIGNAL_PIPES[group].load(Ordering::Acquire) < 0 {
        let (read_end, write_end) = nonblocking_pipe()?;
        SIGNAL_PIPES[group].store(write_end.into_raw_fd(), Ordering::Release);
        tables.group_owners[group] = Some(mailbox.clone());
        registration = SignalRegistration::NewGroupPipe {
            read_end,
            high_bits: group_high_bits(group),
        };
    }

    tables.signal_routes.entry(signo).or_default().push(mailbox.clone());
    if first_for_signal {
        install_handler(signo);
    }
    Ok(registration)
}

pub(crate) fn unregister_signal(signo: i32, mailbox: &Arc<Mailbox>) {
    let mut tables = TABLES.lock().expect("demux lock");
    let Some(routes) = tables.signal_routes.get_mut(&signo) else {
        log::warn!("signal {signo} was not registered with the demultiplexer");
        return;
    };
    routes.retain(|m| !Arc::ptr_eq(m, mailbox));
    if routes.is_empty() {
        tables.signal_routes.remove(&signo);
        ignore_signal(signo);
    }
}

/// Convert raw bytes read from a group pipe back into signal numbers and
/// deliver them to every subscribed mailbox.
pub(crate) fn route_signal_bytes(high_bits: i32, bytes: &[u8]) {
    let mut to_wake: Vec<Arc<Mailbox>> = Vec::new();
    {
        let tables = TABLES.lock().expect("demux lock");
        for &byte in bytes {
            let signo = high_bits | byte as i32;
            let Some(routes) = tables.signal_routes.get(&signo) else {
                continue;
            };
            for mailbox in routes {
                mailbox.push_signal(signo);
                if !to_wake.iter().any(|m| Arc::ptr_eq(m, mailbox)) {
                    to_wake.push(mailbox.clone());
                }
            }
        }
    }
    for mailbox in to_wake {
        mailbox.wake();
    }
}

// ---------------------------------------------------------------------------
// Child reaping
// ---------------------------------------------------------------------------

/// Subscribe a reactor's mailbox to one pid. Returns true when the caller
/// must install the process-wide SIGCHLD reaper (nobody hosts one yet).
pub(crate) fn register_pid(pid: libc::pid_t, mailbox: &Arc<Mailbox>) -> bool {
    let mut tables = TABLES.lock().expect("demux lock");
    let need_reaper = tables.reaper.is_none();
    if need_reaper {
        tables.reaper = Some(mailbox.clone());
    }
    tables.pid_routes.entry(pid).or_default().push(mailbox.clone());
    need_reaper
}

pub(crate) fn unregister_pid(pid: libc::pid_t, mailbox: &Arc<Mailbox>) {
    let mut tables = TABLES.lock().expect("demux lock");
    let Some(routes) = tables.pid_routes.get_mut(&pid) else {
        return;
    };
    routes.retain(|m| !Arc::ptr_eq(m, mailbox));
    if routes.is_empty() {
        tables.pid_routes.remove(&pid);
    }
}

/// Drain every reaped child and route the termination records. Runs on the
/// thread of whichever reactor hosts the SIGCHLD subscription.
pub(crate) fn reap_children() {
    while let Some(info) = do_waitpid(-1) {
        let mut to_wake: Vec<Arc<Mailbox>> = Vec::new();
        {
            let tables = TABLES.lock().expect("demux lock");
            if let Some(routes) = tables.pid_routes.get(&info.pid) {
                for mailbox in routes {
                    mailbox.push_reaped(info);
                    if !to_wake.iter().any(|m| Arc::ptr_eq(m, mailbox)) {
                        to_wake.push(mailbox.clone());
                    }
                }
            }
        }
        for mailbox in to_wake {
            mailbox.wake();
        }
    }
}

/// Non-blocking waitpid wrapper: retries on EINTR, decodes the status word.
/// Returns `None` when no child has terminated, and on any other error
/// (there is no caller that could act on one).
pub fn do_waitpid(pid: libc::pid_t) -> Option<WaitInfo> {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: status is a valid out-pointer.
        let rv = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        if rv < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return None;
        }
        if rv == 0 {
            return None;
        }
        return Some(WaitInfo::from_status(rv, status));
    }
}

/// Final deregistration when a reactor goes away. Any group pipe whose read
/// end belonged to this reactor is closed and forgotten so the next
/// subscriber creates a fresh one, and a hosted reaper slot is vacated so
/// the next pid watcher installs its own.
pub(crate) fn release_reactor(mailbox: &Arc<Mailbox>) {
    let mut tables = TABLES.lock().expect("demux lock");
    for (group, owner) in tables.group_owners.iter_mut().enumerate() {
        if owner.as_ref().is_some_and(|m| Arc::ptr_eq(m, mailbox)) {
            *owner = None;
            let fd = SIGNAL_PIPES[group].swap(-1, Ordering::AcqRel);
            if fd >= 0 {
                // SAFETY: the fd came from our own pipe creation; the
                // handler observes -1 before this close.
                unsafe {
                    libc::close(fd);
                }
            }
        }
    }
    if tables.reaper.as_ref().is_some_and(|m| Arc::ptr_eq(m, mailbox)) {
        tables.reaper = None;
    }
    tables
        .signal_routes
        .retain(|_, routes| {
            routes.retain(|m| !Arc::ptr_eq(m, mailbox));
            !routes.is_empty()
        });
    tables.pid_routes.retain(|_, routes| {
        routes.retain(|m| !Arc::ptr_eq(m, mailbox));
        !routes.is_empty()
    });
}

// ---------------------------------------------------------------------------
// fork support
// ---------------------------------------------------------------------------

/// Reset the demultiplexer in a child process: close the group pipes (their
/// read ends belonged to reactors that do not exist here) and forget every
/// route. Called from [`crate::on_fork`].
pub(crate) fn reset_after_fork() {
    for slot in &SIGNAL_PIPES {
        let fd = slot.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            // SAFETY: the fd came from our own pipe creation and nothing
            // else in the child owns it.
            unsafe {
                libc::close(fd);
            }
        }
    }
    if let Ok(mut tables) = TABLES.lock() {
        tables.signal_routes.clear();
        tables.pid_routes.clear();
        tables.group_owners = [const { None }; MAX_SIGNAL_GROUPS];
        tables.reaper = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn group_arithmetic() {
        assert_eq!(group_index(libc::SIGUSR1), 0);
        assert_eq!(group_index(255), 0);
        assert_eq!(group_index(256), 1);
        assert_eq!(group_high_bits(0), 0);
        assert_eq!(group_high_bits(1) | 3, 256 + 3);
    }

    #[test]
    fn mailbox_queues_and_drains() {
        let mailbox = Mailbox::new(-1);
        mailbox.push_signal(10);
        mailbox.push_signal(12);
        assert!(mailbox.has_pending());
        let mut signals = Vec::new();
        mailbox.drain_signals(&mut signals);
        assert_eq!(signals, vec![10, 12]);
        assert!(!mailbox.has_pending());
    }

    #[test]
    fn mailbox_wake_writes_to_pipe() {
        let (read, write) = nonblocking_pipe().unwrap();
        let mailbox = Mailbox::new(write.as_raw_fd());
        mailbox.wake();
        let mut buf = [0u8; 8];
        // SAFETY: reading into a valid buffer from our own fd.
        let n = unsafe { libc::read(read.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len()) };
        assert_eq!(n, 1);

        mailbox.retire();
        mailbox.wake();
        // SAFETY: as above.
        let n = unsafe { libc::read(read.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len()) };
        assert_eq!(n, -1);
    }

    #[test]
    fn do_waitpid_without_children() {
        // This test process has no un-reaped child of its own here.
        assert_eq!(do_waitpid(std::process::id() as libc::pid_t + 999_999), None);
    }

    #[test]
    fn routing_unknown_signal_is_harmless() {
        route_signal_bytes(0, &[63]);
    }
}
