//! # mainspring-core
//!
//! **A single-threaded cooperative event reactor for writing servers.**
//!
//! `mainspring-core` is the event-loop core that server code builds on: you
//! register *sources* (idle functions, timers, file-descriptor watches,
//! Unix signals, child processes) and the reactor dispatches their
//! callbacks from one thread, in a fixed and observable order.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::time::Duration;
//! use mainspring_core::Reactor;
//!
//! let reactor = Reactor::new().unwrap();
//!
//! // One-shot timer.
//! reactor.add_timer(Duration::from_millis(50), None, |_| {
//!     println!("tick");
//!     true
//! });
//!
//! // Run one iteration, waiting at most 100 ms.
//! let summary = reactor.run(Some(Duration::from_millis(100)));
//! println!("dispatched {} callbacks", summary.dispatched);
//! ```
//!
//! ## Architecture
//!
//! Sources → Reactor → Backend (epoll / kqueue / /dev/poll / poll / select)
//!
//! The backend is chosen per platform at construction, overridable with the
//! `MAINSPRING_LOOP_TYPE` environment variable. Signals and child
//! terminations are demultiplexed process-wide: an async-signal-safe
//! handler writes signal numbers into a pipe, and one SIGCHLD drain routes
//! termination records to every subscribed reactor.
//!
//! Two further subsystems ship alongside the reactor:
//!
//! * [`stream`]: byte-stream composition, where a [`StreamQueue`] chains
//!   substreams into one stream with backpressure and shutdown hooks.
//! * [`sorter`]: an external merge sorter with bounded memory, pluggable
//!   compare/merge functions, and spill-to-disk runs.
//!
//! ## Forking
//!
//! A process that forks while reactors exist must call [`on_fork`] in the
//! child: it drops the thread's default reactor and resets the process-wide
//! signal plumbing, closing the descriptors the child inherited.

pub mod backend;
pub mod buffer;
pub mod demux;
pub mod error;
pub mod events;
pub mod fd;
pub mod reactor;
pub mod sorter;
pub mod stream;
pub mod time;

pub use backend::{BackendKind, LOOP_TYPE_ENV};
pub use buffer::Buffer;
pub use demux::do_waitpid;
pub use error::ReactorError;
pub use events::{EventMask, WaitInfo};
pub use reactor::{
    ExternalContext, PollRequest, Reactor, RunSummary, SourceHandle, WakeupHandle,
};
pub use sorter::{ExternalSorter, MergeOutcome, SortReader, SorterError};
pub use stream::{Hook, MemoryStream, Stream, StreamError, StreamQueue, concat_read_streams};
pub use time::TimeVal;

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Reset process-wide state in a child process after `fork`.
///
/// Clears the calling thread's default reactor and resets the signal/child
/// demultiplexer, closing the group-pipe descriptors inherited from the
/// parent. Reactors themselves are not usable across a fork; the child
/// creates fresh ones on demand.
pub fn on_fork() {
    reactor::clear_thread_default();
    demux::reset_after_fork();
}
