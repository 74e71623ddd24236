//! Construction-time errors for the reactor.
//!
//! Runtime trouble never surfaces here: an I/O error on a watched descriptor
//! is reported to that descriptor's callback as an `ERROR` condition, and
//! failures inside signal handlers are dropped by contract.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    /// No readiness backend could be set up on this platform.
    #[error("no readiness backend could be constructed")]
    NoBackend,

    /// A specific backend was requested and failed to set up.
    #[error("backend `{name}` failed to set up: {source}")]
    BackendSetup {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    /// The wakeup pipe could not be created.
    #[error("could not create the wakeup pipe: {0}")]
    WakeupPipe(#[from] io::Error),
}
