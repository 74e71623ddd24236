//! Byte-stream abstraction and composition.
//!
//! A [`Stream`] has a read end and a write end, either of which may be
//! absent. Reads and writes never block: a zero-length result means "nothing
//! right now", and the `is_readable` / `is_writable` flags distinguish
//! would-block from end-of-stream: a stream that returns no bytes *and* is
//! no longer readable has ended.

use std::io;

use crate::buffer::Buffer;

mod memory;
mod queue;

pub use memory::MemoryStream;
pub use queue::{StreamQueue, concat_read_streams};

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The read end has been shut down.
    #[error("stream is shut down for reading")]
    ReadShutdown,

    /// The write end has been shut down.
    #[error("stream is shut down for writing")]
    WriteShutdown,

    /// A write-side substream went away while bytes staged for it were
    /// still waiting.
    #[error("substream shut down with {0} bytes still queued for it")]
    LingeringData(usize),
}

pub trait Stream {
    /// Read into `out`; `Ok(0)` with [`Stream::is_readable`] still true
    /// means try again later, `Ok(0)` with it false means end-of-stream.
    fn read(&mut self, out: &mut [u8]) -> Result<usize, StreamError>;

    /// Write from `data`; may accept fewer bytes than offered.
    fn write(&mut self, data: &[u8]) -> Result<usize, StreamError>;

    fn is_readable(&self) -> bool;

    fn is_writable(&self) -> bool;

    fn shutdown_read(&mut self) -> Result<(), StreamError>;

    fn shutdown_write(&mut self) -> Result<(), StreamError>;

    /// Pull one chunk from the stream into `buf`.
    fn read_into_buffer(&mut self, buf: &mut Buffer) -> Result<usize, StreamError> {
        let mut chunk = [0u8; 4096];
        let n = self.read(&mut chunk)?;
        buf.append(&chunk[..n]);
        Ok(n)
    }

    /// Push bytes from `buf` into the stream until it stops accepting.
    fn write_from_buffer(&mut self, buf: &mut Buffer) -> Result<usize, StreamError> {
        let mut total = 0;
        while !buf.is_empty() {
            let mut chunk = [0u8; 4096];
            let n = buf.peek(&mut chunk);
            let written = self.write(&chunk[..n])?;
            buf.discard(written);
            total += written;
            if written < n {
                break;
            }
        }
        Ok(total)
    }
}

/// An observable, trap-able event on a stream-like object.
///
/// Callers trap a hook with a notification function and, optionally, a
/// shutdown function; the owning object fires them. The shutdown
/// notification fires at most once.
#[derive(Default)]
pub struct Hook {
    func: Option<Box<dyn Fn()>>,
    shutdown_func: Option<Box<dyn Fn()>>,
    shutdown_sent: bool,
}

impl Hook {
    pub fn new() -> Self {
        Hook::default()
    }

    /// Register the notification function.
    pub fn trap(&mut self, func: impl Fn() + 'static) {
        self.func = Some(Box::new(func));
    }

    /// Register notification and shutdown functions together.
    pub fn trap_full(&mut self, func: impl Fn() + 'static, shutdown: impl Fn() + 'static) {
        self.func = Some(Box::new(func));
        self.shutdown_func = Some(Box::new(shutdown));
    }

    /// Drop both registered functions.
    pub fn untrap(&mut self) {
        self.func = None;
        self.shutdown_func = None;
    }

    pub fn is_trapped(&self) -> bool {
        self.func.is_some() || self.shutdown_func.is_some()
    }

    pub(crate) fn notify(&self) {
        if let Some(func) = &self.func {
            func();
        }
    }

    pub(crate) fn notify_shutdown(&mut self) {
        if self.shutdown_sent {
            return;
        }
        self.shutdown_sent = true;
        if let Some(func) = &self.shutdown_func {
            func();
        }
    }
}

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hook")
            .field("trapped", &self.is_trapped())
            .field("shutdown_sent", &self.shutdown_sent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn hook_notifies_when_trapped() {
        let count = Rc::new(Cell::new(0));
        let mut hook = Hook::new();
        hook.notify();
        let count2 = count.clone();
        hook.trap(move || count2.set(count2.get() + 1));
        hook.notify();
        hook.notify();
        assert_eq!(count.get(), 2);
        hook.untrap();
        hook.notify();
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn hook_shutdown_fires_once() {
        let count = Rc::new(Cell::new(0));
        let mut hook = Hook::new();
        let count2 = count.clone();
        hook.trap_full(|| {}, move || count2.set(count2.get() + 1));
        hook.notify_shutdown();
        hook.notify_shutdown();
        assert_eq!(count.get(), 1);
    }
}
