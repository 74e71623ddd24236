//! In-memory stream, for composing queues and for tests.

use crate::buffer::Buffer;

use super::{Stream, StreamError};

/// A buffer-backed stream.
///
/// The readable variant ([`MemoryStream::with_content`]) serves a fixed byte
/// string and reports end-of-stream once drained. The sink variants accept
/// writes into an internal buffer, optionally up to a byte limit after which
/// the write end closes on its own.
pub struct MemoryStream {
    data: Buffer,
    readable_end: bool,
    writable_end: bool,
    write_limit: Option<usize>,
    written: usize,
}

impl MemoryStream {
    /// Readable stream serving `content`; ends when drained.
    pub fn with_content(content: &[u8]) -> Self {
        let mut data = Buffer::new();
        data.append(content);
        MemoryStream {
            data,
            readable_end: true,
            writable_end: false,
            write_limit: None,
            written: 0,
        }
    }

    /// Writable stream collecting everything written to it.
    pub fn sink() -> Self {
        MemoryStream {
            data: Buffer::new(),
            readable_end: false,
            writable_end: true,
            write_limit: None,
            written: 0,
        }
    }

    /// Writable stream that accepts at most `limit` bytes, then shuts its
    /// write end down by itself.
    pub fn sink_with_limit(limit: usize) -> Self {
        MemoryStream {
            write_limit: Some(limit),
            ..MemoryStream::sink()
        }
    }

    /// Take the bytes collected so far.
    pub fn take_written(&mut self) -> Vec<u8> {
        let mut out = vec![0u8; self.data.len()];
        self.data.read(&mut out);
        out
    }
}

impl Stream for MemoryStream {
    fn read(&mut self, out: &mut [u8]) -> Result<usize, StreamError> {
        if !self.readable_end {
            return Err(StreamError::ReadShutdown);
        }
        Ok(self.data.read(out))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, StreamError> {
        if !self.writable_end {
            return Err(StreamError::WriteShutdown);
        }
        let room = match self.write_limit {
            Some(limit) => limit - self.written,
            None => usize::MAX,
        };
        let accept = room.min(data.len());
        self.data.append(&data[..accept]);
        self.written += accept;
        if self.write_limit == Some(self.written) {
            self.writable_end = false;
        }
        Ok(accept)
    }

    fn is_readable(&self) -> bool {
        // Once the write end is gone an empty buffer means end-of-stream.
        self.readable_end && (!self.data.is_empty() || self.writable_end)
    }

    fn is_writable(&self) -> bool {
        self.writable_end
    }

    fn shutdown_read(&mut self) -> Result<(), StreamError> {
        self.readable_end = false;
        Ok(())
    }

    fn shutdown_write(&mut self) -> Result<(), StreamError> {
        self.writable_end = false;
        Ok(())
    }
}
