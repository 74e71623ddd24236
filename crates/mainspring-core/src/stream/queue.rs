//! Queue-of-streams: a chain of substreams presented as one stream.
//!
//! The read side consumes a FIFO of readable substreams in order; the write
//! side feeds a FIFO of writable substreams through a bounded staging
//! buffer. Consumers observe four hooks: `readable_hook` / `writable_hook`
//! (data can flow again, and shutdown of the respective side) and
//! `read_empty` / `write_empty` (the corresponding FIFO drained).

use std::collections::VecDeque;

use crate::buffer::Buffer;

use super::{Hook, Stream, StreamError};

/// Bound on substream read attempts per [`Stream::read`] call, so a call
/// always reports progress instead of chewing through an arbitrarily long
/// chain of short substreams.
const READ_ATTEMPT_LIMIT: usize = 4;

/// Default cap on staged write bytes. Writes beyond it are truncated, which
/// is the backpressure signal to the producer; the cap releases (and
/// `writable_hook` fires) when staging drains to empty.
const DEFAULT_HIGH_WATER: usize = 16 * 1024;

pub struct StreamQueue {
    read_streams: VecDeque<Box<dyn Stream>>,
    write_streams: VecDeque<Box<dyn Stream>>,
    readable: bool,
    writable: bool,
    no_more_reads: bool,
    no_more_writes: bool,
    read_shutdown_sent: bool,
    write_shutdown_sent: bool,
    staged: Buffer,
    high_water: usize,

    /// Fires when the read side can make progress again, and (as shutdown)
    /// when the read side ends for good.
    pub readable_hook: Hook,
    /// Fires when staging drains to empty, and (as shutdown) when the write
    /// side ends for good.
    pub writable_hook: Hook,
    /// Fires when the last read substream is consumed, and (as shutdown)
    /// when no further read substreams can arrive.
    pub read_empty: Hook,
    /// Fires when the last write substream is consumed, and (as shutdown)
    /// when no further write substreams can arrive.
    pub write_empty: Hook,
}

impl StreamQueue {
    /// Create a queue; each side only exists if enabled here.
    pub fn new(readable: bool, writable: bool) -> Self {
        StreamQueue {
            read_streams: VecDeque::new(),
            write_streams: VecDeque::new(),
            readable,
            writable,
            no_more_reads: false,
            no_more_writes: false,
            read_shutdown_sent: false,
            write_shutdown_sent: false,
            staged: Buffer::new(),
            high_water: DEFAULT_HIGH_WATER,
            readable_hook: Hook::new(),
            writable_hook: Hook::new(),
            read_empty: Hook::new(),
            write_empty: Hook::new(),
        }
    }

    /// Change the staging cap (write-side backpressure threshold).
    pub fn set_high_water(&mut self, bytes: usize) {
        self.high_water = bytes;
    }

    /// Bytes staged for the write side but not yet accepted by a substream.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Append a substream to be read after all previously appended ones.
    pub fn append_read_stream(&mut self, substream: Box<dyn Stream>) {
        if !self.readable {
            log::warn!("append_read_stream on a queue without a read side");
            return;
        }
        if self.no_more_reads {
            log::warn!("append_read_stream after no_more_read_streams");
            return;
        }
        self.read_streams.push_back(substream);
        if self.read_streams.len() == 1 {
            self.readable_hook.notify();
        }
    }

    /// Declare that no further read substreams will be appended. Once the
    /// FIFO drains, the read side shuts down.
    pub fn no_more_read_streams(&mut self) {
        if self.no_more_reads {
            log::warn!("no_more_read_streams called twice");
            return;
        }
        self.no_more_reads = true;
        self.read_empty.notify_shutdown();
        self.maybe_read_shutdown();
    }

    /// Append a substream to be written after all previously appended ones.
    pub fn append_write_stream(&mut self, substream: Box<dyn Stream>) {
        if !self.writable {
            log::warn!("append_write_stream on a queue without a write side");
            return;
        }
        if self.no_more_writes {
            log::warn!("append_write_stream after no_more_write_streams");
            return;
        }
        self.write_streams.push_back(substream);
        if self.write_streams.len() == 1 {
            self.writable_hook.notify();
        }
    }

    /// Declare that no further write substreams will be appended. Once the
    /// FIFO and staging drain, the write side shuts down.
    pub fn no_more_write_streams(&mut self) {
        if self.no_more_writes {
            log::warn!("no_more_write_streams called twice");
            return;
        }
        self.no_more_writes = true;
        self.write_empty.notify_shutdown();
        self.maybe_write_shutdown();
    }

    /// Push staged bytes into the head write substream.
    pub fn flush(&mut self) -> Result<(), StreamError> {
        self.flush_staged()?;
        self.maybe_write_shutdown();
        Ok(())
    }

    fn flush_staged(&mut self) -> Result<(), StreamError> {
        let had_staged = !self.staged.is_empty();
        loop {
            // Consume substreams that went unwritable. One that still has
            // bytes staged for it took them to the grave: that is an error.
            while self
                .write_streams
                .front()
                .is_some_and(|head| !head.is_writable())
            {
                if !self.staged.is_empty() {
                    return Err(StreamError::LingeringData(self.staged.len()));
                }
                self.write_streams.pop_front();
                if self.write_streams.is_empty() {
                    self.write_empty.notify();
                }
            }
            if self.staged.is_empty() {
                break;
            }
            let Some(head) = self.write_streams.front_mut() else {
                if self.no_more_writes {
                    return Err(StreamError::LingeringData(self.staged.len()));
                }
                break;
            };
            let written = head.write_from_buffer(&mut self.staged)?;
            if written == 0 && head.is_writable() {
                break;
            }
        }
        if had_staged && self.staged.is_empty() {
            self.writable_hook.notify();
        }
        Ok(())
    }

    fn maybe_read_shutdown(&mut self) {
        if self.no_more_reads && self.read_streams.is_empty() && !self.read_shutdown_sent {
            self.read_shutdown_sent = true;
            self.readable_hook.notify_shutdown();
        }
    }

    fn maybe_write_shutdown(&mut self) {
        if self.no_more_writes
            && self.write_streams.is_empty()
            && self.staged.is_empty()
            && !self.write_shutdown_sent
        {
            self.write_shutdown_sent = true;
            self.writable_hook.notify_shutdown();
        }
    }
}

impl Stream for StreamQueue {
    fn read(&mut self, out: &mut [u8]) -> Result<usize, StreamError> {
        if !self.readable {
            return Err(StreamError::ReadShutdown);
        }
        if self.read_shutdown_sent {
            return Ok(0);
        }
        let mut total = 0;
        let mut attempts = 0;
        let mut failure = None;
        while total < out.len() && attempts < READ_ATTEMPT_LIMIT {
            let Some(head) = self.read_streams.front_mut() else {
                break;
            };
            attempts += 1;
            match head.read(&mut out[total..]) {
                Err(err) => {
                    failure = Some(err);
                    break;
                }
                Ok(n) => {
                    total += n;
                    if !head.is_readable() {
                        // Ended after being drained: silently consumed.
                        self.read_streams.pop_front();
                        if self.read_streams.is_empty() {
                            self.read_empty.notify();
                        }
                    } else if n == 0 {
                        break;
                    }
                }
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }
        if total == 0 {
            self.maybe_read_shutdown();
        }
        Ok(total)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, StreamError> {
        if !self.writable || self.write_shutdown_sent {
            return Err(StreamError::WriteShutdown);
        }
        let room = self.high_water.saturating_sub(self.staged.len());
        let accept = room.min(data.len());
        self.staged.append(&data[..accept]);
        self.flush_staged()?;
        self.maybe_write_shutdown();
        Ok(accept)
    }

    fn is_readable(&self) -> bool {
        self.readable && !self.read_shutdown_sent
    }

    fn is_writable(&self) -> bool {
        self.writable && !self.write_shutdown_sent
    }

    fn shutdown_read(&mut self) -> Result<(), StreamError> {
        let mut first_error = None;
        for mut substream in self.read_streams.drain(..) {
            if let Err(err) = substream.shutdown_read() {
                if first_error.is_none() {
                    first_error = Some(err);
                } else {
                    log::warn!("additional error shutting down a read substream: {err}");
                }
            }
        }
        self.read_shutdown_sent = true;
        self.readable_hook.notify_shutdown();
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn shutdown_write(&mut self) -> Result<(), StreamError> {
        let mut first_error = self.flush_staged().err();
        for mut substream in self.write_streams.drain(..) {
            if let Err(err) = substream.shutdown_write() {
                if first_error.is_none() {
                    first_error = Some(err);
                } else {
                    log::warn!("additional error shutting down a write substream: {err}");
                }
            }
        }
        self.write_shutdown_sent = true;
        self.writable_hook.notify_shutdown();
        if let Some(err) = first_error {
            return Err(err);
        }
        if !self.staged.is_empty() {
            return Err(StreamError::LingeringData(self.staged.len()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for StreamQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamQueue")
            .field("read_streams", &self.read_streams.len())
            .field("write_streams", &self.write_streams.len())
            .field("staged", &self.staged.len())
            .finish()
    }
}

/// Read-only queue serving the given substreams in order, with no further
/// substreams accepted.
pub fn concat_read_streams(substreams: Vec<Box<dyn Stream>>) -> StreamQueue {
    let mut queue = StreamQueue::new(true, false);
    for substream in substreams {
        queue.append_read_stream(substream);
    }
    queue.no_more_read_streams();
    queue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;
    use std::cell::Cell;
    use std::rc::Rc;

    struct FailingStream;

    impl Stream for FailingStream {
        fn read(&mut self, _out: &mut [u8]) -> Result<usize, StreamError> {
            Err(StreamError::Io(std::io::Error::other("boom")))
        }
        fn write(&mut self, _data: &[u8]) -> Result<usize, StreamError> {
            Err(StreamError::Io(std::io::Error::other("boom")))
        }
        fn is_readable(&self) -> bool {
            true
        }
        fn is_writable(&self) -> bool {
            true
        }
        fn shutdown_read(&mut self) -> Result<(), StreamError> {
            Ok(())
        }
        fn shutdown_write(&mut self) -> Result<(), StreamError> {
            Ok(())
        }
    }

    fn read_all(queue: &mut StreamQueue) -> Vec<u8> {
        let mut collected = Vec::new();
        let mut chunk = [0u8; 8];
        loop {
            match queue.read(&mut chunk).unwrap() {
                0 if !queue.is_readable() => break,
                0 => continue,
                n => collected.extend_from_slice(&chunk[..n]),
            }
        }
        collected
    }

    #[test]
    fn reads_concatenation_of_substreams() {
        let mut queue = StreamQueue::new(true, false);
        queue.append_read_stream(Box::new(MemoryStream::with_content(b"first ")));
        queue.append_read_stream(Box::new(MemoryStream::with_content(b"second ")));
        queue.append_read_stream(Box::new(MemoryStream::with_content(b"third")));
        queue.no_more_read_streams();

        assert_eq!(read_all(&mut queue), b"first second third");
        assert!(!queue.is_readable());
    }

    #[test]
    fn concat_convenience_matches_manual_queue() {
        let mut queue = concat_read_streams(vec![
            Box::new(MemoryStream::with_content(b"ab")),
            Box::new(MemoryStream::with_content(b"cd")),
        ]);
        assert_eq!(read_all(&mut queue), b"abcd");
    }

    #[test]
    fn read_attempts_are_bounded_per_call() {
        let mut queue = StreamQueue::new(true, false);
        for _ in 0..8 {
            queue.append_read_stream(Box::new(MemoryStream::with_content(b"")));
        }
        queue.append_read_stream(Box::new(MemoryStream::with_content(b"payload")));
        queue.no_more_read_streams();

        // Each call consumes at most a bounded number of empty substreams.
        let mut out = [0u8; 16];
        assert_eq!(queue.read(&mut out).unwrap(), 0);
        assert!(queue.is_readable());
        assert_eq!(queue.read(&mut out).unwrap(), 0);
        let n = queue.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"payload");
    }

    #[test]
    fn substream_error_short_circuits() {
        let mut queue = StreamQueue::new(true, false);
        queue.append_read_stream(Box::new(FailingStream));
        let mut out = [0u8; 4];
        assert!(matches!(queue.read(&mut out), Err(StreamError::Io(_))));
    }

    #[test]
    fn empty_hooks_fire_when_fifos_drain() {
        let read_drained = Rc::new(Cell::new(false));
        let mut queue = StreamQueue::new(true, false);
        let flag = read_drained.clone();
        queue.read_empty.trap(move || flag.set(true));

        queue.append_read_stream(Box::new(MemoryStream::with_content(b"x")));
        let mut out = [0u8; 4];
        queue.read(&mut out).unwrap();
        assert!(read_drained.get());
    }

    #[test]
    fn read_shutdown_emitted_once_drained() {
        let shutdown = Rc::new(Cell::new(0));
        let mut queue = StreamQueue::new(true, false);
        let flag = shutdown.clone();
        queue.readable_hook.trap_full(|| {}, move || flag.set(flag.get() + 1));

        queue.append_read_stream(Box::new(MemoryStream::with_content(b"tail")));
        queue.no_more_read_streams();
        assert_eq!(shutdown.get(), 0);

        assert_eq!(read_all(&mut queue), b"tail");
        assert_eq!(shutdown.get(), 1);
        let mut out = [0u8; 4];
        assert_eq!(queue.read(&mut out).unwrap(), 0);
        assert_eq!(shutdown.get(), 1);
    }

    #[test]
    fn writes_flow_into_head_substream() {
        let mut queue = StreamQueue::new(false, true);
        queue.append_write_stream(Box::new(MemoryStream::sink()));
        assert_eq!(queue.write(b"hello").unwrap(), 5);
        assert_eq!(queue.staged_len(), 0);
    }

    #[test]
    fn high_water_truncates_writes_until_drained() {
        let unblocked = Rc::new(Cell::new(false));
        let mut queue = StreamQueue::new(false, true);
        queue.set_high_water(8);
        let flag = unblocked.clone();
        queue.writable_hook.trap(move || flag.set(true));

        // No substream yet: bytes stage up to the high-water mark.
        assert_eq!(queue.write(b"0123456789abcdef").unwrap(), 8);
        assert_eq!(queue.staged_len(), 8);
        assert_eq!(queue.write(b"more").unwrap(), 0);

        queue.append_write_stream(Box::new(MemoryStream::sink()));
        queue.flush().unwrap();
        assert_eq!(queue.staged_len(), 0);
        assert!(unblocked.get());
        assert_eq!(queue.write(b"more").unwrap(), 4);
    }

    #[test]
    fn lingering_data_when_substream_dies_mid_write() {
        let mut queue = StreamQueue::new(false, true);
        queue.append_write_stream(Box::new(MemoryStream::sink_with_limit(4)));
        match queue.write(b"0123456789") {
            Err(StreamError::LingeringData(n)) => assert_eq!(n, 6),
            other => panic!("expected lingering-data error, got {other:?}"),
        }
    }

    #[test]
    fn drained_substream_consumed_silently() {
        let mut queue = StreamQueue::new(false, true);
        queue.append_write_stream(Box::new(MemoryStream::sink_with_limit(4)));
        // Exactly fills the first sink; no error, and the next write lands
        // in the second sink.
        assert_eq!(queue.write(b"abcd").unwrap(), 4);
        queue.append_write_stream(Box::new(MemoryStream::sink()));
        assert_eq!(queue.write(b"efgh").unwrap(), 4);
        assert_eq!(queue.staged_len(), 0);
    }

    #[test]
    fn write_shutdown_after_no_more_streams() {
        let shutdown = Rc::new(Cell::new(0));
        let mut queue = StreamQueue::new(false, true);
        let flag = shutdown.clone();
        queue.writable_hook.trap_full(|| {}, move || flag.set(flag.get() + 1));

        queue.append_write_stream(Box::new(MemoryStream::sink_with_limit(3)));
        assert_eq!(queue.write(b"abc").unwrap(), 3);
        queue.no_more_write_streams();
        queue.flush().unwrap();
        assert_eq!(shutdown.get(), 1);
        assert!(matches!(queue.write(b"x"), Err(StreamError::WriteShutdown)));
    }

    #[test]
    fn shutdown_write_reports_lingering_bytes() {
        let mut queue = StreamQueue::new(false, true);
        assert_eq!(queue.write(b"stuck").unwrap(), 5);
        match queue.shutdown_write() {
            Err(StreamError::LingeringData(n)) => assert_eq!(n, 5),
            other => panic!("expected lingering-data error, got {other:?}"),
        }
        assert!(!queue.is_writable());
    }
}
