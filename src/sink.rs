//! The byte destination collaborator and its batching front-end.
//!
//! The renderer does not know how bytes reach a peer; it pushes them at a
//! [`Sink`] and reads back a boolean capacity signal. [`ChunkSink`] sits in
//! front of the destination and batches the many small protocol fragments
//! the flush pass produces into fewer, larger writes.

use crate::error::RenderError;
use std::cell::RefCell;
use std::rc::Rc;

/// Default batching buffer size in bytes.
pub const DEFAULT_SINK_BUFFER: usize = 2048;

/// A push-based byte destination with backpressure.
pub trait Sink {
    /// Writes bytes, returning `true` while the destination still has
    /// capacity for more. A `false` return asks the flush protocol to stop
    /// after the current item and resume on a later pass; it does not mean
    /// the bytes were dropped.
    fn write(&mut self, bytes: &[u8]) -> bool;

    /// Signals successful end of stream.
    fn close(&mut self);

    /// Signals abnormal end of stream.
    fn error(&mut self, error: &RenderError);
}

/// Batches small writes into a rolling buffer before handing them to the
/// destination.
///
/// Chunks at or above the buffer size bypass the buffer and are written
/// directly. The capacity signal is sticky within one flush pass and reset
/// by [`ChunkSink::begin_pass`].
pub struct ChunkSink {
    dest: Box<dyn Sink>,
    buf: Vec<u8>,
    threshold: usize,
    has_capacity: bool,
}

impl ChunkSink {
    /// Wraps a destination with the given batching buffer size.
    #[must_use]
    pub fn new(dest: Box<dyn Sink>, threshold: usize) -> Self {
        let threshold = threshold.max(16);
        Self {
            dest,
            buf: Vec::with_capacity(threshold),
            threshold,
            has_capacity: true,
        }
    }

    /// Appends a chunk, flushing the internal buffer as needed.
    pub(crate) fn write_chunk(&mut self, bytes: &[u8]) {
        if bytes.len() >= self.threshold {
            self.flush();
            self.has_capacity &= self.dest.write(bytes);
            return;
        }
        if self.buf.len() + bytes.len() > self.threshold {
            self.flush();
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Forces any buffered bytes out to the destination.
    pub(crate) fn flush(&mut self) {
        if !self.buf.is_empty() {
            self.has_capacity &= self.dest.write(&self.buf);
            self.buf.clear();
        }
    }

    /// Returns the sticky capacity signal for the current pass.
    pub(crate) fn has_capacity(&self) -> bool {
        self.has_capacity
    }

    /// Starts a new flush pass, re-arming the capacity signal.
    pub(crate) fn begin_pass(&mut self) {
        self.has_capacity = true;
    }

    /// Flushes and closes the destination.
    pub(crate) fn close(&mut self) {
        self.flush();
        self.dest.close();
    }

    /// Flushes and signals an error on the destination.
    pub(crate) fn error(&mut self, error: &RenderError) {
        self.flush();
        self.dest.error(error);
    }
}

/// An in-memory [`Sink`] with an optional capacity budget, useful for tests
/// and for collecting a render into a byte vector.
#[derive(Clone)]
pub struct BufferSink {
    shared: Rc<RefCell<BufferSinkState>>,
}

struct BufferSinkState {
    data: Vec<u8>,
    budget: Option<usize>,
    closed: bool,
    errored: Option<RenderError>,
}

impl BufferSink {
    /// An unbounded in-memory sink.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Rc::new(RefCell::new(BufferSinkState {
                data: Vec::new(),
                budget: None,
                closed: false,
                errored: None,
            })),
        }
    }

    /// A sink that reports no-capacity once `budget` bytes arrived.
    ///
    /// Bytes are still accepted (nothing is dropped); only the capacity
    /// signal flips, exercising the flush protocol's mid-list stop.
    #[must_use]
    pub fn with_capacity_budget(budget: usize) -> Self {
        let sink = Self::new();
        sink.shared.borrow_mut().budget = Some(budget);
        sink
    }

    /// Grants another `budget` bytes of capacity.
    pub fn refill(&self, budget: usize) {
        let mut state = self.shared.borrow_mut();
        let used = state.data.len();
        state.budget = Some(used + budget);
    }

    /// Returns a copy of everything written so far.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.shared.borrow().data.clone()
    }

    /// Returns the written bytes as a string, replacing invalid UTF-8.
    #[must_use]
    pub fn contents_utf8(&self) -> String {
        String::from_utf8_lossy(&self.shared.borrow().data).into_owned()
    }

    /// Returns true once the stream was closed cleanly.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.borrow().closed
    }

    /// Returns the terminal error, if the stream ended abnormally.
    #[must_use]
    pub fn terminal_error(&self) -> Option<RenderError> {
        self.shared.borrow().errored.clone()
    }
}

impl Default for BufferSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for BufferSink {
    fn write(&mut self, bytes: &[u8]) -> bool {
        let mut state = self.shared.borrow_mut();
        state.data.extend_from_slice(bytes);
        match state.budget {
            Some(budget) => state.data.len() < budget,
            None => true,
        }
    }

    fn close(&mut self) {
        self.shared.borrow_mut().closed = true;
    }

    fn error(&mut self, error: &RenderError) {
        self.shared.borrow_mut().errored = Some(error.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingSink {
        writes: Rc<RefCell<Vec<Vec<u8>>>>,
    }

    impl Sink for CountingSink {
        fn write(&mut self, bytes: &[u8]) -> bool {
            self.writes.borrow_mut().push(bytes.to_vec());
            true
        }
        fn close(&mut self) {}
        fn error(&mut self, _error: &RenderError) {}
    }

    #[test]
    fn small_writes_are_batched() {
        let writes = Rc::new(RefCell::new(Vec::new()));
        let mut sink = ChunkSink::new(
            Box::new(CountingSink {
                writes: writes.clone(),
            }),
            64,
        );
        sink.write_chunk(b"aaa");
        sink.write_chunk(b"bbb");
        assert!(writes.borrow().is_empty());
        sink.flush();
        assert_eq!(writes.borrow().len(), 1);
        assert_eq!(writes.borrow()[0], b"aaabbb");
    }

    #[test]
    fn large_chunk_bypasses_buffer() {
        let writes = Rc::new(RefCell::new(Vec::new()));
        let mut sink = ChunkSink::new(
            Box::new(CountingSink {
                writes: writes.clone(),
            }),
            16,
        );
        sink.write_chunk(b"tiny");
        let big = vec![b'x'; 64];
        sink.write_chunk(&big);
        // Buffered prefix flushed first so ordering is preserved.
        assert_eq!(writes.borrow().len(), 2);
        assert_eq!(writes.borrow()[0], b"tiny");
        assert_eq!(writes.borrow()[1], big);
    }

    #[test]
    fn capacity_signal_is_sticky_until_next_pass() {
        let mut sink = ChunkSink::new(Box::new(BufferSink::with_capacity_budget(4)), 16);
        sink.write_chunk(b"0123456789");
        sink.flush();
        assert!(!sink.has_capacity());
        sink.begin_pass();
        assert!(sink.has_capacity());
    }

    #[test]
    fn buffer_sink_budget_accepts_but_reports_no_capacity() {
        let shared = BufferSink::with_capacity_budget(4);
        let mut sink: Box<dyn Sink> = Box::new(shared.clone());
        assert!(!sink.write(b"0123456789"));
        assert_eq!(shared.contents(), b"0123456789");
    }
}
