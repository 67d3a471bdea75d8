//! Connection Buffers
//!
//! - [`OutputBuffer`]: response bytes queued for the next flush, kept as a list
//!   of segments so large values go out zero-copy in one vectored write.
//! - [`Savepoint`]: a position in the output buffer; rolling back to it drops
//!   everything written after it.
//! - [`BufferPool`]: recycled input buffers, owned by the service.
//!
//! ## Output Layout
//!
//! ```text
//!   segments: [ Bytes ][ Bytes (value, zero-copy) ][ Bytes ] + current: BytesMut
//!             └──────────── sealed ───────────────┘           └─ still growing ─┘
//! ```

use bytes::{Bytes, BytesMut};
use std::sync::{Mutex, PoisonError};

/// Values at least this large are queued as their own segment instead of
/// being copied.
const ZERO_COPY_THRESHOLD: usize = 1024;

/// Pooled buffers larger than this are dropped instead of recycled (1 MB).
const MAX_POOLED_CAPACITY: usize = 1024 * 1024;

/// A position in an [`OutputBuffer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Savepoint {
    len: usize,
}

/// Response bytes waiting to be flushed.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    segments: Vec<Bytes>,
    current: BytesMut,
    len: usize,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total queued bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies bytes into the buffer.
    pub fn put_slice(&mut self, data: &[u8]) {
        self.current.extend_from_slice(data);
        self.len += data.len();
    }

    /// Queues bytes, without copying when they are large.
    pub fn put_bytes(&mut self, data: Bytes) {
        if data.len() < ZERO_COPY_THRESHOLD {
            self.put_slice(&data);
            return;
        }
        self.seal();
        self.len += data.len();
        self.segments.push(data);
    }

    fn seal(&mut self) {
        if !self.current.is_empty() {
            self.segments.push(self.current.split().freeze());
        }
    }

    /// Marks the current end of the buffer.
    pub fn checkpoint(&self) -> Savepoint {
        Savepoint { len: self.len }
    }

    /// Drops everything written after `savepoint`.
    ///
    /// A savepoint beyond the current end (one taken before a reset) is a no-op.
    pub fn rollback(&mut self, savepoint: Savepoint) {
        if savepoint.len >= self.len {
            return;
        }

        let sealed = self.len - self.current.len();
        if savepoint.len >= sealed {
            self.current.truncate(savepoint.len - sealed);
        } else {
            self.current.clear();
            let mut end = sealed;
            while let Some(mut last) = self.segments.pop() {
                let start = end - last.len();
                if start < savepoint.len {
                    last.truncate(savepoint.len - start);
                    self.segments.push(last);
                    break;
                }
                end = start;
                if start == savepoint.len {
                    break;
                }
            }
        }
        self.len = savepoint.len;
    }

    /// Takes all queued bytes as a list of segments, leaving the buffer empty.
    pub fn take_chunks(&mut self) -> Vec<Bytes> {
        self.seal();
        self.len = 0;
        std::mem::take(&mut self.segments)
    }

    /// Discards everything queued.
    pub fn reset(&mut self) {
        self.segments.clear();
        self.current.clear();
        self.len = 0;
    }
}

/// A pool of reusable input buffers.
///
/// Built once per service and shared by its connections, so buffer memory is
/// recycled without any process-wide state.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    max_pooled: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(64)
    }
}

impl BufferPool {
    /// Creates a pool keeping at most `max_pooled` idle buffers.
    pub fn new(max_pooled: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_pooled,
        }
    }

    /// Takes a buffer with room for at least `capacity` bytes.
    pub fn acquire(&self, capacity: usize) -> BytesMut {
        let recycled = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match recycled {
            Some(mut buf) => {
                buf.reserve(capacity);
                buf
            }
            None => BytesMut::with_capacity(capacity),
        }
    }

    /// Returns a buffer to the pool.
    pub fn release(&self, mut buf: BytesMut) {
        if buf.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        buf.clear();
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }

    /// Number of idle buffers in the pool.
    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flatten(out: &mut OutputBuffer) -> Vec<u8> {
        out.take_chunks().iter().flat_map(|c| c.to_vec()).collect()
    }

    #[test]
    fn test_put_and_take() {
        let mut out = OutputBuffer::new();
        out.put_slice(b"STORED\r\n");
        out.put_slice(b"END\r\n");
        assert_eq!(out.len(), 13);
        assert_eq!(flatten(&mut out), b"STORED\r\nEND\r\n");
        assert!(out.is_empty());
    }

    #[test]
    fn test_large_value_is_own_segment() {
        let mut out = OutputBuffer::new();
        let value = Bytes::from(vec![b'x'; 4096]);
        out.put_slice(b"VALUE k 0 4096\r\n");
        out.put_bytes(value.clone());
        out.put_slice(b"\r\nEND\r\n");

        let chunks = out.take_chunks();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1], value);
    }

    #[test]
    fn test_rollback_within_current() {
        let mut out = OutputBuffer::new();
        out.put_slice(b"first\r\n");
        let sp = out.checkpoint();
        out.put_slice(b"partial");
        out.rollback(sp);
        out.put_slice(b"ERROR\r\n");
        assert_eq!(flatten(&mut out), b"first\r\nERROR\r\n");
    }

    #[test]
    fn test_rollback_across_segments() {
        let mut out = OutputBuffer::new();
        out.put_slice(b"head\r\n");
        let sp = out.checkpoint();
        out.put_slice(b"VALUE k 0 2048\r\n");
        out.put_bytes(Bytes::from(vec![b'y'; 2048]));
        out.put_slice(b"\r\n");
        out.rollback(sp);

        assert_eq!(out.len(), 6);
        assert_eq!(flatten(&mut out), b"head\r\n");
    }

    #[test]
    fn test_rollback_to_segment_boundary() {
        let mut out = OutputBuffer::new();
        out.put_bytes(Bytes::from(vec![b'a'; 2000]));
        let sp = out.checkpoint();
        out.put_bytes(Bytes::from(vec![b'b'; 2000]));
        out.rollback(sp);

        let data = flatten(&mut out);
        assert_eq!(data.len(), 2000);
        assert!(data.iter().all(|b| *b == b'a'));
    }

    #[test]
    fn test_stale_savepoint_is_noop() {
        let mut out = OutputBuffer::new();
        out.put_slice(b"0123456789");
        let sp = out.checkpoint();
        out.reset();
        out.put_slice(b"ab");
        out.rollback(sp);
        assert_eq!(flatten(&mut out), b"ab");
    }

    #[test]
    fn test_pool_recycles() {
        let pool = BufferPool::new(2);
        let mut buf = pool.acquire(128);
        buf.extend_from_slice(b"leftover");
        pool.release(buf);
        assert_eq!(pool.idle(), 1);

        let buf = pool.acquire(64);
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 64);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = BufferPool::new(1);
        pool.release(BytesMut::with_capacity(16));
        pool.release(BytesMut::with_capacity(16));
        assert_eq!(pool.idle(), 1);

        pool.release(BytesMut::with_capacity(MAX_POOLED_CAPACITY + 1));
        assert_eq!(pool.idle(), 1);
    }
}
