//! Power-of-two circular byte buffer with a rollback-able "virtual read"
//! cursor, and a process-wide pool that hands them out by initial capacity.
//!
//! This is the staging buffer used on both sides of a [`Connection`]: once
//! for inbound bytes waiting to be framed, once for outbound bytes waiting
//! to be flushed to the socket, and — via the virtual-read transaction — as
//! the zero-copy-ish window a [`Protocol`] decodes frames out of.
//!
//! [`Connection`]: crate::connection::Connection
//! [`Protocol`]: crate::protocol::Protocol

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::OnceLock;

use spin::Mutex;

const DEFAULT_CAPACITY: usize = 1024;

/// A growable circular byte buffer with logical read/write cursors and a
/// shadow "virtual read" cursor that can be committed or rolled back.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Vec<u8>,
    cap: usize,
    /// Physical offset of the first unread (committed) byte.
    read: usize,
    /// Physical offset one past the last written byte.
    write: usize,
    /// Number of committed, unread bytes.
    size: usize,
    /// Bytes consumed by `virtual_read` but not yet flushed or reverted.
    vconsumed: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> RingBuffer {
        let cap = capacity.max(1).next_power_of_two();
        RingBuffer {
            buf: vec![0u8; cap],
            cap,
            read: 0,
            write: 0,
            size: 0,
            vconsumed: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Appends `data`, growing the buffer (doubling towards the next power
    /// of two) if it does not currently fit.
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.size + data.len() > self.cap {
            self.grow(self.size + data.len());
        }

        let first = (self.cap - self.write).min(data.len());
        self.buf[self.write..self.write + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            let rest = data.len() - first;
            self.buf[..rest].copy_from_slice(&data[first..]);
        }
        self.write = (self.write + data.len()) % self.cap;
        self.size += data.len();
    }

    /// Copies up to `out.len()` committed bytes into `out`, advancing the
    /// read cursor. Any unflushed virtual read is discarded: the bytes it
    /// pointed at may no longer exist after this call.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.size);
        self.copy_out(self.read, n, out);
        self.advance_read(n);
        self.vconsumed = 0;
        n
    }

    /// Discards `n` committed bytes without copying them out.
    pub fn retrieve(&mut self, n: usize) {
        let n = n.min(self.size);
        self.advance_read(n);
        self.vconsumed = 0;
    }

    pub fn retrieve_all(&mut self) {
        self.advance_read(self.size);
        self.vconsumed = 0;
    }

    /// Clears all contents and cursors; retained storage is not released.
    pub fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
        self.size = 0;
        self.vconsumed = 0;
    }

    /// Replaces the contents of this buffer with a copy of `data`.
    ///
    /// Used to alias a just-read kernel buffer into a transaction window
    /// for a [`Protocol`](crate::protocol::Protocol) to decode from. Rust's
    /// ownership model can't cheaply let a single `RingBuffer` type borrow
    /// someone else's slice without infecting every holder of one with a
    /// lifetime, so this takes the owned-copy fallback: one extra copy of
    /// at most a single read syscall's worth of bytes.
    pub fn with_data(&mut self, data: &[u8]) {
        self.reset();
        self.write(data);
    }

    /// Returns the committed, unread contents as up to two contiguous
    /// slices (`front`, `back`); `back` is non-empty only when the
    /// committed region wraps the end of the underlying storage.
    pub fn peek_all(&self) -> (&[u8], &[u8]) {
        if self.size == 0 {
            return (&[], &[]);
        }
        let until_end = self.cap - self.read;
        if self.size <= until_end {
            (&self.buf[self.read..self.read + self.size], &[])
        } else {
            (
                &self.buf[self.read..self.cap],
                &self.buf[..self.size - until_end],
            )
        }
    }

    /// Like [`read`](Self::read), but only advances the shadow cursor.
    /// Must be followed by [`virtual_flush`](Self::virtual_flush) or
    /// [`virtual_revert`](Self::virtual_revert) before the buffer is used
    /// for anything else.
    pub fn virtual_read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.virtual_len());
        let vpos = (self.read + self.vconsumed) % self.cap;
        self.copy_out(vpos, n, out);
        self.vconsumed += n;
        n
    }

    /// Commits the pending virtual read: the bytes it consumed are gone.
    pub fn virtual_flush(&mut self) {
        self.advance_read(self.vconsumed);
        self.vconsumed = 0;
    }

    /// Rolls the shadow cursor back to the last committed position.
    pub fn virtual_revert(&mut self) {
        self.vconsumed = 0;
    }

    /// Bytes still available behind the shadow cursor.
    #[inline]
    pub fn virtual_len(&self) -> usize {
        self.size - self.vconsumed
    }

    /// True when no virtual read is pending; checked at the top of every
    /// `Protocol::un_packet` call in debug builds.
    #[inline]
    pub fn virtual_is_clean(&self) -> bool {
        self.vconsumed == 0
    }

    fn copy_out(&self, from: usize, n: usize, out: &mut [u8]) {
        let first = (self.cap - from).min(n);
        out[..first].copy_from_slice(&self.buf[from..from + first]);
        if first < n {
            let rest = n - first;
            out[first..first + rest].copy_from_slice(&self.buf[..rest]);
        }
    }

    fn advance_read(&mut self, n: usize) {
        self.read = (self.read + n) % self.cap;
        self.size -= n;
    }

    fn grow(&mut self, min_capacity: usize) {
        let new_cap = min_capacity.next_power_of_two();
        let mut new_buf = vec![0u8; new_cap];
        let (front, back) = self.peek_all();
        new_buf[..front.len()].copy_from_slice(front);
        new_buf[front.len()..front.len() + back.len()].copy_from_slice(back);
        self.buf = new_buf;
        self.cap = new_cap;
        self.read = 0;
        self.write = self.size % new_cap;
    }
}

/// Process-wide pool of [`RingBuffer`]s, bucketed by the capacity they were
/// first created with. Unbounded per bucket: connections come and go but
/// ring buffers at a given size class are cheap to keep around indefinitely.
#[derive(Default)]
pub struct Pool {
    buckets: Mutex<HashMap<usize, Vec<RingBuffer>>>,
}

impl Pool {
    pub fn get(&self, initial_capacity: usize) -> RingBuffer {
        let cap = initial_capacity.max(1).next_power_of_two();
        if let Some(rb) = self.buckets.lock().get_mut(&cap).and_then(Vec::pop) {
            return rb;
        }
        RingBuffer::new(cap)
    }

    pub fn put(&self, mut rb: RingBuffer) {
        rb.reset();
        self.buckets.lock().entry(rb.capacity()).or_default().push(rb);
    }
}

static POOL: OnceLock<Pool> = OnceLock::new();

/// The default process-wide [`Pool`] used by [`PooledRing::acquire`].
pub fn pool() -> &'static Pool {
    POOL.get_or_init(Pool::default)
}

/// A [`RingBuffer`] checked out from the global [`Pool`] that returns
/// itself on drop, so a panic unwinding through connection teardown still
/// releases the buffer back to the pool.
pub struct PooledRing {
    inner: Option<RingBuffer>,
}

impl PooledRing {
    pub fn acquire(initial_capacity: usize) -> PooledRing {
        PooledRing {
            inner: Some(pool().get(initial_capacity)),
        }
    }
}

impl Deref for PooledRing {
    type Target = RingBuffer;

    fn deref(&self) -> &RingBuffer {
        self.inner.as_ref().expect("ring buffer taken")
    }
}

impl DerefMut for PooledRing {
    fn deref_mut(&mut self) -> &mut RingBuffer {
        self.inner.as_mut().expect("ring buffer taken")
    }
}

impl Drop for PooledRing {
    fn drop(&mut self) {
        if let Some(rb) = self.inner.take() {
            pool().put(rb);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_simple() {
        let mut rb = RingBuffer::new(16);
        rb.write(b"hello");
        rb.write(b"world");
        let mut out = [0u8; 10];
        assert_eq!(rb.read(&mut out), 10);
        assert_eq!(&out, b"helloworld");
        assert!(rb.is_empty());
    }

    #[test]
    fn wraps_and_grows() {
        let mut rb = RingBuffer::new(8);
        rb.write(b"hello");
        let mut out = [0u8; 5];
        rb.read(&mut out);
        assert_eq!(&out, b"hello");
        // write_pos is now wrapped back near the start; this write should
        // wrap across the end of the underlying storage.
        rb.write(b"wrap!!!!");
        assert_eq!(rb.len(), 8);
        let (front, back) = rb.peek_all();
        let mut joined = Vec::new();
        joined.extend_from_slice(front);
        joined.extend_from_slice(back);
        assert_eq!(joined, b"wrap!!!!");

        rb.write(b"more bytes than capacity allows");
        assert!(rb.capacity() >= 8 + 32);
    }

    #[test]
    fn virtual_revert_restores_view() {
        let mut rb = RingBuffer::new(16);
        rb.write(b"0123456789");
        let before = {
            let (f, b) = rb.peek_all();
            [f, b].concat()
        };
        let mut scratch = [0u8; 4];
        rb.virtual_read(&mut scratch);
        assert_eq!(&scratch, b"0123");
        rb.virtual_revert();
        let after = {
            let (f, b) = rb.peek_all();
            [f, b].concat()
        };
        assert_eq!(before, after);
        assert_eq!(rb.virtual_len(), rb.len());
    }

    #[test]
    fn virtual_flush_commits() {
        let mut rb = RingBuffer::new(16);
        rb.write(b"0123456789");
        let mut scratch = [0u8; 4];
        rb.virtual_read(&mut scratch);
        rb.virtual_flush();
        assert_eq!(rb.len(), 6);
        let (f, b) = rb.peek_all();
        assert_eq!([f, b].concat(), b"456789");
    }

    #[test]
    fn pool_roundtrip() {
        let pool = Pool::default();
        let mut rb = pool.get(1024);
        rb.write(b"hi");
        pool.put(rb);
        let rb2 = pool.get(1024);
        assert!(rb2.is_empty());
        assert_eq!(rb2.capacity(), 1024);
    }
}
