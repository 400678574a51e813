//! # Transactional FIFO
//!
//! Fixed-capacity circular byte buffer with a two-phase push and pop
//! protocol. A transfer is first reserved (`begin_*`), then moved one byte at
//! a time, and only becomes visible to the other side on `commit_*`.
//!
//! ```text
//!            start                     start+size
//!              │◄──── committed ────►│◄─ push window ─►│
//!   buffer: [..|a b c d e f g h i j k|x y z . . . . . .|..]
//!              ▲                        ▲
//!          pop cursor              push cursor
//! ```
//!
//! This lets the receive interrupt append a frame body as bytes arrive and
//! drop it (by never committing) when the checksum fails, and lets the
//! transmit interrupt drain a message byte by byte while the owning task
//! still sees the space as occupied.
//!
//! The push side and the pop side keep separate cursors, so one producer and
//! one consumer may each hold an open transaction at the same time. Two
//! producers (or two consumers) are not supported; the caller enforces that.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

/// Position and progress of one open transaction.
#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    /// Absolute index of the next byte to move.
    current: usize,
    /// Bytes moved so far.
    count: usize,
    /// Bytes reserved by `begin_*`.
    reserved: usize,
}

pub struct Fifo<'a> {
    buffer: &'a mut [u8],
    start: usize,
    size: usize,
    push: Cursor,
    pop: Cursor,
}

impl<'a> Fifo<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            start: 0,
            size: 0,
            push: Cursor::default(),
            pop: Cursor::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Committed bytes waiting to be popped.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Free space for a new push transaction.
    pub fn available(&self) -> usize {
        self.capacity() - self.size
    }

    /// Drop all content and any open transaction.
    pub fn clear(&mut self) {
        self.start = 0;
        self.size = 0;
        self.push = Cursor::default();
        self.pop = Cursor::default();
    }

    #[inline]
    fn wrap(&self, index: usize) -> usize {
        if index >= self.capacity() {
            index - self.capacity()
        } else {
            index
        }
    }

    // -----------------------------------------------------------------------
    // Push side
    // -----------------------------------------------------------------------

    /// Reserve room for `n` bytes. Returns `false` without side effects when
    /// fewer than `n` bytes are free. Any uncommitted push is abandoned.
    pub fn begin_push(&mut self, n: usize) -> bool {
        if n > self.available() {
            return false;
        }
        self.push = Cursor {
            current: self.wrap(self.start + self.size),
            count: 0,
            reserved: n,
        };
        true
    }

    /// Append one byte to the reserved window.
    pub fn push(&mut self, byte: u8) {
        debug_assert!(self.push.count < self.push.reserved, "push past reservation");
        self.buffer[self.push.current] = byte;
        self.push.current = self.wrap(self.push.current + 1);
        self.push.count += 1;
    }

    /// Make the pushed bytes visible to the pop side.
    pub fn commit_push(&mut self) {
        self.size += self.push.count;
        self.push = Cursor::default();
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> bool {
        if !self.begin_push(bytes.len()) {
            return false;
        }
        for &byte in bytes {
            self.push(byte);
        }
        self.commit_push();
        true
    }

    // -----------------------------------------------------------------------
    // Pop side
    // -----------------------------------------------------------------------

    /// Reserve `n` committed bytes for reading. Returns `false` without side
    /// effects when fewer than `n` bytes are committed.
    pub fn begin_pop(&mut self, n: usize) -> bool {
        if n > self.size {
            return false;
        }
        self.pop = Cursor {
            current: self.start,
            count: 0,
            reserved: n,
        };
        true
    }

    /// The next byte `pop` would return.
    pub fn peek(&self) -> u8 {
        self.buffer[self.pop.current]
    }

    pub fn pop(&mut self) -> u8 {
        debug_assert!(self.pop.count < self.pop.reserved, "pop past reservation");
        let byte = self.buffer[self.pop.current];
        self.pop.current = self.wrap(self.pop.current + 1);
        self.pop.count += 1;
        byte
    }

    /// Release the popped bytes back to the push side.
    pub fn commit_pop(&mut self) {
        self.start = self.wrap(self.start + self.pop.count);
        self.size -= self.pop.count;
        // The push window, if any, is anchored past the committed data and
        // does not move.
        self.pop = Cursor::default();
    }

    pub fn pop_bytes(&mut self, out: &mut [u8]) -> bool {
        if !self.begin_pop(out.len()) {
            return false;
        }
        for slot in out.iter_mut() {
            *slot = self.pop();
        }
        self.commit_pop();
        true
    }
}

// ---------------------------------------------------------------------------
// Static storage
// ---------------------------------------------------------------------------

/// Statically allocated FIFO storage that can be claimed exactly once.
///
/// ```ignore
/// static RECV: FifoBuffer<512> = FifoBuffer::new();
/// let buffer: &'static mut [u8] = RECV.take().unwrap();
/// ```
pub struct FifoBuffer<const N: usize> {
    taken: AtomicBool,
    data: UnsafeCell<[u8; N]>,
}

// SAFETY: the storage is handed out at most once (guarded by `taken`).
unsafe impl<const N: usize> Sync for FifoBuffer<N> {}

impl<const N: usize> FifoBuffer<N> {
    pub const fn new() -> Self {
        Self {
            taken: AtomicBool::new(false),
            data: UnsafeCell::new([0; N]),
        }
    }

    /// Claim the storage. Returns `None` on every call after the first.
    pub fn take(&'static self) -> Option<&'static mut [u8]> {
        if self.taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        // SAFETY: first and only claim.
        Some(unsafe { &mut *self.data.get() })
    }
}

impl<const N: usize> Default for FifoBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
