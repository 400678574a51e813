//! Task stacks and overflow guards.
//!
//! A [`Stack`] is a statically allocated, 8-byte aligned byte region. The
//! kernel only ever sees its bounds as a [`StackRegion`]: `start` is the high
//! end (initial stack pointer), `end` the low end, where [`STACK_GUARD`] is
//! written when a task is (re)started.

use core::cell::UnsafeCell;

use crate::config::{MIN_STACK_SIZE, STACK_GUARD};

#[repr(C, align(8))]
pub struct Stack<const LEN: usize> {
    contents: UnsafeCell<[u8; LEN]>,
}

// SAFETY: the memory is only touched by the task that owns the slot, and by
// the kernel while that task is stopped.
unsafe impl<const LEN: usize> Sync for Stack<LEN> {}

impl<const LEN: usize> Stack<LEN> {
    pub const fn new() -> Self {
        assert!(LEN % 8 == 0, "stack length must be a multiple of 8");
        assert!(LEN >= MIN_STACK_SIZE, "stack too small");
        Self {
            contents: UnsafeCell::new([0; LEN]),
        }
    }

    /// Lowest address of the stack, where the guard lives.
    pub fn bottom(&self) -> *mut u8 {
        self.contents.get().cast()
    }

    /// One past the highest address; the initial stack pointer.
    pub fn top(&self) -> *mut u8 {
        // SAFETY: one-past-the-end of the same allocation.
        unsafe { self.bottom().add(LEN) }
    }

    pub fn region(&'static self) -> StackRegion {
        StackRegion {
            start: self.top(),
            end: self.bottom(),
        }
    }
}

impl<const LEN: usize> Default for Stack<LEN> {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounds of the memory owned by one task slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    start: *mut u8,
    end: *mut u8,
}

// SAFETY: a region is a pair of addresses; access goes through the kernel's
// critical section.
unsafe impl Send for StackRegion {}

impl StackRegion {
    pub fn start(&self) -> *mut u8 {
        self.start
    }

    pub fn end(&self) -> *mut u8 {
        self.end
    }

    pub fn len(&self) -> usize {
        self.start as usize - self.end as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write_guard(&self) {
        for (offset, &byte) in STACK_GUARD.iter().enumerate() {
            // SAFETY: the region is at least MIN_STACK_SIZE bytes and the
            // owning task is not running while its guard is rewritten.
            unsafe { self.end.add(offset).write_volatile(byte) };
        }
    }

    pub fn guard_intact(&self) -> bool {
        STACK_GUARD.iter().enumerate().all(|(offset, &byte)| {
            // SAFETY: see `write_guard`.
            unsafe { self.end.add(offset).read_volatile() == byte }
        })
    }

    /// Whether a saved stack pointer is strictly above the guard and not
    /// above the top of the region.
    pub fn contains(&self, sp: usize) -> bool {
        sp > self.end as usize + STACK_GUARD.len() && sp <= self.start as usize
    }
}
