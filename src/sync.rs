//! # Synchronization Primitives
//!
//! Interrupt-safe critical section abstractions. All shared kernel state
//! (task table, FIFO cursors, tick counter, protocol state machines) is
//! accessed within a critical section so that an interrupt handler never
//! observes a half-updated structure mutated by task code, or vice versa.
//!
//! On the target the `critical-section` implementation comes from
//! `cortex-m` (`critical-section-single-core`: PRIMASK masking). On the host
//! it is the `std` implementation, a process-wide reentrant lock.

use core::cell::RefCell;

pub use critical_section::CriticalSection;

/// Execute a closure within a critical section (interrupts disabled).
///
/// # Usage
/// ```ignore
/// sync::critical_section(|cs| {
///     // Access shared state safely
/// });
/// ```
///
/// Keep critical sections short: nothing inside may block.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}

/// Interrupt-safe cell: a `RefCell` that can only be borrowed inside a
/// critical section.
pub struct Shared<T> {
    inner: critical_section::Mutex<RefCell<T>>,
}

impl<T> Shared<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: critical_section::Mutex::new(RefCell::new(value)),
        }
    }

    /// Run `f` with exclusive access to the value.
    ///
    /// Must not be nested for the same cell; the inner borrow would fail.
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        critical_section(|cs| f(&mut self.inner.borrow_ref_mut(cs)))
    }
}
