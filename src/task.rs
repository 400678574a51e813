//! # Task Model
//!
//! Defines the per-slot task descriptor, its status bit set and the static
//! configuration a slot is given at boot.
//!
//! ## Status
//!
//! ```text
//!   bit 7        bits 3..0
//!  SCHEDULED   TIMER SEND RECV DISPLAY
//! ```
//!
//! A slot with `SCHEDULED` clear is stopped and never considered. A
//! scheduled slot with any wait bit set is skipped until the producer of
//! that resource (or the tick handler, for `WAIT_TIMER`) clears it. The wait
//! reasons are independent: a task may wait for receive data *and* a
//! deadline at the same time.

use bitflags::bitflags;

use crate::arch::Context;
use crate::fifo::Fifo;
use crate::kernel::Kernel;
use crate::stack::StackRegion;
use crate::timer::Ticks;

/// Index into the task table. Doubles as scheduling priority.
pub type Slot = usize;

/// Task entry point. Returning from it exits the task.
pub type TaskFn = fn(&'static Kernel);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TaskStatus: u8 {
        /// Waiting for a free display frame.
        const WAIT_DISPLAY = 0x01;
        /// Waiting for a frame in the receive FIFO.
        const WAIT_RECV = 0x02;
        /// Waiting for room in the send FIFO.
        const WAIT_SEND = 0x04;
        /// Waiting for `deadline`, or indefinitely when there is none.
        const WAIT_TIMER = 0x08;
        /// Union of all wait reasons.
        const WAITING = Self::WAIT_DISPLAY.bits()
            | Self::WAIT_RECV.bits()
            | Self::WAIT_SEND.bits()
            | Self::WAIT_TIMER.bits();
        /// Eligible to run.
        const SCHEDULED = 0x80;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for TaskStatus {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "{=u8:#04x}", self.bits())
    }
}

// ---------------------------------------------------------------------------
// Task configuration
// ---------------------------------------------------------------------------

/// Memory handed to a slot at boot: its stack and optional FIFO storage.
///
/// ```ignore
/// static STACK: Stack<1024> = Stack::new();
/// static RECV: FifoBuffer<32> = FifoBuffer::new();
///
/// let config = TaskConfig::new(STACK.region()).with_recv(RECV.take().unwrap());
/// ```
pub struct TaskConfig {
    pub stack: StackRegion,
    pub recv: Option<&'static mut [u8]>,
    pub send: Option<&'static mut [u8]>,
}

impl TaskConfig {
    pub fn new(stack: StackRegion) -> Self {
        Self {
            stack,
            recv: None,
            send: None,
        }
    }

    pub fn with_recv(mut self, buffer: &'static mut [u8]) -> Self {
        self.recv = Some(buffer);
        self
    }

    pub fn with_send(mut self, buffer: &'static mut [u8]) -> Self {
        self.send = Some(buffer);
        self
    }
}

// ---------------------------------------------------------------------------
// Task descriptor
// ---------------------------------------------------------------------------

/// One entry of the fixed task table.
pub struct TaskDescriptor {
    /// Scheduling status and wait reasons.
    pub status: TaskStatus,

    /// Suspended execution state. `None` while the task runs or is stopped.
    pub context: Option<Context>,

    /// Memory owned by this slot; `None` until configured.
    pub stack: Option<StackRegion>,

    /// Frames addressed to this slot, filled by the receiver.
    pub recv: Option<Fifo<'static>>,

    /// Bytes queued for the transmitter.
    pub send: Option<Fifo<'static>>,

    /// Absolute tick at which a `WAIT_TIMER` wait ends.
    pub deadline: Option<Ticks>,
}

impl TaskDescriptor {
    pub const EMPTY: Self = Self {
        status: TaskStatus::empty(),
        context: None,
        stack: None,
        recv: None,
        send: None,
        deadline: None,
    };

    pub fn is_scheduled(&self) -> bool {
        self.status.contains(TaskStatus::SCHEDULED)
    }

    pub fn is_waiting(&self) -> bool {
        self.status.intersects(TaskStatus::WAITING)
    }

    /// Scheduled and not waiting for anything.
    pub fn is_runnable(&self) -> bool {
        self.is_scheduled() && !self.is_waiting()
    }

    /// A slot without a stack cannot have overflowed.
    pub fn guard_intact(&self) -> bool {
        self.stack.map_or(true, |stack| stack.guard_intact())
    }

    /// Clear the wait bits (and deadline) if the task waits on any of
    /// `reasons`. Returns whether the task was woken.
    pub fn wake(&mut self, reasons: TaskStatus) -> bool {
        if !self.status.intersects(reasons) {
            return false;
        }
        self.status.remove(TaskStatus::WAITING);
        self.deadline = None;
        true
    }

    pub fn clear_fifos(&mut self) {
        if let Some(fifo) = self.recv.as_mut() {
            fifo.clear();
        }
        if let Some(fifo) = self.send.as_mut() {
            fifo.clear();
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_descriptor_is_stopped() {
        let task = TaskDescriptor::EMPTY;
        assert!(!task.is_scheduled());
        assert!(!task.is_runnable());
        assert!(task.guard_intact());
        assert!(task.context.is_none());
    }

    #[test]
    fn test_wait_bits_block_scheduling() {
        let mut task = TaskDescriptor::EMPTY;
        task.status = TaskStatus::SCHEDULED;
        assert!(task.is_runnable());

        task.status |= TaskStatus::WAIT_RECV | TaskStatus::WAIT_TIMER;
        task.deadline = Some(100);
        assert!(task.is_scheduled());
        assert!(!task.is_runnable());
    }

    #[test]
    fn test_wake_clears_all_reasons() {
        let mut task = TaskDescriptor::EMPTY;
        task.status = TaskStatus::SCHEDULED | TaskStatus::WAIT_SEND | TaskStatus::WAIT_TIMER;
        task.deadline = Some(5);

        assert!(!task.wake(TaskStatus::WAIT_RECV));
        assert!(!task.is_runnable());

        assert!(task.wake(TaskStatus::WAIT_SEND));
        assert_eq!(task.status, TaskStatus::SCHEDULED);
        assert_eq!(task.deadline, None);
    }

    #[test]
    fn test_status_bit_values() {
        assert_eq!(TaskStatus::WAITING.bits(), 0x0F);
        assert_eq!(TaskStatus::SCHEDULED.bits(), 0x80);
    }
}
