//! # Scheduler
//!
//! Fixed task table plus the picking policy, the context hand-over and the
//! wait/wake bookkeeping. Everything here runs inside the kernel's critical
//! section; the architecture port performs the actual register save/restore
//! around [`Scheduler::switch`].
//!
//! ## Picking Policy
//!
//! Slots are examined in priority order and the first one that is
//! `SCHEDULED` with no wait bits wins:
//!
//! ```text
//!   slot 1 ─► slot 2 ─► … ─► slot N-1 ─► slot 0 (idle)
//! ```
//!
//! Among ordinary slots the lower index always wins. The idle slot is
//! examined last so that it only runs when every other task is stopped or
//! waiting.
//!
//! ## Fatal Conditions
//!
//! No runnable slot, a corrupted stack guard on the outgoing or incoming
//! slot, or an outgoing stack pointer outside its region are unrecoverable.
//! [`Scheduler::switch`] reports them as a [`Fault`] and the port resets.

use core::fmt;
use core::iter;

use crate::arch::Context;
use crate::config::{IDLE_SLOT, TASK_COUNT};
use crate::fifo::Fifo;
use crate::protocol::{Mailboxes, ADDRESS_COUNT};
use crate::stack::StackRegion;
use crate::task::{Slot, TaskDescriptor, TaskStatus};
use crate::timer::Ticks;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Unrecoverable scheduler error. The port resets the CPU when it sees one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Every slot is stopped or waiting.
    NoRunnableTask,
    /// The stack guard of this slot was overwritten, or its stack pointer
    /// left the region.
    StackOverflow(Slot),
    /// A scheduled slot had no saved context to resume.
    LostContext(Slot),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::NoRunnableTask => write!(f, "no runnable task"),
            Fault::StackOverflow(slot) => write!(f, "stack overflow in slot {slot}"),
            Fault::LostContext(slot) => write!(f, "slot {slot} has no context"),
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Fault {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Fault::NoRunnableTask => defmt::write!(f, "NoRunnableTask"),
            Fault::StackOverflow(slot) => defmt::write!(f, "StackOverflow({=usize})", slot),
            Fault::LostContext(slot) => defmt::write!(f, "LostContext({=usize})", slot),
        }
    }
}

/// Result of a scheduling decision.
#[derive(Debug, PartialEq, Eq)]
pub enum Switch {
    /// Keep running the current task.
    Stay,
    /// Resume `slot` from `context`.
    To(Slot, Context),
}

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

pub struct Scheduler {
    /// Fixed task table. Index 0 is the idle task.
    tasks: [TaskDescriptor; TASK_COUNT],

    /// Slot currently executing. `None` before the kernel starts.
    current: Option<Slot>,

    /// Context switches performed.
    switches: u32,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            tasks: [TaskDescriptor::EMPTY; TASK_COUNT],
            current: None,
            switches: 0,
        }
    }

    pub fn current(&self) -> Option<Slot> {
        self.current
    }

    pub fn switches(&self) -> u32 {
        self.switches
    }

    pub fn task(&self, slot: Slot) -> &TaskDescriptor {
        &self.tasks[slot]
    }

    pub fn task_mut(&mut self, slot: Slot) -> &mut TaskDescriptor {
        &mut self.tasks[slot]
    }

    /// Descriptor of the running task.
    pub fn current_task_mut(&mut self) -> Option<&mut TaskDescriptor> {
        self.current.map(move |slot| &mut self.tasks[slot])
    }

    /// Pick the slot that should run next, if any.
    pub fn select(&self) -> Option<Slot> {
        (0..TASK_COUNT)
            .filter(|&slot| slot != IDLE_SLOT)
            .chain(iter::once(IDLE_SLOT))
            .find(|&slot| self.tasks[slot].is_runnable())
    }

    /// Pick the next task and hand over to it.
    ///
    /// `outgoing` is the suspended state of the current task; it is stored
    /// only if that task is still scheduled (a stopped task is never resumed).
    /// `None` means there is no outgoing task state to keep (boot).
    pub fn switch(&mut self, outgoing: Option<Context>) -> Result<Switch, Fault> {
        if let Some(current) = self.current {
            let task = &self.tasks[current];
            if task.is_scheduled() {
                let sp_ok = match (task.stack, outgoing.and_then(|c| c.stack_pointer())) {
                    (Some(stack), Some(sp)) => stack.contains(sp),
                    _ => true,
                };
                if !sp_ok || !task.guard_intact() {
                    return Err(Fault::StackOverflow(current));
                }
            }
        }

        let next = self.select().ok_or(Fault::NoRunnableTask)?;
        if !self.tasks[next].guard_intact() {
            return Err(Fault::StackOverflow(next));
        }

        if Some(next) == self.current {
            return Ok(Switch::Stay);
        }

        if let Some(current) = self.current {
            let task = &mut self.tasks[current];
            if task.is_scheduled() {
                task.context = outgoing;
            }
        }

        let context = self.tasks[next]
            .context
            .take()
            .ok_or(Fault::LostContext(next))?;
        self.current = Some(next);
        self.switches = self.switches.wrapping_add(1);
        Ok(Switch::To(next, context))
    }

    // -----------------------------------------------------------------------
    // Slot lifecycle
    // -----------------------------------------------------------------------

    /// Attach stack and FIFOs to a slot. The slot is left stopped.
    pub fn configure(
        &mut self,
        slot: Slot,
        stack: StackRegion,
        recv: Option<&'static mut [u8]>,
        send: Option<&'static mut [u8]>,
    ) {
        let task = &mut self.tasks[slot];
        *task = TaskDescriptor::EMPTY;
        task.stack = Some(stack);
        task.recv = recv.map(Fifo::new);
        task.send = send.map(Fifo::new);
    }

    /// Stop the slot and reset its memory for a fresh start: guard
    /// rewritten, FIFOs emptied.
    pub fn reset(&mut self, slot: Slot) {
        self.stop(slot);
        let task = &mut self.tasks[slot];
        if let Some(stack) = task.stack {
            stack.write_guard();
        }
        task.clear_fifos();
    }

    /// Make a reset slot eligible, resuming at `context`.
    pub fn launch(&mut self, slot: Slot, context: Context) {
        let task = &mut self.tasks[slot];
        task.context = Some(context);
        task.deadline = None;
        task.status = TaskStatus::SCHEDULED;
    }

    pub fn stop(&mut self, slot: Slot) {
        let task = &mut self.tasks[slot];
        task.status = TaskStatus::empty();
        task.context = None;
        task.deadline = None;
    }

    // -----------------------------------------------------------------------
    // Wait / wake
    // -----------------------------------------------------------------------

    /// Mark the current task as waiting for `reasons`, plus `WAIT_TIMER`
    /// with the given deadline. The caller schedules afterwards.
    pub fn block_current(&mut self, reasons: TaskStatus, deadline: Option<Ticks>) {
        if let Some(task) = self.current_task_mut() {
            task.status |= reasons & TaskStatus::WAITING;
            if deadline.is_some() {
                task.status |= TaskStatus::WAIT_TIMER;
            }
            task.deadline = deadline;
        }
    }

    /// Wake `slot` if it waits on any of `reasons`.
    pub fn wake(&mut self, slot: Slot, reasons: TaskStatus) -> bool {
        self.tasks[slot].wake(reasons)
    }

    /// Wake every task waiting on any of `reasons`.
    pub fn wake_all(&mut self, reasons: TaskStatus) -> bool {
        self.tasks
            .iter_mut()
            .fold(false, |woken, task| task.wake(reasons) | woken)
    }

    /// Wake every task whose deadline is `now`.
    pub fn expire_deadlines(&mut self, now: Ticks) -> bool {
        let mut woken = false;
        for task in self.tasks.iter_mut() {
            if task.status.contains(TaskStatus::WAIT_TIMER) && task.deadline == Some(now) {
                woken |= task.wake(TaskStatus::WAIT_TIMER);
            }
        }
        woken
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Protocol endpoints
// ---------------------------------------------------------------------------

impl Mailboxes<'static> for Scheduler {
    fn inbox(&mut self, address: u8) -> Option<&mut Fifo<'static>> {
        let slot = usize::from(address);
        if slot >= ADDRESS_COUNT {
            return None;
        }
        self.tasks[slot].recv.as_mut()
    }

    fn outbox(&mut self, address: u8) -> Option<&mut Fifo<'static>> {
        let slot = usize::from(address);
        if slot >= ADDRESS_COUNT {
            return None;
        }
        self.tasks[slot].send.as_mut()
    }

    fn wake(&mut self, address: u8, reason: TaskStatus) -> bool {
        Scheduler::wake(self, usize::from(address), reason)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
