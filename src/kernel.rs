//! # Kernel
//!
//! The kernel object and the API tasks and interrupt handlers call.
//!
//! All mutable state sits in one [`KernelState`] behind a critical-section
//! mutex. The architecture port ([`arch::Cpu`]) is kept beside it and is only
//! asked to switch once the critical section has been left.
//!
//! ## Startup Sequence
//!
//! ```text
//! main()
//!   ├─► KERNEL.init_task(slot, config) ← attach stack + FIFOs (×N)
//!   ├─► KERNEL.task_start(slot, entry) ← build initial contexts
//!   └─► KERNEL.run(..)                 ← hand the CPU to the first task
//!         ├─► SysTick      → on_tick()
//!         ├─► serial RX    → on_byte_received()
//!         └─► serial TX    → on_ready_to_send()
//! ```
//!
//! ## Blocking Calls
//!
//! `receive_bytes`, `send_bytes`, `advance_frame` and `delay` share one
//! shape: try inside the critical section; if that fails, mark the task as
//! waiting (plus `WAIT_TIMER` with a deadline unless the timeout is
//! [`INFINITE`]), schedule, and try again once woken. After the timeout has
//! elapsed one last attempt is made before giving up with
//! [`Error::Timeout`]. A zero timeout never blocks, and neither does the
//! idle task.

use core::fmt;

use crate::arch;
use crate::config::{IDLE_SLOT, MIN_STACK_SIZE, TASK_COUNT};
use crate::display::{Display, Frame, FrameInit};
use crate::protocol::{Receiver, ReceiverStats, Transmitter, ADDRESS_COUNT};
use crate::scheduler::{Fault, Scheduler, Switch};
use crate::sync::Shared;
use crate::task::{Slot, TaskConfig, TaskFn, TaskStatus};
use crate::timer::{self, Ticks, Timer, INFINITE};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Recoverable API error, returned to the calling task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Slot index outside the task table.
    InvalidSlot,
    /// FIFOs were given to a slot the wire header cannot address.
    NotAddressable,
    /// Stack region below `MIN_STACK_SIZE`.
    StackTooSmall,
    /// The slot has no stack.
    Unconfigured,
    /// The operation cannot target the calling task.
    CurrentTask,
    /// The idle slot cannot be stopped.
    IdleTask,
    /// The calling task has no FIFO for this direction.
    NoFifo,
    /// The request exceeds the FIFO capacity and could never succeed.
    TooLarge,
    /// Nothing happened before the timeout elapsed.
    Timeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Error::InvalidSlot => "invalid task slot",
            Error::NotAddressable => "slot cannot be addressed on the wire",
            Error::StackTooSmall => "stack too small",
            Error::Unconfigured => "slot has no stack",
            Error::CurrentTask => "not allowed on the calling task",
            Error::IdleTask => "not allowed on the idle task",
            Error::NoFifo => "task has no FIFO",
            Error::TooLarge => "request larger than the FIFO",
            Error::Timeout => "timed out",
        };
        f.write_str(text)
    }
}

// ---------------------------------------------------------------------------
// Kernel state
// ---------------------------------------------------------------------------

/// Everything interrupts and tasks share.
pub struct KernelState {
    pub scheduler: Scheduler,
    pub timer: Timer,
    pub receiver: Receiver,
    pub transmitter: Transmitter,
    pub display: Display,
}

impl KernelState {
    pub const fn new() -> Self {
        Self {
            scheduler: Scheduler::new(),
            timer: Timer::new(),
            receiver: Receiver::new(),
            transmitter: Transmitter::new(),
            display: Display::new(),
        }
    }

    /// Drop any frame in flight to or from `slot`.
    fn abort_frames(&mut self, slot: Slot) {
        if slot < ADDRESS_COUNT {
            self.receiver.abort(slot as u8);
            self.transmitter.abort(slot as u8);
        }
    }

    /// The calling task, unless it is the idle task (which never blocks).
    fn may_block(&self) -> bool {
        matches!(self.scheduler.current(), Some(slot) if slot != IDLE_SLOT)
    }
}

impl Default for KernelState {
    fn default() -> Self {
        Self::new()
    }
}

enum Attempt<T> {
    Done(T),
    Expired,
    Blocked,
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

pub struct Kernel {
    state: Shared<KernelState>,
    cpu: arch::Cpu,
}

impl Kernel {
    pub const fn new() -> Self {
        Self {
            state: Shared::new(KernelState::new()),
            cpu: arch::Cpu::new(),
        }
    }

    pub(crate) fn cpu(&self) -> &arch::Cpu {
        &self.cpu
    }

    /// Simulated CPU, for inspecting what the kernel did to the "hardware".
    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    pub fn port(&self) -> &arch::Cpu {
        &self.cpu
    }

    /// Run `f` on the kernel state inside a critical section.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut KernelState) -> R) -> R {
        self.state.with(f)
    }

    // -----------------------------------------------------------------------
    // Task lifecycle
    // -----------------------------------------------------------------------

    /// Attach a stack and FIFO storage to `slot`. Any task in the slot is
    /// stopped.
    pub fn init_task(&self, slot: Slot, config: TaskConfig) -> Result<(), Error> {
        if slot >= TASK_COUNT {
            return Err(Error::InvalidSlot);
        }
        if config.stack.len() < MIN_STACK_SIZE {
            return Err(Error::StackTooSmall);
        }
        if slot >= ADDRESS_COUNT && (config.recv.is_some() || config.send.is_some()) {
            return Err(Error::NotAddressable);
        }

        self.state.with(|st| {
            if st.scheduler.current() == Some(slot) {
                return Err(Error::CurrentTask);
            }
            st.abort_frames(slot);
            st.scheduler
                .configure(slot, config.stack, config.recv, config.send);
            Ok(())
        })?;
        self.cpu.discard(slot);
        debug!("slot {=usize} configured", slot);
        Ok(())
    }

    /// (Re)start `slot` at `entry` with a fresh stack, empty FIFOs and no
    /// frame in flight.
    pub fn task_start(&'static self, slot: Slot, entry: TaskFn) -> Result<(), Error> {
        if slot >= TASK_COUNT {
            return Err(Error::InvalidSlot);
        }

        let stack = self.state.with(|st| {
            if st.scheduler.current() == Some(slot) {
                return Err(Error::CurrentTask);
            }
            let stack = st.scheduler.task(slot).stack.ok_or(Error::Unconfigured)?;
            st.scheduler.reset(slot);
            st.abort_frames(slot);
            Ok(stack)
        })?;

        let context = self.cpu.prepare(self, slot, entry, &stack);

        let running = self.state.with(|st| {
            st.scheduler.launch(slot, context);
            st.scheduler.current().is_some()
        });
        debug!("slot {=usize} started", slot);

        if running {
            self.schedule();
        }
        Ok(())
    }

    /// Stop `slot`. Stopping the calling task is [`Kernel::exit`].
    pub fn task_stop(&self, slot: Slot) -> Result<(), Error> {
        if slot >= TASK_COUNT {
            return Err(Error::InvalidSlot);
        }
        if slot == IDLE_SLOT {
            return Err(Error::IdleTask);
        }

        let is_current = self.state.with(|st| {
            if st.scheduler.current() == Some(slot) {
                return true;
            }
            st.scheduler.stop(slot);
            st.abort_frames(slot);
            false
        });
        if is_current {
            self.exit();
        }
        self.cpu.discard(slot);
        debug!("slot {=usize} stopped", slot);
        Ok(())
    }

    /// Give up the CPU to any task of higher or equal standing.
    pub fn yield_now(&self) {
        self.schedule();
    }

    /// Stop the calling task. Must be called from a task.
    ///
    /// The idle slot is never stopped: an idle task that exits carries on
    /// as [`idle_task`].
    pub fn exit(&self) -> ! {
        let current = self.state.with(|st| {
            let current = st.scheduler.current();
            if let Some(slot) = current.filter(|&slot| slot != IDLE_SLOT) {
                st.scheduler.stop(slot);
                st.abort_frames(slot);
            }
            current
        });
        match current {
            Some(IDLE_SLOT) => {
                warn!("idle task returned");
                loop {
                    self.sleep();
                }
            }
            Some(slot) => {
                debug!("slot {=usize} exited", slot);
                self.cpu.discard(slot);
            }
            None => {}
        }
        loop {
            self.schedule();
        }
    }

    /// Pick the next task and switch to it if it differs from the caller.
    pub fn schedule(&self) {
        self.cpu.request_switch();
        self.cpu.switch_point(self);
    }

    /// Called by the port with the outgoing task's suspended state.
    pub(crate) fn switch_context(
        &self,
        outgoing: Option<arch::Context>,
    ) -> Result<Switch, Fault> {
        self.state.with(|st| st.scheduler.switch(outgoing))
    }

    /// Hand the CPU to the highest priority runnable task. Interrupts are
    /// delivered by calling the `on_*` entry points.
    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    pub fn run(&'static self) {
        info!("kernel running");
        self.cpu.start(self);
    }

    /// Bring up the hardware and hand the CPU to the first task.
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    pub fn run(&'static self, peripherals: cortex_m::Peripherals) -> ! {
        self.cpu.start(self, peripherals)
    }

    // -----------------------------------------------------------------------
    // Blocking calls
    // -----------------------------------------------------------------------

    fn block_until<T>(
        &self,
        reason: TaskStatus,
        timeout: Ticks,
        mut attempt: impl FnMut(&mut KernelState) -> Option<T>,
    ) -> Result<T, Error> {
        let start = self.now();
        loop {
            let outcome = self.state.with(|st| {
                if let Some(value) = attempt(st) {
                    return Attempt::Done(value);
                }
                let now = st.timer.now();
                if timeout == 0 || !st.may_block() || timer::has_elapsed(start, now, timeout) {
                    return Attempt::Expired;
                }
                st.scheduler
                    .block_current(reason, timer::deadline(start, timeout));
                Attempt::Blocked
            });
            match outcome {
                Attempt::Done(value) => return Ok(value),
                Attempt::Expired => return Err(Error::Timeout),
                Attempt::Blocked => self.schedule(),
            }
        }
    }

    /// Take exactly `dest.len()` bytes from the calling task's receive FIFO.
    pub fn receive_bytes(&self, dest: &mut [u8], timeout: Ticks) -> Result<(), Error> {
        let capacity = self.state.with(|st| {
            let task = st.scheduler.current_task_mut().ok_or(Error::NoFifo)?;
            task.recv.as_ref().map(|fifo| fifo.capacity()).ok_or(Error::NoFifo)
        })?;
        if dest.len() > capacity {
            return Err(Error::TooLarge);
        }

        self.block_until(TaskStatus::WAIT_RECV, timeout, |st| {
            let fifo = st.scheduler.current_task_mut()?.recv.as_mut()?;
            fifo.pop_bytes(dest).then_some(())
        })
    }

    /// Queue `bytes` on the calling task's send FIFO as a whole.
    pub fn send_bytes(&self, bytes: &[u8], timeout: Ticks) -> Result<(), Error> {
        let capacity = self.state.with(|st| {
            let task = st.scheduler.current_task_mut().ok_or(Error::NoFifo)?;
            task.send.as_ref().map(|fifo| fifo.capacity()).ok_or(Error::NoFifo)
        })?;
        if bytes.len() > capacity {
            return Err(Error::TooLarge);
        }

        self.block_until(TaskStatus::WAIT_SEND, timeout, |st| {
            let fifo = st.scheduler.current_task_mut()?.send.as_mut()?;
            if !fifo.push_bytes(bytes) {
                return None;
            }
            self.cpu.enable_transmit();
            Some(())
        })
    }

    /// Bytes waiting in the calling task's receive FIFO.
    pub fn received(&self) -> usize {
        self.state.with(|st| {
            st.scheduler
                .current_task_mut()
                .and_then(|task| task.recv.as_ref())
                .map_or(0, |fifo| fifo.len())
        })
    }

    /// Publish the frame drawn so far and start drawing the next one,
    /// prepared according to `init`.
    ///
    /// `draw` works on a copy outside the critical section, so it may call
    /// back into the kernel. The ring slot belongs to the caller until its
    /// next advance.
    pub fn advance_frame(
        &self,
        timeout: Ticks,
        init: FrameInit,
        draw: impl FnOnce(&mut Frame),
    ) -> Result<(), Error> {
        let (index, mut frame) = self.block_until(TaskStatus::WAIT_DISPLAY, timeout, |st| {
            let index = st.display.advance(init)?;
            Some((index, *st.display.frame(index)))
        })?;
        draw(&mut frame);
        self.state.with(|st| *st.display.frame_mut(index) = frame);
        Ok(())
    }

    /// Block the calling task for `amount` ticks. The idle task spins
    /// instead; an [`INFINITE`] delay lasts until another party wakes the
    /// task.
    pub fn delay(&self, amount: Ticks) {
        if amount == 0 {
            return;
        }
        if !self.state.with(|st| st.may_block()) {
            self.wait(amount);
            return;
        }
        if amount == INFINITE {
            self.state
                .with(|st| st.scheduler.block_current(TaskStatus::WAIT_TIMER, None));
            self.schedule();
            return;
        }
        // Nothing satisfies the attempt, so only the deadline ends the wait.
        match self.block_until(TaskStatus::empty(), amount, |_| None::<()>) {
            Err(Error::Timeout) => {}
            other => debug_assert!(false, "delay ended with {:?}", other),
        }
    }

    // -----------------------------------------------------------------------
    // Time
    // -----------------------------------------------------------------------

    pub fn now(&self) -> Ticks {
        self.state.with(|st| st.timer.now())
    }

    pub fn elapsed(&self, since: Ticks) -> Ticks {
        timer::elapsed(since, self.now())
    }

    pub fn has_elapsed(&self, since: Ticks, amount: Ticks) -> bool {
        timer::has_elapsed(since, self.now(), amount)
    }

    /// Sleep through interrupts until `amount` ticks have passed, without
    /// giving up the CPU to lower priority tasks.
    pub fn wait(&self, amount: Ticks) {
        let start = self.now();
        while !self.has_elapsed(start, amount) {
            self.cpu.sleep(self);
        }
    }

    /// Sleep until the next interrupt.
    pub fn sleep(&self) {
        self.cpu.sleep(self);
    }

    // -----------------------------------------------------------------------
    // Display
    // -----------------------------------------------------------------------

    pub fn enable_display(&self) {
        self.state.with(|st| st.display.enable());
    }

    pub fn disable_display(&self) {
        self.state.with(|st| {
            st.display.disable();
            self.cpu.blank();
        });
    }

    pub fn free_frames(&self) -> usize {
        self.state.with(|st| st.display.free_frames())
    }

    // -----------------------------------------------------------------------
    // Interrupt entry points
    // -----------------------------------------------------------------------

    /// Timer interrupt: advance time, expire deadlines, refresh the cube.
    pub fn on_tick(&self) {
        self.state.with(|st| {
            let now = st.timer.tick();
            let mut woke = st.scheduler.expire_deadlines(now);

            let refresh = st.display.refresh();
            if refresh.advanced {
                woke |= st.scheduler.wake_all(TaskStatus::WAIT_DISPLAY);
            }
            if let Some((layer, rows)) = refresh.layer {
                self.cpu.show_layer(layer, rows);
            }

            if woke {
                self.cpu.request_switch();
            }
        });
        self.cpu.end_of_interrupt();
    }

    /// Serial receive interrupt. `error` flags a framing, parity or
    /// overrun condition on this byte.
    pub fn on_byte_received(&self, byte: u8, error: bool) {
        self.state.with(|st| {
            if st.receiver.on_byte(byte, error, &mut st.scheduler) {
                self.cpu.request_switch();
            }
        });
        self.cpu.end_of_interrupt();
    }

    /// Serial transmit interrupt: the next byte to send, or `None` once
    /// every send FIFO is empty (the interrupt is then disabled).
    pub fn on_ready_to_send(&self) -> Option<u8> {
        let byte = self.state.with(|st| {
            let step = st.transmitter.next_byte(&mut st.scheduler);
            if step.woke {
                self.cpu.request_switch();
            }
            if step.byte.is_none() {
                self.cpu.disable_transmit();
            }
            step.byte
        });
        self.cpu.end_of_interrupt();
        byte
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn current_task(&self) -> Option<Slot> {
        self.state.with(|st| st.scheduler.current())
    }

    pub fn task_status(&self, slot: Slot) -> Option<TaskStatus> {
        if slot >= TASK_COUNT {
            return None;
        }
        Some(self.state.with(|st| st.scheduler.task(slot).status))
    }

    pub fn switch_count(&self) -> u32 {
        self.state.with(|st| st.scheduler.switches())
    }

    pub fn receiver_stats(&self) -> ReceiverStats {
        self.state.with(|st| st.receiver.stats())
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry point for the idle slot: sleep until there is something to do.
pub fn idle_task(kernel: &'static Kernel) {
    loop {
        kernel.sleep();
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
