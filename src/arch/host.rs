//! # Host Port
//!
//! Simulated single-core CPU for running the kernel on a development
//! machine. Every started task slot is backed by an OS thread; a thread only
//! executes task code while the CPU is handed to it, so exactly one task
//! runs at a time, as on the target.
//!
//! ```text
//!  test thread ("hardware")          task threads
//!  ────────────────────────          ────────────────────────────
//!  kernel.on_tick()   ─┐             slot 1: running ──► switch_point
//!  kernel.on_byte..() ─┼─► pending ──────────────┘          │
//!  kernel.on_ready..()─┘   switch                           ▼ hand over
//!                                    slot 0: parked ◄── activate(0, gen)
//! ```
//!
//! Interrupt entry points are plain calls made by the test thread. A switch
//! they request is carried out when the running task reaches its next switch
//! point (a kernel call that schedules, or `sleep`).
//!
//! A suspended [`Context`] is the generation number of the parked thread.
//! Restarting or stopping a slot bumps its generation, and a thread whose
//! generation is stale unwinds out of its task and ends.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use crate::config::TASK_COUNT;
use crate::kernel::Kernel;
use crate::scheduler::{Fault, Switch};
use crate::stack::StackRegion;
use crate::task::{Slot, TaskFn};

/// Suspended execution of a parked task thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    generation: u32,
}

impl Context {
    pub(crate) const fn from_generation(generation: u32) -> Self {
        Self { generation }
    }

    /// Host threads have no stack pointer the kernel can check.
    pub fn stack_pointer(&self) -> Option<usize> {
        None
    }
}

/// Unwind payload that ends a task thread whose context was discarded.
struct Discarded;

thread_local! {
    /// `(slot, generation)` of the task this thread executes.
    static RUNNING_AS: Cell<Option<(Slot, u32)>> = const { Cell::new(None) };
}

struct CpuState {
    /// Thread holding the CPU.
    running: Option<(Slot, u32)>,
    generation: [u32; TASK_COUNT],
    switch_pending: bool,
    /// Interrupts taken so far; sleeping threads wait for it to change.
    interrupts: u64,
    transmit_enabled: bool,
    last_layer: Option<(u8, [u8; 8])>,
    fault: Option<Fault>,
    /// A task panicked (as opposed to being discarded).
    crashed: bool,
}

pub struct Cpu {
    state: Mutex<CpuState>,
    wakeup: Condvar,
}

impl Cpu {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(CpuState {
                running: None,
                generation: [0; TASK_COUNT],
                switch_pending: false,
                interrupts: 0,
                transmit_enabled: false,
                last_layer: None,
                fault: None,
                crashed: false,
            }),
            wakeup: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CpuState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, CpuState>) -> MutexGuard<'a, CpuState> {
        self.wakeup.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Fault that halted the CPU, if any.
    pub fn fault(&self) -> Option<Fault> {
        self.lock().fault
    }

    /// Slot whose thread currently holds the CPU.
    pub fn running(&self) -> Option<Slot> {
        self.lock().running.map(|(slot, _)| slot)
    }

    /// Whether the ready-to-send interrupt is enabled.
    pub fn transmit_enabled(&self) -> bool {
        self.lock().transmit_enabled
    }

    /// Last layer written to the cube.
    pub fn last_layer(&self) -> Option<(u8, [u8; 8])> {
        self.lock().last_layer
    }

    /// A task thread panicked.
    pub fn crashed(&self) -> bool {
        self.lock().crashed
    }

    // -----------------------------------------------------------------------
    // Contexts
    // -----------------------------------------------------------------------

    /// Spawn the thread for a (re)started slot. It stays parked until the
    /// scheduler switches to the returned context.
    pub(crate) fn prepare(
        &self,
        kernel: &'static Kernel,
        slot: Slot,
        entry: TaskFn,
        _stack: &StackRegion,
    ) -> Context {
        let generation = self.bump_generation(slot);
        thread::spawn(move || run_task(kernel, slot, generation, entry));
        Context::from_generation(generation)
    }

    /// Invalidate the parked thread of a stopped slot.
    pub(crate) fn discard(&self, slot: Slot) {
        self.bump_generation(slot);
    }

    fn bump_generation(&self, slot: Slot) -> u32 {
        let mut state = self.lock();
        state.generation[slot] = state.generation[slot].wrapping_add(1);
        let generation = state.generation[slot];
        drop(state);
        self.wakeup.notify_all();
        generation
    }

    fn activate(&self, slot: Slot, context: Context) {
        self.lock().running = Some((slot, context.generation));
        self.wakeup.notify_all();
    }

    /// Block the calling task thread until it is handed the CPU again.
    fn park(&self, slot: Slot, generation: u32) {
        let mut state = self.lock();
        loop {
            if state.running == Some((slot, generation)) {
                return;
            }
            if state.generation[slot] != generation || state.fault.is_some() {
                drop(state);
                panic::resume_unwind(Box::new(Discarded));
            }
            state = self.wait(state);
        }
    }

    // -----------------------------------------------------------------------
    // Switching
    // -----------------------------------------------------------------------

    /// First switch: hand the CPU to the selected task and return.
    pub(crate) fn start(&self, kernel: &Kernel) {
        match kernel.switch_context(None) {
            Ok(Switch::To(slot, context)) => self.activate(slot, context),
            Ok(Switch::Stay) => {}
            Err(fault) => self.reset(fault),
        }
    }

    pub(crate) fn request_switch(&self) {
        self.lock().switch_pending = true;
        self.wakeup.notify_all();
    }

    /// Carry out a pending switch if called from the running task.
    pub(crate) fn switch_point(&self, kernel: &Kernel) {
        let Some((slot, generation)) = RUNNING_AS.get() else {
            return;
        };
        {
            let mut state = self.lock();
            if !state.switch_pending {
                return;
            }
            state.switch_pending = false;
        }

        match kernel.switch_context(Some(Context::from_generation(generation))) {
            Ok(Switch::Stay) => {}
            Ok(Switch::To(next, context)) => {
                self.activate(next, context);
                self.park(slot, generation);
            }
            Err(fault) => self.reset(fault),
        }
    }

    /// Wait for the next interrupt, then honour any switch it requested.
    pub(crate) fn sleep(&self, kernel: &Kernel) {
        if RUNNING_AS.get().is_none() {
            thread::yield_now();
            return;
        }
        {
            let mut state = self.lock();
            let seen = state.interrupts;
            while state.interrupts == seen && !state.switch_pending {
                if state.fault.is_some() {
                    drop(state);
                    panic::resume_unwind(Box::new(Discarded));
                }
                state = self.wait(state);
            }
        }
        self.switch_point(kernel);
    }

    /// Called at the end of every simulated interrupt handler.
    pub(crate) fn end_of_interrupt(&self) {
        let mut state = self.lock();
        state.interrupts = state.interrupts.wrapping_add(1);
        drop(state);
        self.wakeup.notify_all();
    }

    /// Halt: record the fault and stop every task thread.
    pub(crate) fn reset(&self, fault: Fault) {
        error!("fatal: {}", fault);
        {
            let mut state = self.lock();
            state.fault = Some(fault);
            state.running = None;
        }
        self.wakeup.notify_all();
        if RUNNING_AS.get().is_some() {
            panic::resume_unwind(Box::new(Discarded));
        }
    }

    // -----------------------------------------------------------------------
    // Peripherals
    // -----------------------------------------------------------------------

    pub(crate) fn enable_transmit(&self) {
        self.lock().transmit_enabled = true;
    }

    pub(crate) fn disable_transmit(&self) {
        self.lock().transmit_enabled = false;
    }

    pub(crate) fn show_layer(&self, layer: u8, rows: [u8; 8]) {
        self.lock().last_layer = Some((layer, rows));
    }

    pub(crate) fn blank(&self) {
        self.lock().last_layer = None;
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

fn run_task(kernel: &'static Kernel, slot: Slot, generation: u32, entry: TaskFn) {
    RUNNING_AS.set(Some((slot, generation)));
    let cpu = kernel.cpu();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        cpu.park(slot, generation);
        entry(kernel);
        kernel.exit();
    }));
    if let Err(payload) = outcome {
        if !payload.is::<Discarded>() {
            {
                let mut state = cpu.lock();
                state.crashed = true;
                state.running = None;
            }
            cpu.wakeup.notify_all();
            panic::resume_unwind(payload);
        }
    }
}
