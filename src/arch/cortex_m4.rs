//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (STM32F4): context switching
//! via PendSV, the SysTick tick, the USART2 serial link and the cube's GPIO
//! lines.
//!
//! ## Context Switch Mechanism
//!
//! - **MSP** (Main Stack Pointer): kernel boot code and interrupt handlers
//! - **PSP** (Process Stack Pointer): tasks in Thread mode
//!
//! On exception entry the hardware stacks R0–R3, R12, LR, PC and xPSR (and
//! S0–S15/FPSCR when the task used the FPU) onto the process stack. PendSV
//! pushes the rest (S16–S31 if needed, R4–R11 and the EXC_RETURN value),
//! hands the resulting stack pointer to the scheduler and unstacks whatever
//! stack pointer comes back. A task's [`Context`] is that stack pointer.
//!
//! ## Interrupt Priorities
//!
//! - USART2: 0x40
//! - SysTick: 0x80
//! - PendSV: 0xFF (lowest), so a switch only happens once every other
//!   handler has finished

use core::arch::naked_asm;
use core::sync::atomic::{AtomicPtr, Ordering};

use cortex_m::interrupt::InterruptNumber;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{NVIC, SCB};

use crate::config::{BAUD_RATE, SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::kernel::Kernel;
use crate::scheduler::{Fault, Switch};
use crate::stack::{Stack, StackRegion};
use crate::task::{Slot, TaskFn};

// ---------------------------------------------------------------------------
// Contexts
// ---------------------------------------------------------------------------

/// Saved process stack pointer of a suspended task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context(*mut u32);

// SAFETY: only dereferenced by PendSV while the owning task is suspended.
unsafe impl Send for Context {}

impl Context {
    pub fn stack_pointer(&self) -> Option<usize> {
        Some(self.0 as usize)
    }
}

/// Thumb state bit.
const DEFAULT_XPSR: u32 = 0x0100_0000;

/// Return to Thread mode, process stack, no FPU frame.
const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// Kernel the exception handlers work on, published by [`Cpu::start`].
static KERNEL: AtomicPtr<Kernel> = AtomicPtr::new(core::ptr::null_mut());

/// Receives the discarded boot context on the first switch.
static BOOT_STACK: Stack<256> = Stack::new();

fn kernel() -> Option<&'static Kernel> {
    let kernel = KERNEL.load(Ordering::Acquire);
    // SAFETY: only ever set from a `&'static Kernel`.
    unsafe { kernel.as_ref() }
}

/// Full-descending stack writer for building initial frames.
struct StackPusher(*mut u32);

impl StackPusher {
    /// # Safety
    /// `top` must be the 8-byte aligned top of a stack large enough for
    /// every word pushed.
    unsafe fn new(top: *mut u8) -> Self {
        Self(top.cast())
    }

    fn push(&mut self, word: u32) {
        // SAFETY: guaranteed by `new`.
        unsafe {
            self.0 = self.0.sub(1);
            self.0.write_volatile(word);
        }
    }
}

/// First code a task runs. Returning from `entry` exits the task.
extern "C" fn task_trampoline(kernel: *const Kernel, entry: *const ()) -> ! {
    // SAFETY: both values were written by `Cpu::prepare` from a
    // `&'static Kernel` and a `TaskFn`.
    let (kernel, entry) = unsafe { (&*kernel, core::mem::transmute::<*const (), TaskFn>(entry)) };
    entry(kernel);
    kernel.exit()
}

// ---------------------------------------------------------------------------
// CPU
// ---------------------------------------------------------------------------

pub struct Cpu;

impl Cpu {
    pub const fn new() -> Self {
        Self
    }

    /// Build an exception frame on the slot's stack so that the first
    /// switch to it enters `task_trampoline(kernel, entry)`.
    pub(crate) fn prepare(
        &self,
        kernel: &'static Kernel,
        _slot: Slot,
        entry: TaskFn,
        stack: &StackRegion,
    ) -> Context {
        // SAFETY: the region is 8-byte aligned, at least MIN_STACK_SIZE
        // long, and its task is stopped.
        let mut pusher = unsafe { StackPusher::new(stack.start()) };

        // Hardware frame
        pusher.push(DEFAULT_XPSR);
        pusher.push(task_trampoline as usize as u32 & !1); // PC
        pusher.push(0); // LR
        pusher.push(0); // R12
        pusher.push(0); // R3
        pusher.push(0); // R2
        pusher.push(entry as usize as u32); // R1
        pusher.push(kernel as *const Kernel as u32); // R0

        // Software frame, popped by PendSV
        pusher.push(EXC_RETURN_THREAD_PSP);
        for _ in 4..=11 {
            pusher.push(0); // R11 .. R4
        }

        Context(pusher.0)
    }

    #[inline]
    pub(crate) fn discard(&self, _slot: Slot) {}

    /// Pend PendSV. It runs as soon as no other handler is active and
    /// interrupts are unmasked.
    #[inline]
    pub(crate) fn request_switch(&self) {
        SCB::set_pendsv();
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
    }

    /// PendSV has already switched by the time this would run.
    #[inline]
    pub(crate) fn switch_point(&self, _kernel: &Kernel) {}

    #[inline]
    pub(crate) fn sleep(&self, _kernel: &Kernel) {
        cortex_m::asm::wfi();
    }

    #[inline]
    pub(crate) fn end_of_interrupt(&self) {}

    pub(crate) fn reset(&self, fault: Fault) -> ! {
        error!("fatal: {}", fault);
        SCB::sys_reset()
    }

    pub(crate) fn enable_transmit(&self) {
        usart::set_transmit_interrupt(true);
    }

    pub(crate) fn disable_transmit(&self) {
        usart::set_transmit_interrupt(false);
    }

    pub(crate) fn show_layer(&self, layer: u8, rows: [u8; 8]) {
        cube::show_layer(layer, &rows);
    }

    pub(crate) fn blank(&self) {
        cube::blank();
    }

    /// Bring up the peripherals and switch to the first task.
    pub(crate) fn start(&self, kernel: &'static Kernel, mut peripherals: cortex_m::Peripherals) -> ! {
        KERNEL.store(kernel as *const Kernel as *mut Kernel, Ordering::Release);

        configure_systick(&mut peripherals.SYST);
        set_interrupt_priorities(&mut peripherals.NVIC);
        usart::init();
        cube::init();

        // SAFETY: the boot context is never resumed; PendSV may scribble
        // on this scratch stack.
        unsafe { cortex_m::register::psp::write(BOOT_STACK.top() as u32) };

        info!("starting scheduler");
        self.request_switch();
        // SAFETY: all handlers are installed and the kernel is published.
        unsafe { cortex_m::interrupt::enable() };
        loop {
            cortex_m::asm::wfi();
        }
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// SysTick / priorities
// ---------------------------------------------------------------------------

/// Fire SysTick at `TICK_HZ` from the core clock.
fn configure_systick(syst: &mut cortex_m::peripheral::SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

#[derive(Clone, Copy)]
struct Usart2Irq;

// SAFETY: 38 is USART2's position in the STM32F4 vector table.
unsafe impl InterruptNumber for Usart2Irq {
    fn number(self) -> u16 {
        USART2_IRQ as u16
    }
}

fn set_interrupt_priorities(nvic: &mut NVIC) {
    // System Handler Priority Register 3 (SHPR3): 0xE000_ED20
    // Bits [23:16] = PendSV priority
    // Bits [31:24] = SysTick priority
    const SHPR3: *mut u32 = 0xE000_ED20 as *mut u32;
    // SAFETY: SHPR3 is a core register; nothing else writes it.
    unsafe {
        let value = SHPR3.read_volatile() & 0x0000_FFFF;
        SHPR3.write_volatile(value | (0xFF << 16) | (0x80 << 24));
        nvic.set_priority(Usart2Irq, 0x40);
        NVIC::unmask(Usart2Irq);
    }
}

// ---------------------------------------------------------------------------
// Exception handlers
// ---------------------------------------------------------------------------

/// PendSV exception handler — performs the actual context switch.
///
/// ## Sequence
/// 1. Stack S16–S31 if the interrupted task has an FPU frame
/// 2. Stack R4–R11 and EXC_RETURN onto the process stack
/// 3. `pendsv_switch(psp)` picks the next task, returns its stack pointer
/// 4. Unstack EXC_RETURN and R4–R11 (and S16–S31) from the new stack
/// 5. Return from exception on the new process stack
///
/// # Safety
/// Called by the NVIC only. Must not touch R4–R11 before they are stacked.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        ".fpu fpv4-sp-d16",
        "cpsid   i",
        "mrs     r0, psp",
        "tst     lr, #0x10",
        "it      eq",
        "vstmdbeq r0!, {{s16-s31}}",
        "stmdb   r0!, {{r4-r11, lr}}",
        "bl      {switch}",
        "ldmia   r0!, {{r4-r11, lr}}",
        "tst     lr, #0x10",
        "it      eq",
        "vldmiaeq r0!, {{s16-s31}}",
        "msr     psp, r0",
        "cpsie   i",
        "bx      lr",
        switch = sym pendsv_switch,
    );
}

/// Scheduling half of PendSV: runs on the main stack with the outgoing
/// task's registers saved at `sp`.
extern "C" fn pendsv_switch(sp: *mut u32) -> *mut u32 {
    let Some(kernel) = kernel() else {
        return sp;
    };
    match kernel.switch_context(Some(Context(sp))) {
        Ok(Switch::Stay) => sp,
        Ok(Switch::To(_, Context(next))) => next,
        Err(fault) => kernel.cpu().reset(fault),
    }
}

#[cortex_m_rt::exception]
fn SysTick() {
    if let Some(kernel) = kernel() {
        kernel.on_tick();
    }
}

/// USART2 global interrupt: one received byte and/or one byte to send.
#[no_mangle]
pub unsafe extern "C" fn USART2() {
    let Some(kernel) = kernel() else {
        return;
    };
    let status = usart::status();
    if status & (usart::SR_RXNE | usart::SR_ERRORS) != 0 {
        let error = status & usart::SR_ERRORS != 0;
        // Reading DR after SR clears RXNE and the error flags.
        let byte = usart::read();
        kernel.on_byte_received(byte, error);
    }
    if status & usart::SR_TXE != 0 && usart::transmit_interrupt_enabled() {
        if let Some(byte) = kernel.on_ready_to_send() {
            usart::write(byte);
        }
    }
}

// ---------------------------------------------------------------------------
// Device vector table
// ---------------------------------------------------------------------------

const USART2_IRQ: usize = 38;

#[derive(Clone, Copy)]
pub union Vector {
    handler: unsafe extern "C" fn(),
    reserved: usize,
}

extern "C" {
    fn DefaultHandler();
}

#[link_section = ".vector_table.interrupts"]
#[no_mangle]
#[used]
pub static __INTERRUPTS: [Vector; USART2_IRQ + 1] = {
    let mut vectors = [Vector {
        handler: DefaultHandler,
    }; USART2_IRQ + 1];
    vectors[USART2_IRQ] = Vector { handler: USART2 };
    vectors
};

// ---------------------------------------------------------------------------
// Registers
// ---------------------------------------------------------------------------

#[inline]
fn read_reg(address: usize) -> u32 {
    // SAFETY: callers pass memory-mapped peripheral registers.
    unsafe { (address as *const u32).read_volatile() }
}

#[inline]
fn write_reg(address: usize, value: u32) {
    // SAFETY: callers pass memory-mapped peripheral registers.
    unsafe { (address as *mut u32).write_volatile(value) }
}

#[inline]
fn modify_reg(address: usize, f: impl FnOnce(u32) -> u32) {
    write_reg(address, f(read_reg(address)));
}

const RCC_AHB1ENR: usize = 0x4002_3830;
const RCC_APB1ENR: usize = 0x4002_3840;
const RCC_AHB1ENR_GPIOAEN: u32 = 1 << 0;
const RCC_AHB1ENR_GPIOBEN: u32 = 1 << 1;
const RCC_AHB1ENR_GPIOCEN: u32 = 1 << 2;
const RCC_APB1ENR_USART2EN: u32 = 1 << 17;

const GPIOA: usize = 0x4002_0000;
const GPIOB: usize = 0x4002_0400;
const GPIOC: usize = 0x4002_0800;
const GPIO_MODER: usize = 0x00;
const GPIO_ODR: usize = 0x14;
const GPIO_BSRR: usize = 0x18;
const GPIO_AFRL: usize = 0x20;

/// USART2 on PA2 (TX) / PA3 (RX), alternate function 7.
mod usart {
    use super::*;

    const BASE: usize = 0x4000_4400;
    const SR: usize = BASE + 0x00;
    const DR: usize = BASE + 0x04;
    const BRR: usize = BASE + 0x08;
    const CR1: usize = BASE + 0x0C;

    pub const SR_PE: u32 = 1 << 0;
    pub const SR_FE: u32 = 1 << 1;
    pub const SR_NF: u32 = 1 << 2;
    pub const SR_ORE: u32 = 1 << 3;
    pub const SR_RXNE: u32 = 1 << 5;
    pub const SR_TXE: u32 = 1 << 7;
    pub const SR_ERRORS: u32 = SR_PE | SR_FE | SR_NF | SR_ORE;

    const CR1_RE: u32 = 1 << 2;
    const CR1_TE: u32 = 1 << 3;
    const CR1_RXNEIE: u32 = 1 << 5;
    const CR1_TXEIE: u32 = 1 << 7;
    const CR1_UE: u32 = 1 << 13;

    pub fn init() {
        modify_reg(RCC_AHB1ENR, |v| v | RCC_AHB1ENR_GPIOAEN);
        modify_reg(RCC_APB1ENR, |v| v | RCC_APB1ENR_USART2EN);

        // PA2/PA3: alternate function mode, AF7.
        modify_reg(GPIOA + GPIO_MODER, |v| (v & !(0xF << 4)) | (0b1010 << 4));
        modify_reg(GPIOA + GPIO_AFRL, |v| (v & !(0xFF << 8)) | (0x77 << 8));

        write_reg(BRR, (SYSTEM_CLOCK_HZ + BAUD_RATE / 2) / BAUD_RATE);
        write_reg(CR1, CR1_UE | CR1_TE | CR1_RE | CR1_RXNEIE);
    }

    pub fn status() -> u32 {
        read_reg(SR)
    }

    pub fn read() -> u8 {
        read_reg(DR) as u8
    }

    pub fn write(byte: u8) {
        write_reg(DR, u32::from(byte));
    }

    pub fn transmit_interrupt_enabled() -> bool {
        read_reg(CR1) & CR1_TXEIE != 0
    }

    pub fn set_transmit_interrupt(enabled: bool) {
        critical_section::with(|_| {
            modify_reg(CR1, |v| if enabled { v | CR1_TXEIE } else { v & !CR1_TXEIE });
        });
    }
}

/// Cube wiring: row data on PC0–PC7, row latch address on PC8–PC10, latch
/// strobe on PC11; one layer driver per pin on PB0–PB7.
mod cube {
    use super::*;

    const LATCH_STROBE: u32 = 1 << 11;
    const LAYER_MASK: u32 = 0xFF;

    pub fn init() {
        modify_reg(RCC_AHB1ENR, |v| v | RCC_AHB1ENR_GPIOBEN | RCC_AHB1ENR_GPIOCEN);
        // General purpose output on PB0–PB7 and PC0–PC11.
        modify_reg(GPIOB + GPIO_MODER, |v| (v & !0xFFFF) | 0x5555);
        modify_reg(GPIOC + GPIO_MODER, |v| (v & !0x00FF_FFFF) | 0x0055_5555);
        blank();
    }

    pub fn blank() {
        write_reg(GPIOB + GPIO_BSRR, LAYER_MASK << 16);
    }

    pub fn show_layer(layer: u8, rows: &[u8; 8]) {
        blank();
        for (y, &row) in rows.iter().enumerate() {
            let data = u32::from(row) | ((y as u32) << 8);
            write_reg(GPIOC + GPIO_ODR, data);
            write_reg(GPIOC + GPIO_BSRR, LATCH_STROBE);
            write_reg(GPIOC + GPIO_BSRR, LATCH_STROBE << 16);
        }
        write_reg(GPIOB + GPIO_BSRR, 1 << (layer & 7));
    }
}
