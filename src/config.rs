//! # cubeos Configuration
//!
//! Compile-time constants governing the kernel, the serial link and the
//! display. All limits are fixed at compile time — no dynamic allocation.

/// Number of task slots. The slot index doubles as the scheduling
/// priority (lower runs first), except for [`IDLE_SLOT`].
pub const TASK_COUNT: usize = 4;

/// Slot reserved for the idle/system task. It is always scheduled, never
/// waits, and only runs when no other slot is runnable.
pub const IDLE_SLOT: usize = 0;

/// SysTick frequency in Hz. One tick is one millisecond.
pub const TICK_HZ: u32 = 1000;

/// System clock frequency in Hz (STM32F4 at 16 MHz HSI, no PLL).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Serial link speed.
pub const BAUD_RATE: u32 = 38_400;

/// Pattern written at the low end of every task stack and checked at each
/// scheduling decision.
pub const STACK_GUARD: [u8; 4] = [0xA5, 0x5A, 0xC3, 0x3C];

/// Smallest accepted stack: the guard, the initial exception frame
/// (8 words hardware + 9 words software) and some headroom.
pub const MIN_STACK_SIZE: usize = 256;

/// Number of frames in the display ring.
pub const FRAME_COUNT: usize = 16;

/// Layers (Z planes) of the cube, scanned one per tick.
pub const LAYER_COUNT: usize = 8;

/// Bytes per frame: 8 layers of 8 rows, one bit per voxel.
pub const FRAME_SIZE: usize = LAYER_COUNT * 8;

/// Full layer scans per frame before the display moves on.
pub const FRAME_REPEAT: u8 = 5;
