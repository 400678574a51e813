//! # cubeos — LED Cube Controller Kernel
//!
//! A small preemptive multitasking kernel for a single-core Cortex-M4 that
//! drives an 8×8×8 LED cube and talks to a host over a framed serial link.
//!
//! ## Overview
//!
//! - **Fixed task table**: a handful of slots, the slot index is the priority
//!   (lower wins), slot 0 is the idle task and runs only when nothing else can
//! - **Wait bits**: a task blocks on display space, received data, send space
//!   and/or a deadline; interrupt handlers clear the bits and ask for a switch
//! - **Transactional FIFOs**: producers and consumers reserve, move and then
//!   commit whole messages, so a half-received frame is never visible
//! - **Framing protocol**: boundary/escape byte stuffing with a CRC-8, driven
//!   one byte at a time from the serial interrupts
//! - **Stack guards**: every switch checks the guard pattern at the bottom of
//!   the outgoing and incoming stacks
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │              Tasks (system task, cube apps)             │
//! ├────────────────────────────────────────────────────────┤
//! │                 Kernel API (kernel.rs)                  │
//! │  task_start · yield_now · receive_bytes · send_bytes    │
//! │  delay · advance_frame · on_tick · on_byte_received     │
//! ├──────────────┬────────────────────┬───────────────────┤
//! │  Scheduler   │  Protocol          │  Display ring     │
//! │  scheduler.rs│  protocol/         │  display.rs       │
//! │  ─ select()  │  ─ Receiver        │  ─ advance()      │
//! │  ─ switch()  │  ─ Transmitter     │  ─ refresh()      │
//! │  ─ wake()    │  ─ crc             │                   │
//! ├──────────────┴────────────────────┴───────────────────┤
//! │   Task model · FIFO · Timer · Stack · Sync              │
//! ├────────────────────────────────────────────────────────┤
//! │   Arch port: arch/cortex_m4.rs │ arch/host.rs           │
//! │   PendSV · SysTick · USART2    │ threads as tasks       │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Model
//!
//! - **No heap** in the kernel: the task table, FIFO storage and stacks are
//!   statically allocated
//! - **One lock**: all shared state lives in a single
//!   `critical_section::Mutex`
//! - **`no_std`** on the target; on a development machine the crate builds
//!   with `std` and the host port simulates the CPU so the kernel can be
//!   exercised by ordinary tests

#![cfg_attr(all(target_arch = "arm", target_os = "none"), no_std)]

#[macro_use]
mod log;

pub mod arch;
pub mod config;
pub mod display;
pub mod fifo;
pub mod kernel;
pub mod protocol;
pub mod scheduler;
pub mod stack;
pub mod sync;
pub mod task;
pub mod timer;

pub use kernel::{idle_task, Error, Kernel};
pub use task::{Slot, TaskConfig, TaskFn, TaskStatus};
pub use timer::{Ticks, INFINITE};
