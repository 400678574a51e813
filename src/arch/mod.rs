//! # Architecture Abstraction Layer
//!
//! Everything the kernel needs from the CPU and the board sits behind a
//! `Cpu` type and a `Context` (suspended execution) value with the same
//! shape on every port:
//!
//! | Operation | Cortex-M4 | Host |
//! |-----------|-----------|------|
//! | `prepare` | build an exception frame on the task stack | spawn a parked thread |
//! | `request_switch` | pend PendSV | flag a pending switch |
//! | `switch_point` | nothing (PendSV does the work) | hand the CPU to the next thread |
//! | `sleep` | `wfi` | wait for the next simulated interrupt |
//! | `reset` | `SCB::sys_reset` | record the fault and halt all threads |
//!
//! The host port lets the whole kernel run under `cargo test`.

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use cortex_m4::{Context, Cpu};

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub mod host;
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub use host::{Context, Cpu};
