//! # cubeos Firmware
//!
//! Two tasks share the cube controller:
//!
//! | Slot | Task | Stack | FIFOs (recv/send) | Behavior |
//! |------|------|-------|-------------------|----------|
//! | 0 | `system_task` | 1 KiB | 32 / 64 | Idle loop, answers system commands |
//! | 1 | application | 2 KiB | 512 / 64 | One of `APPS`, chosen over the wire |
//!
//! ## System Commands (address 0)
//!
//! | Request | Reply | Meaning |
//! |---------|-------|---------|
//! | `01` | `81` | ping |
//! | `02 n` | `82 n` | (re)start application `n` in slot 1 |
//! | `03` | `83 f` | status: `f` free display frames |
//!
//! The system task is the idle task, so it never blocks: it polls its
//! receive FIFO and sleeps until the next interrupt.

#![no_std]
#![no_main]

use cortex_m::peripheral::DWT;
use cortex_m_rt::entry;
use defmt_semihosting as _;
use panic_halt as _;

use cubeos::display::{Frame, FrameInit};
use cubeos::fifo::FifoBuffer;
use cubeos::kernel::Kernel;
use cubeos::stack::Stack;
use cubeos::task::{Slot, TaskConfig, TaskFn};
use cubeos::timer::{Ticks, INFINITE};

static KERNEL: Kernel = Kernel::new();

const SYSTEM_SLOT: Slot = 0;
const APP_SLOT: Slot = 1;

static SYSTEM_STACK: Stack<1024> = Stack::new();
static SYSTEM_RECV: FifoBuffer<32> = FifoBuffer::new();
static SYSTEM_SEND: FifoBuffer<64> = FifoBuffer::new();

static APP_STACK: Stack<2048> = Stack::new();
static APP_RECV: FifoBuffer<512> = FifoBuffer::new();
static APP_SEND: FifoBuffer<64> = FifoBuffer::new();

defmt::timestamp!("{=u32:010}", DWT::cycle_count());

// ---------------------------------------------------------------------------
// System task
// ---------------------------------------------------------------------------

const CMD_PING: u8 = 0x01;
const CMD_SELECT_APP: u8 = 0x02;
const CMD_STATUS: u8 = 0x03;
const REPLY: u8 = 0x80;

fn system_task(kernel: &'static Kernel) {
    let mut command = [0u8; 1];
    loop {
        if kernel.receive_bytes(&mut command, 0).is_err() {
            kernel.sleep();
            continue;
        }
        match command[0] {
            CMD_PING => reply(kernel, &[CMD_PING | REPLY]),
            CMD_SELECT_APP => {
                let mut app = [0u8; 1];
                match kernel.receive_bytes(&mut app, 0) {
                    Ok(()) => select_app(kernel, app[0]),
                    Err(err) => defmt::warn!("select: missing argument ({})", err),
                }
            }
            CMD_STATUS => {
                let free = kernel.free_frames() as u8;
                reply(kernel, &[CMD_STATUS | REPLY, free]);
            }
            other => defmt::warn!("unknown command {=u8:#04x}", other),
        }
    }
}

fn reply(kernel: &Kernel, bytes: &[u8]) {
    if let Err(err) = kernel.send_bytes(bytes, 0) {
        defmt::warn!("reply dropped: {}", err);
    }
}

fn select_app(kernel: &'static Kernel, index: u8) {
    let Some(&app) = APPS.get(usize::from(index)) else {
        defmt::warn!("no application {=u8}", index);
        return;
    };
    match kernel.task_start(APP_SLOT, app) {
        Ok(()) => {
            defmt::info!("application {=u8} started", index);
            reply(kernel, &[CMD_SELECT_APP | REPLY, index]);
        }
        Err(err) => defmt::error!("application {=u8} failed to start: {}", index, err),
    }
}

// ---------------------------------------------------------------------------
// Applications
// ---------------------------------------------------------------------------

const APPS: [TaskFn; 3] = [app_off, app_standby, app_test];

/// Cube dark; the task parks for good.
fn app_off(kernel: &'static Kernel) {
    kernel.disable_display();
    loop {
        kernel.delay(INFINITE);
    }
}

/// One corner voxel blinks briefly every five seconds.
fn app_standby(kernel: &'static Kernel) {
    kernel.enable_display();
    loop {
        show(kernel, |frame| frame.set(0, 0, 0, true));
        kernel.delay(250);
        show(kernel, |_| {});
        kernel.delay(4750);
    }
}

/// A plane sweeps through the cube, switching axis after each pass. A
/// received byte selects the axis; the number of free frames is reported
/// every two seconds.
fn app_test(kernel: &'static Kernel) {
    const STEP: Ticks = 125;
    const REPORT_EVERY: Ticks = 2000;

    kernel.enable_display();
    let mut axis = 0u8;
    let mut position = 0u8;
    let mut reported = kernel.now();

    loop {
        show(kernel, |frame| set_plane(frame, axis, position));
        position += 1;
        if position == 8 {
            position = 0;
            axis = (axis + 1) % 3;
        }

        let mut request = [0u8; 1];
        if kernel.receive_bytes(&mut request, STEP).is_ok() {
            axis = request[0] % 3;
            position = 0;
        }

        if kernel.has_elapsed(reported, REPORT_EVERY) {
            let free = kernel.free_frames() as u8;
            if kernel.send_bytes(&[free], 0).is_ok() {
                reported = kernel.now();
            }
        }
    }
}

fn show(kernel: &Kernel, draw: impl FnOnce(&mut Frame)) {
    if let Err(err) = kernel.advance_frame(INFINITE, FrameInit::Clear, draw) {
        defmt::warn!("frame skipped: {}", err);
    }
}

/// Light every voxel whose coordinate on `axis` equals `position`.
fn set_plane(frame: &mut Frame, axis: u8, position: u8) {
    for a in 0..8 {
        for b in 0..8 {
            let (x, y, z) = match axis {
                0 => (position, a, b),
                1 => (a, position, b),
                _ => (a, b, position),
            };
            frame.set(x, y, z, true);
        }
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

#[entry]
fn main() -> ! {
    let mut cp = cortex_m::Peripherals::take().unwrap();
    cp.DCB.enable_trace();
    cp.DWT.enable_cycle_counter();

    let system = TaskConfig::new(SYSTEM_STACK.region())
        .with_recv(SYSTEM_RECV.take().expect("system receive buffer"))
        .with_send(SYSTEM_SEND.take().expect("system send buffer"));
    KERNEL
        .init_task(SYSTEM_SLOT, system)
        .expect("Failed to configure the system task");

    let app = TaskConfig::new(APP_STACK.region())
        .with_recv(APP_RECV.take().expect("app receive buffer"))
        .with_send(APP_SEND.take().expect("app send buffer"));
    KERNEL
        .init_task(APP_SLOT, app)
        .expect("Failed to configure the application task");

    KERNEL
        .task_start(SYSTEM_SLOT, system_task)
        .expect("Failed to start the system task");
    KERNEL
        .task_start(APP_SLOT, app_off)
        .expect("Failed to start the application task");

    // Hand over to the scheduler, never returns
    KERNEL.run(cp)
}
