//! Integration tests for the kernel on the host port.
//!
//! Every test boots its own leaked `Kernel`. Task bodies run on their own
//! threads, one at a time; the test thread plays the hardware by calling
//! the interrupt entry points (`on_tick`, `on_byte_received`,
//! `on_ready_to_send`).

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use cubeos::config::IDLE_SLOT;
use cubeos::display::FrameInit;
use cubeos::protocol::crc::{self, checksum};
use cubeos::protocol::{needs_escape, Header, BOUNDARY, ESCAPE, ESCAPE_MASK};
use cubeos::scheduler::Fault;
use cubeos::stack::{Stack, StackRegion};
use cubeos::{idle_task, Error, Kernel, Slot, TaskConfig, TaskFn, TaskStatus, INFINITE};

const TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn kernel() -> &'static Kernel {
    Box::leak(Box::new(Kernel::new()))
}

fn stack() -> StackRegion {
    let stack: &'static Stack<1024> = Box::leak(Box::new(Stack::new()));
    stack.region()
}

fn buffer(len: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; len].into_boxed_slice())
}

fn spawn(kernel: &'static Kernel, slot: Slot, config: TaskConfig, entry: TaskFn) {
    kernel.init_task(slot, config).expect("slot configured");
    kernel.task_start(slot, entry).expect("task started");
}

/// Start the idle task and hand the CPU to the scheduler.
fn boot(kernel: &'static Kernel) {
    spawn(kernel, IDLE_SLOT, TaskConfig::new(stack()), idle_task);
    kernel.run();
}

/// Tick until `condition` holds, failing after `TIMEOUT`.
fn eventually(kernel: &Kernel, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < TIMEOUT, "condition not reached in time");
        kernel.on_tick();
        thread::sleep(Duration::from_millis(1));
    }
}

fn waits_on(kernel: &Kernel, slot: Slot, reason: TaskStatus) -> bool {
    kernel
        .task_status(slot)
        .is_some_and(|status| status.contains(reason))
}

/// A complete frame, opening and closing boundary included.
fn frame(address: u8, body: &[u8]) -> Vec<u8> {
    let header = Header::new(address, body.len() as u8).encode();
    let mut unescaped = vec![header];
    unescaped.extend_from_slice(body);
    unescaped.push(checksum(&unescaped));

    let mut wire = vec![BOUNDARY];
    for byte in unescaped {
        if needs_escape(byte) {
            wire.extend_from_slice(&[ESCAPE, byte ^ ESCAPE_MASK]);
        } else {
            wire.push(byte);
        }
    }
    wire.push(BOUNDARY);
    wire
}

fn feed(kernel: &Kernel, wire: &[u8]) {
    for &byte in wire {
        kernel.on_byte_received(byte, false);
    }
}

// ---------------------------------------------------------------------------
// Serial I/O
// ---------------------------------------------------------------------------

mod serial_tests {
    use super::*;

    #[test]
    fn test_blocking_send_is_woken_by_transmit_interrupts() {
        static DONE: AtomicBool = AtomicBool::new(false);

        fn sender(kernel: &'static Kernel) {
            kernel.send_bytes(&[1, 2, 3, 4, 5, 6], INFINITE).unwrap();
            // Only two bytes left in the FIFO: blocks until the first
            // frame has gone out.
            kernel.send_bytes(&[7, 8, 9, 10, 11, 12], INFINITE).unwrap();
            DONE.store(true, Ordering::SeqCst);
        }

        let kernel = kernel();
        spawn(kernel, 1, TaskConfig::new(stack()).with_send(buffer(8)), sender);
        boot(kernel);

        eventually(kernel, || waits_on(kernel, 1, TaskStatus::WAIT_SEND));
        assert!(kernel.port().transmit_enabled());

        let mut wire = Vec::new();
        eventually(kernel, || {
            while let Some(byte) = kernel.on_ready_to_send() {
                wire.push(byte);
            }
            DONE.load(Ordering::SeqCst) && !kernel.port().transmit_enabled()
        });

        let frames: Vec<&[u8]> = wire
            .split(|&byte| byte == BOUNDARY)
            .filter(|segment| !segment.is_empty())
            .collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..7], &[0x86, 1, 2, 3, 4, 5, 6]);
        assert_eq!(&frames[1][..7], &[0x86, 7, 8, 9, 10, 11, 12]);
        for frame in frames {
            assert_eq!(checksum(frame), crc::VALID);
        }
    }

    #[test]
    fn test_full_sender_is_woken_by_draining_task() {
        static SENDER_WAITED: AtomicBool = AtomicBool::new(false);
        static SENT: AtomicBool = AtomicBool::new(false);
        static DRAINED: AtomicBool = AtomicBool::new(false);
        static WIRE: Mutex<Vec<u8>> = Mutex::new(Vec::new());

        fn sender(kernel: &'static Kernel) {
            kernel.send_bytes(&[0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7], 0).unwrap();
            // FIFO full: blocks until the drainer has moved the first frame out.
            kernel.send_bytes(&[0x01, 0x02], INFINITE).unwrap();
            SENT.store(true, Ordering::SeqCst);
        }

        // Lower priority, so it only runs once the sender is blocked.
        fn drainer(kernel: &'static Kernel) {
            SENDER_WAITED.store(waits_on(kernel, 1, TaskStatus::WAIT_SEND), Ordering::SeqCst);
            loop {
                match kernel.on_ready_to_send() {
                    Some(byte) => WIRE.lock().unwrap().push(byte),
                    None if SENT.load(Ordering::SeqCst) => break,
                    None => {}
                }
                kernel.yield_now();
            }
            DRAINED.store(true, Ordering::SeqCst);
        }

        let kernel = kernel();
        spawn(kernel, 1, TaskConfig::new(stack()).with_send(buffer(8)), sender);
        spawn(kernel, 2, TaskConfig::new(stack()), drainer);
        boot(kernel);

        eventually(kernel, || DRAINED.load(Ordering::SeqCst));
        assert!(SENDER_WAITED.load(Ordering::SeqCst));
        assert_eq!(kernel.task_status(1), Some(TaskStatus::empty()));

        let wire = WIRE.lock().unwrap();
        let frames: Vec<&[u8]> = wire
            .split(|&byte| byte == BOUNDARY)
            .filter(|segment| !segment.is_empty())
            .collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..9], &[0x88, 0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7]);
        assert_eq!(&frames[1][..3], &[0x82, 0x01, 0x02]);
        for frame in frames {
            assert_eq!(checksum(frame), crc::VALID);
        }
    }

    #[test]
    fn test_receive_wakes_on_frame() {
        static RECEIVED: AtomicU32 = AtomicU32::new(0);
        static DONE: AtomicBool = AtomicBool::new(false);

        fn receiver(kernel: &'static Kernel) {
            let mut body = [0u8; 3];
            kernel.receive_bytes(&mut body, INFINITE).unwrap();
            RECEIVED.store(u32::from_be_bytes([0, body[0], body[1], body[2]]), Ordering::SeqCst);
            DONE.store(true, Ordering::SeqCst);
        }

        let kernel = kernel();
        spawn(kernel, 1, TaskConfig::new(stack()).with_recv(buffer(16)), receiver);
        boot(kernel);

        eventually(kernel, || waits_on(kernel, 1, TaskStatus::WAIT_RECV));
        feed(kernel, &frame(1, &[0x11, 0x7E, 0x33]));

        eventually(kernel, || DONE.load(Ordering::SeqCst));
        assert_eq!(RECEIVED.load(Ordering::SeqCst), 0x11_7E33);
        assert_eq!(kernel.receiver_stats().accepted, 1);
    }

    #[test]
    fn test_corrupted_frame_is_dropped() {
        static RECEIVED: AtomicU32 = AtomicU32::new(0);
        static DONE: AtomicBool = AtomicBool::new(false);

        fn receiver(kernel: &'static Kernel) {
            let mut body = [0u8; 3];
            kernel.receive_bytes(&mut body, INFINITE).unwrap();
            RECEIVED.store(u32::from_be_bytes([0, body[0], body[1], body[2]]), Ordering::SeqCst);
            DONE.store(true, Ordering::SeqCst);
        }

        let kernel = kernel();
        spawn(kernel, 1, TaskConfig::new(stack()).with_recv(buffer(16)), receiver);
        boot(kernel);
        eventually(kernel, || waits_on(kernel, 1, TaskStatus::WAIT_RECV));

        let mut corrupted = frame(1, &[1, 2, 3]);
        corrupted[2] ^= 0x40;
        feed(kernel, &corrupted);
        assert!(waits_on(kernel, 1, TaskStatus::WAIT_RECV));

        feed(kernel, &frame(1, &[4, 5, 6]));
        eventually(kernel, || DONE.load(Ordering::SeqCst));
        assert_eq!(RECEIVED.load(Ordering::SeqCst), 0x04_0506);

        let stats = kernel.receiver_stats();
        assert_eq!(stats.accepted, 1);
        assert!(stats.dropped >= 1);
    }

    #[test]
    fn test_receive_times_out() {
        static ELAPSED: AtomicU32 = AtomicU32::new(0);
        static TIMED_OUT: AtomicBool = AtomicBool::new(false);

        fn receiver(kernel: &'static Kernel) {
            let start = kernel.now();
            let mut body = [0u8; 1];
            let result = kernel.receive_bytes(&mut body, 10);
            ELAPSED.store(u32::from(kernel.elapsed(start)), Ordering::SeqCst);
            TIMED_OUT.store(result == Err(Error::Timeout), Ordering::SeqCst);
        }

        let kernel = kernel();
        spawn(kernel, 1, TaskConfig::new(stack()).with_recv(buffer(16)), receiver);
        boot(kernel);

        eventually(kernel, || TIMED_OUT.load(Ordering::SeqCst));
        assert!(ELAPSED.load(Ordering::SeqCst) >= 10);
    }

    #[test]
    fn test_oversized_requests_fail_fast() {
        static CHECKED: AtomicBool = AtomicBool::new(false);

        fn task(kernel: &'static Kernel) {
            let mut big = [0u8; 32];
            assert_eq!(kernel.receive_bytes(&mut big, INFINITE), Err(Error::TooLarge));
            assert_eq!(kernel.send_bytes(&big, INFINITE), Err(Error::TooLarge));
            assert_eq!(kernel.send_bytes(&big[..4], 0), Ok(()));
            assert_eq!(kernel.send_bytes(&big[..8], 0), Err(Error::Timeout));
            CHECKED.store(true, Ordering::SeqCst);
        }

        let kernel = kernel();
        let config = TaskConfig::new(stack())
            .with_recv(buffer(8))
            .with_send(buffer(8));
        spawn(kernel, 1, config, task);
        boot(kernel);

        eventually(kernel, || CHECKED.load(Ordering::SeqCst));
        assert!(!kernel.port().crashed());
    }

    #[test]
    fn test_idle_task_never_blocks() {
        static RESULT: AtomicBool = AtomicBool::new(false);

        fn system(kernel: &'static Kernel) {
            let mut body = [0u8; 1];
            let result = kernel.receive_bytes(&mut body, INFINITE);
            RESULT.store(result == Err(Error::Timeout), Ordering::SeqCst);
            idle_task(kernel);
        }

        let kernel = kernel();
        spawn(kernel, IDLE_SLOT, TaskConfig::new(stack()).with_recv(buffer(8)), system);
        kernel.run();

        eventually(kernel, || RESULT.load(Ordering::SeqCst));
        assert_eq!(kernel.task_status(IDLE_SLOT), Some(TaskStatus::SCHEDULED));
    }
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

mod scheduling_tests {
    use super::*;

    #[test]
    fn test_delay_waits_for_deadline() {
        static ELAPSED: AtomicU32 = AtomicU32::new(0);
        static DONE: AtomicBool = AtomicBool::new(false);

        fn sleeper(kernel: &'static Kernel) {
            let start = kernel.now();
            kernel.delay(20);
            ELAPSED.store(u32::from(kernel.elapsed(start)), Ordering::SeqCst);
            DONE.store(true, Ordering::SeqCst);
        }

        let kernel = kernel();
        spawn(kernel, 1, TaskConfig::new(stack()), sleeper);
        boot(kernel);

        eventually(kernel, || waits_on(kernel, 1, TaskStatus::WAIT_TIMER));
        eventually(kernel, || DONE.load(Ordering::SeqCst));
        assert!(ELAPSED.load(Ordering::SeqCst) >= 20);
    }

    #[test]
    fn test_woken_task_preempts_lower_priority() {
        static SPINS: AtomicUsize = AtomicUsize::new(0);
        static SPINS_BEFORE_WAKE: AtomicUsize = AtomicUsize::new(0);
        static WOKE: AtomicBool = AtomicBool::new(false);
        static STOP: AtomicBool = AtomicBool::new(false);

        fn high(kernel: &'static Kernel) {
            kernel.delay(5);
            SPINS_BEFORE_WAKE.store(SPINS.load(Ordering::SeqCst), Ordering::SeqCst);
            WOKE.store(true, Ordering::SeqCst);
        }

        fn low(kernel: &'static Kernel) {
            while !STOP.load(Ordering::SeqCst) {
                SPINS.fetch_add(1, Ordering::SeqCst);
                kernel.yield_now();
            }
        }

        let kernel = kernel();
        spawn(kernel, 1, TaskConfig::new(stack()), high);
        spawn(kernel, 2, TaskConfig::new(stack()), low);
        boot(kernel);

        eventually(kernel, || WOKE.load(Ordering::SeqCst));
        assert!(SPINS_BEFORE_WAKE.load(Ordering::SeqCst) > 0);

        // Slot 1 returned from its entry point and is stopped; slot 2 runs on.
        eventually(kernel, || kernel.task_status(1) == Some(TaskStatus::empty()));
        let spins = SPINS.load(Ordering::SeqCst);
        eventually(kernel, || SPINS.load(Ordering::SeqCst) > spins);
        assert_eq!(kernel.current_task(), Some(2));

        STOP.store(true, Ordering::SeqCst);
        eventually(kernel, || kernel.current_task() == Some(IDLE_SLOT));
        assert!(kernel.switch_count() >= 3);
    }

    #[test]
    fn test_task_stops_another_task() {
        static SPINS: AtomicUsize = AtomicUsize::new(0);
        static STOPPED: AtomicBool = AtomicBool::new(false);

        fn supervisor(kernel: &'static Kernel) {
            kernel.delay(5);
            kernel.task_stop(2).unwrap();
            assert_eq!(kernel.task_stop(IDLE_SLOT), Err(Error::IdleTask));
            STOPPED.store(true, Ordering::SeqCst);
        }

        fn worker(kernel: &'static Kernel) {
            loop {
                SPINS.fetch_add(1, Ordering::SeqCst);
                kernel.yield_now();
            }
        }

        let kernel = kernel();
        spawn(kernel, 1, TaskConfig::new(stack()), supervisor);
        spawn(kernel, 2, TaskConfig::new(stack()), worker);
        boot(kernel);

        eventually(kernel, || STOPPED.load(Ordering::SeqCst));
        assert_eq!(kernel.task_status(2), Some(TaskStatus::empty()));

        eventually(kernel, || kernel.current_task() == Some(IDLE_SLOT));
        let spins = SPINS.load(Ordering::SeqCst);
        for _ in 0..20 {
            kernel.on_tick();
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(SPINS.load(Ordering::SeqCst), spins);
        assert!(!kernel.port().crashed());
    }

    #[test]
    fn test_returning_idle_entry_keeps_idling() {
        static WAKEUPS: AtomicUsize = AtomicUsize::new(0);

        fn short_idle(_: &'static Kernel) {}

        fn ticker(kernel: &'static Kernel) {
            loop {
                kernel.delay(3);
                WAKEUPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let kernel = kernel();
        spawn(kernel, IDLE_SLOT, TaskConfig::new(stack()), short_idle);
        spawn(kernel, 1, TaskConfig::new(stack()), ticker);
        kernel.run();

        eventually(kernel, || WAKEUPS.load(Ordering::SeqCst) >= 3);
        assert_eq!(kernel.task_status(IDLE_SLOT), Some(TaskStatus::SCHEDULED));
        assert_eq!(kernel.port().fault(), None);
        assert!(!kernel.port().crashed());
    }

    #[test]
    fn test_stack_overflow_is_fatal() {
        static OVERFLOWING: Stack<256> = Stack::new();

        fn overflow(kernel: &'static Kernel) {
            // Simulate running past the bottom of the stack.
            unsafe { OVERFLOWING.bottom().write_volatile(0) };
            loop {
                kernel.yield_now();
            }
        }

        let kernel = kernel();
        spawn(kernel, 1, TaskConfig::new(OVERFLOWING.region()), overflow);
        boot(kernel);

        eventually(kernel, || kernel.port().fault().is_some());
        assert_eq!(kernel.port().fault(), Some(Fault::StackOverflow(1)));
        assert_eq!(kernel.port().running(), None);
        assert!(!kernel.port().crashed());
    }

    #[test]
    fn test_no_runnable_task_is_fatal() {
        fn lonely(kernel: &'static Kernel) {
            kernel.delay(INFINITE);
        }

        let kernel = kernel();
        spawn(kernel, 1, TaskConfig::new(stack()), lonely);
        kernel.run();

        eventually(kernel, || kernel.port().fault().is_some());
        assert_eq!(kernel.port().fault(), Some(Fault::NoRunnableTask));
    }
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

mod display_tests {
    use super::*;

    #[test]
    fn test_full_ring_blocks_until_display_advances() {
        static FRAMES: AtomicUsize = AtomicUsize::new(0);

        fn animation(kernel: &'static Kernel) {
            kernel.enable_display();
            loop {
                kernel
                    .advance_frame(INFINITE, FrameInit::Clear, |frame| frame.set(1, 1, 1, true))
                    .unwrap();
                FRAMES.fetch_add(1, Ordering::SeqCst);
            }
        }

        let kernel = kernel();
        spawn(kernel, 1, TaskConfig::new(stack()), animation);
        boot(kernel);

        eventually(kernel, || waits_on(kernel, 1, TaskStatus::WAIT_DISPLAY));
        assert_eq!(kernel.free_frames(), 0);
        let drawn = FRAMES.load(Ordering::SeqCst);
        assert!(drawn >= 14);

        eventually(kernel, || FRAMES.load(Ordering::SeqCst) > drawn);
        assert!(kernel.port().last_layer().is_some());
    }

    #[test]
    fn test_draw_may_call_into_kernel() {
        static COLUMN: AtomicU32 = AtomicU32::new(u32::MAX);
        static KEPT: AtomicBool = AtomicBool::new(false);

        fn animation(kernel: &'static Kernel) {
            kernel.enable_display();
            kernel
                .advance_frame(INFINITE, FrameInit::Clear, |frame| {
                    let column = (kernel.now() & 7) as u8;
                    assert!(kernel.free_frames() > 0);
                    frame.set(column, 0, 0, true);
                    COLUMN.store(u32::from(column), Ordering::SeqCst);
                })
                .unwrap();
            kernel
                .advance_frame(INFINITE, FrameInit::Copy, |frame| {
                    let column = COLUMN.load(Ordering::SeqCst) as u8;
                    KEPT.store(frame.get(column, 0, 0), Ordering::SeqCst);
                })
                .unwrap();
        }

        let kernel = kernel();
        spawn(kernel, 1, TaskConfig::new(stack()), animation);
        boot(kernel);

        eventually(kernel, || kernel.task_status(1) == Some(TaskStatus::empty()));
        assert!(COLUMN.load(Ordering::SeqCst) < 8);
        assert!(KEPT.load(Ordering::SeqCst));
        assert!(!kernel.port().crashed());
    }
}
