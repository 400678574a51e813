//! # Timer
//!
//! Wraparound-safe 16-bit millisecond counter. The counter itself lives in
//! the kernel state and is advanced by the SysTick handler; the functions
//! here are the pure arithmetic on tick values.

/// Tick count, one tick per millisecond. Wraps after ~65 s.
pub type Ticks = u16;

/// Timeout sentinel: never elapses.
pub const INFINITE: Ticks = Ticks::MAX;

/// Ticks from `since` to `now`, correct across one wraparound.
#[inline]
pub const fn elapsed(since: Ticks, now: Ticks) -> Ticks {
    now.wrapping_sub(since)
}

/// Whether `amount` ticks have passed between `since` and `now`.
/// Always `false` for [`INFINITE`].
#[inline]
pub const fn has_elapsed(since: Ticks, now: Ticks, amount: Ticks) -> bool {
    amount != INFINITE && elapsed(since, now) >= amount
}

/// Absolute tick at which a wait of `amount` started at `since` expires,
/// or `None` for an infinite wait.
#[inline]
pub const fn deadline(since: Ticks, amount: Ticks) -> Option<Ticks> {
    if amount == INFINITE {
        None
    } else {
        Some(since.wrapping_add(amount))
    }
}

/// The monotonic tick counter.
#[derive(Debug, Default)]
pub struct Timer {
    now: Ticks,
}

impl Timer {
    pub const fn new() -> Self {
        Self { now: 0 }
    }

    pub fn now(&self) -> Ticks {
        self.now
    }

    /// Advance by one tick and return the new time.
    pub fn tick(&mut self) -> Ticks {
        self.now = self.now.wrapping_add(1);
        self.now
    }
}
