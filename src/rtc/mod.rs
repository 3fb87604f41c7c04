use lazy_static::lazy_static;
use std::cell::Cell;
use std::time::Instant;

lazy_static! {
    static ref START: Instant = Instant::now();
}

pub fn TimeMillis() -> i64 {
    START.elapsed().as_millis() as i64
}

/// Monotonic millisecond clock, injected at construction so time-based windows
/// (loss history, bitrate ring, frame-rate ring) are deterministic under test.
pub trait Clock {
    fn time_millis(&self) -> i64;
}

/// Process-wide monotonic clock, anchored at first use.
#[derive(Default)]
pub struct RealTimeClock;

impl Clock for RealTimeClock {
    fn time_millis(&self) -> i64 {
        TimeMillis()
    }
}

/// Manually advanced clock for tests.
pub struct SimulatedClock {
    now_ms: Cell<i64>,
}

impl SimulatedClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: Cell::new(start_ms),
        }
    }

    pub fn advance_ms(&self, delta_ms: i64) {
        self.now_ms.set(self.now_ms.get() + delta_ms);
    }
}

impl Clock for SimulatedClock {
    fn time_millis(&self) -> i64 {
        self.now_ms.get()
    }
}
