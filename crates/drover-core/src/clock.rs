//! Monotonic time source with a manual variant for deterministic tests.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

enum Source {
    Monotonic(Instant),
    Manual(Rc<Cell<u64>>),
}

/// A microsecond-resolution monotonic clock handle.
///
/// Cloning is cheap; all clones of a manual clock share the same cell,
/// so advancing the [`ManualClock`] is visible through every handle.
pub struct Clock {
    source: Rc<Source>,
}

impl Clock {
    /// A clock backed by [`Instant`], starting at zero.
    pub fn monotonic() -> Self {
        Self {
            source: Rc::new(Source::Monotonic(Instant::now())),
        }
    }

    /// A manually driven clock for tests, starting at zero.
    ///
    /// Returns the clock and its driver; only the driver can advance time.
    pub fn manual() -> (Self, ManualClock) {
        let cell = Rc::new(Cell::new(0));
        let clock = Self {
            source: Rc::new(Source::Manual(cell.clone())),
        };
        (clock, ManualClock { cell })
    }

    /// Current time in microseconds since the clock's origin.
    pub fn now_us(&self) -> u64 {
        match &*self.source {
            Source::Monotonic(origin) => origin.elapsed().as_micros() as u64,
            Source::Manual(cell) => cell.get(),
        }
    }

    /// Current time in seconds since the clock's origin.
    pub fn now_secs(&self) -> f64 {
        self.now_us() as f64 / 1_000_000.0
    }
}

impl Clone for Clock {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::monotonic()
    }
}

/// Driver handle for a manual [`Clock`].
pub struct ManualClock {
    cell: Rc<Cell<u64>>,
}

impl ManualClock {
    /// Advance the clock by `us` microseconds.
    pub fn advance_us(&self, us: u64) {
        self.cell.set(self.cell.get() + us);
    }

    /// Advance the clock by `secs` seconds.
    pub fn advance_secs(&self, secs: f64) {
        self.advance_us((secs * 1_000_000.0) as u64);
    }

    /// Set the clock to an absolute microsecond value.
    ///
    /// Moving backwards would violate monotonicity; values below the
    /// current reading are ignored.
    pub fn set_us(&self, us: u64) {
        if us > self.cell.get() {
            self.cell.set(us);
        }
    }
}
