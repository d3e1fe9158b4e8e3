//! Monotonic time source used by every periodic computation.
//!
//! Time is read as a wrapping 32-bit microsecond counter. Differences are taken
//! with wrapping subtraction, so a caller that never lets more than one full
//! counter period (about 71.6 minutes) pass between two reads always gets the
//! correct elapsed time, even across overflow.
//!
//! # Example
//! ```rust
//! use flywheel_core::utils::math::time::{ManualClock, Stopwatch};
//! let clock = ManualClock::new(0);
//! let mut watch = Stopwatch::start(&clock);
//! clock.advance_micros(250_000);
//! assert_eq!(watch.lap(&clock), 0.25);
//! ```

use core::sync::atomic::{AtomicU32, Ordering};

/// Microseconds per second, as used when converting counter deltas.
const MICROS_PER_SECOND: f32 = 1_000_000.0;

/// A monotonic microsecond clock that wraps at `u32::MAX`.
pub trait Clock {
    /// Current time in microseconds.
    fn now_micros(&self) -> u32;
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now_micros(&self) -> u32 {
        (**self).now_micros()
    }
}

/// Reads the clock and returns the seconds elapsed since `last`, along with the
/// new timestamp the caller should store.
pub fn elapsed<C: Clock + ?Sized>(
    clock: &C,
    last: u32,
) -> (f32, u32) {
    let now = clock.now_micros();
    let seconds = now.wrapping_sub(last) as f32 / MICROS_PER_SECOND;
    (seconds, now)
}

/// Last-call timestamp with elapsed-time bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stopwatch {
    last: u32,
}

impl Stopwatch {
    /// Start timing from the clock's current reading.
    pub fn start<C: Clock + ?Sized>(clock: &C) -> Self {
        Self {
            last: clock.now_micros(),
        }
    }

    /// Seconds since the previous lap (or start), then restart from now.
    pub fn lap<C: Clock + ?Sized>(
        &mut self,
        clock: &C,
    ) -> f32 {
        let (seconds, now) = elapsed(clock, self.last);
        self.last = now;
        seconds
    }

    /// Re-seed the stopwatch to the clock's current reading.
    pub fn restart<C: Clock + ?Sized>(
        &mut self,
        clock: &C,
    ) {
        self.last = clock.now_micros();
    }

    /// Timestamp of the last lap, in microseconds.
    pub fn last_micros(&self) -> u32 {
        self.last
    }
}

/// Clock backed by the embassy time driver.
///
/// The 64-bit embassy instant is truncated to 32 bits, which gives the same
/// wrapping behaviour as a hardware microsecond counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbassyClock;

impl Clock for EmbassyClock {
    fn now_micros(&self) -> u32 {
        embassy_time::Instant::now().as_micros() as u32
    }
}

/// Clock that only moves when told to. Used for simulation and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicU32,
}

impl ManualClock {
    pub const fn new(start_micros: u32) -> Self {
        Self {
            micros: AtomicU32::new(start_micros),
        }
    }

    pub fn advance_micros(
        &self,
        micros: u32,
    ) {
        let now = self.micros.load(Ordering::Acquire);
        self.micros.store(now.wrapping_add(micros), Ordering::Release);
    }

    pub fn advance_secs(
        &self,
        seconds: f32,
    ) {
        self.advance_micros((seconds * MICROS_PER_SECOND) as u32);
    }

    pub fn set_micros(
        &self,
        micros: u32,
    ) {
        self.micros.store(micros, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u32 {
        self.micros.load(Ordering::Acquire)
    }
}
