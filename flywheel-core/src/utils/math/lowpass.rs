//! Single-pole low-pass filter over irregular sample intervals.
//!
//! Each update blends the new input into the stored output with the weight
//! `factor = dt / (time_constant + dt)`, where `dt` is the time since the
//! previous update:
//!
//! ```text
//! output = input * factor + output * (1 - factor)
//! ```
//!
//! For any positive time constant the factor stays in `(0, 1)`, so a constant
//! input is approached monotonically and never overshot. An update with no
//! elapsed time leaves the output untouched.

use super::time::{Clock, Stopwatch};

/// Low-pass filter state, timed by its own clock.
pub struct LowPass<C> {
    clock: C,
    stopwatch: Stopwatch,
    output: f32,
    time_constant: f32,
}

impl<C: Clock> LowPass<C> {
    /// Create a filter seeded with `initial`, with its clock starting now.
    ///
    /// `time_constant` is in seconds.
    pub fn new(
        clock: C,
        initial: f32,
        time_constant: f32,
    ) -> Self {
        let stopwatch = Stopwatch::start(&clock);
        Self {
            clock,
            stopwatch,
            output: initial,
            time_constant,
        }
    }

    /// Filter the next input sample and return the new output.
    pub fn update(
        &mut self,
        input: f32,
    ) -> f32 {
        let dt = self.stopwatch.lap(&self.clock);
        if dt <= 0.0 {
            return self.output;
        }

        let factor = dt / (self.time_constant + dt);
        self.output = input * factor + self.output * (1.0 - factor);
        self.output
    }

    /// Force the output to `value` and restart the filter clock from now.
    pub fn reset(
        &mut self,
        value: f32,
    ) {
        self.output = value;
        self.stopwatch.restart(&self.clock);
    }

    /// Change the smoothing time constant. Output and clock are left alone.
    pub fn adjust(
        &mut self,
        time_constant: f32,
    ) {
        self.time_constant = time_constant;
    }

    pub fn output(&self) -> f32 {
        self.output
    }

    pub fn time_constant(&self) -> f32 {
        self.time_constant
    }
}
