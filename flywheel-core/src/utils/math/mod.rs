//! Math utilities for the flywheel controller.
//!
//! This module provides the time source adapter and the low-pass filter used by
//! the measurement pipeline.

pub mod lowpass;
pub mod time;
