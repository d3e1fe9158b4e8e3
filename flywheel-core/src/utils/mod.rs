//! Utility re-exports and helper macros for the flywheel controller.
//!
//! - `controllers`: the flywheel controller and the encoder and scheduler
//!   abstractions it consumes
//! - `math`: time source adapter and low-pass filter
//!
//! The `mk_static!` macro simplifies static initialization in no-std contexts.

pub mod controllers;
pub mod math;

pub use controllers::{Flywheel, FlywheelHandle, FlywheelSetup, FlywheelShared, FlywheelTuning};
pub use math::{lowpass::LowPass, time::EmbassyClock};
#[doc(hidden)]
pub use static_cell::StaticCell;

#[macro_export]
/// Initialize a no-std static cell and write the given value into it.
///
/// This macro creates a `static_cell::StaticCell` for type `$t` and initializes
/// it with `$val`, returning a mutable reference to the stored value.
macro_rules! mk_static {
    ($t:ty, $val:expr) => {{
        static STATIC_CELL: $crate::utils::StaticCell<$t> = $crate::utils::StaticCell::new();
        STATIC_CELL.uninit().write($val)
    }};
}
