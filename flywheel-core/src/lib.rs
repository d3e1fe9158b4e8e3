//! Encoder-driven flywheel speed control for cooperative embassy tasks on
//! no-std embedded platforms.
//!
//! For a runnable host simulation, see the `flywheel-app/mock-mcu` binary.
#![cfg_attr(not(test), no_std)]

pub mod utils;
