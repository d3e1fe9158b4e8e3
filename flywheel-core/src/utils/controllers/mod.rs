//! Module Exports
//!
//! - `flywheel`: the closed-loop flywheel speed controller.
//! - `law`: selectable control laws driving the flywheel action.
//! - `encoder`: encoder abstraction the controller reads ticks from.
//! - `scheduler`: task priority control the controller uses on itself.

pub mod encoder;
pub mod flywheel;
pub mod law;
pub mod scheduler;

pub use encoder::{Encoder, EncoderPorts, Oriented};
pub use flywheel::{
    Flywheel, FlywheelError, FlywheelHandle, FlywheelMode, FlywheelSetup, FlywheelShared,
    FlywheelStatus, FlywheelTuning,
};
pub use law::{ControllerKind, SpeedLaw};
pub use scheduler::{Priority, TaskPriority};
