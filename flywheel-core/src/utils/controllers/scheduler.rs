//! Task priority control offered by the runtime.
//!
//! The flywheel task raises its own priority while converging and lowers it
//! once settled. Only the owning task ever calls into this.

/// Scheduler priority level. Higher values run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(pub u8);

/// Handle to the task running a controller, able to change its priority.
pub trait TaskPriority {
    fn set_priority(
        &mut self,
        priority: Priority,
    );
}

impl<T: TaskPriority + ?Sized> TaskPriority for &mut T {
    fn set_priority(
        &mut self,
        priority: Priority,
    ) {
        (**self).set_priority(priority)
    }
}
