//! Control laws turning the flywheel's speed error into a drive action.
//!
//! Every law sees the error as `measured - target`, so a wheel running below
//! its target has a negative error. Gains carry whatever sign the motor wiring
//! needs; only [`ControllerKind::BangBang`] fixes its own output range.

use serde::{Deserialize, Serialize};

/// Which law drives the flywheel, with its tuning.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerKind {
    /// `action += dt * gain * error`, using the setup's `gain`.
    #[default]
    Integrating,
    /// Proportional, integral and derivative terms on the error. The
    /// derivative term uses the rate of change of the measured speed.
    Pid { kp: f32, ki: f32, kd: f32 },
    /// Integrating law that halves back toward the last crossing value each
    /// time the error changes sign. `approx` seeds that value whenever the
    /// target changes.
    TakeBackHalf { gain: f32, approx: f32 },
    /// Full drive (`1.0`) below target, none (`0.0`) at or above it.
    BangBang,
}

/// A control law together with the state it carries between updates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedLaw {
    kind: ControllerKind,
    gain: f32,
    integral: f32,
    last_error: f32,
    take_back: f32,
}

impl SpeedLaw {
    /// `gain` is the integrating gain, used by [`ControllerKind::Integrating`].
    pub fn new(
        kind: ControllerKind,
        gain: f32,
    ) -> Self {
        let mut law = Self {
            kind,
            gain,
            integral: 0.0,
            last_error: 0.0,
            take_back: 0.0,
        };
        law.retarget();
        law
    }

    pub fn kind(&self) -> ControllerKind {
        self.kind
    }

    /// Switch to another law. The new law starts from fresh state.
    pub fn switch(
        &mut self,
        kind: ControllerKind,
    ) {
        *self = Self::new(kind, self.gain);
    }

    /// The target changed; forget anything tied to the old one.
    pub fn retarget(&mut self) {
        self.last_error = 0.0;
        if let ControllerKind::TakeBackHalf { approx, .. } = self.kind {
            self.take_back = approx;
        }
    }

    /// Next action, given the previous one and the latest measurements.
    pub fn update(
        &mut self,
        action: f32,
        error: f32,
        derivative: f32,
        dt: f32,
    ) -> f32 {
        let next = match self.kind {
            ControllerKind::Integrating => action + dt * self.gain * error,
            ControllerKind::Pid { kp, ki, kd } => {
                if dt > 0.0 {
                    self.integral += error * dt;
                }
                kp * error + ki * self.integral + kd * derivative
            }
            ControllerKind::TakeBackHalf { gain, .. } => {
                let mut next = action + dt * gain * error;
                if error * self.last_error < 0.0 {
                    next = 0.5 * (next + self.take_back);
                    self.take_back = next;
                }
                next
            }
            ControllerKind::BangBang => {
                if error < 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        };
        self.last_error = error;
        next
    }
}
