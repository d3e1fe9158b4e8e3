//! Closed-loop flywheel speed control.
//!
//! A flywheel is driven by one dedicated task that owns every working variable:
//! encoder reading, filtered speed, derivative, error and the integrated control
//! action. The only value shared with other tasks is the target speed, which is
//! guarded by its own mutex inside [`FlywheelShared`]. Other tasks talk to the
//! controller through a [`FlywheelHandle`].
//!
//! Measurement pipeline, once per update:
//!
//! ```text
//! encoder delta -> rpm -> low-pass filtered rpm -> derivative
//! error  = measured - target
//! action  = law(action, error, derivative, dt)
//! ```
//!
//! The law defaults to the integrating `action += dt * gain * error`; see
//! [`ControllerKind`] for the others.
//!
//! The controller runs in one of two modes. [`FlywheelMode::Active`] updates
//! quickly at a high task priority while the wheel converges, and
//! [`FlywheelMode::Ready`] updates slowly at a low priority once it has settled.
//! Readiness is re-evaluated every `check_ready_period` updates, and changing the
//! target of a ready flywheel makes it active straight away.

use core::{
    convert::Infallible,
    fmt,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};

use embassy_futures::select::select;
use embassy_sync::{
    blocking_mutex::raw::CriticalSectionRawMutex,
    mutex::{Mutex, MutexGuard},
    signal::Signal,
};
use embassy_time::{with_timeout, Duration, Timer};
use serde::{Deserialize, Serialize};

use super::{
    encoder::{Encoder, EncoderPorts, Oriented},
    law::{ControllerKind, SpeedLaw},
    scheduler::{Priority, TaskPriority},
};
use crate::utils::math::{
    lowpass::LowPass,
    time::{Clock, Stopwatch},
};

const SECONDS_PER_MINUTE: f32 = 60.0;

/// Errors surfaced by the flywheel controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlywheelError {
    /// The target lock was not released within `target_lock_timeout`.
    TargetUnavailable,
}

impl fmt::Display for FlywheelError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            FlywheelError::TargetUnavailable => {
                f.write_str("target unavailable, control loop stalled")
            }
        }
    }
}

/// Setup parameters for one flywheel. Trusted, not validated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlywheelSetup {
    /// Ratio of flywheel rpm per encoder rpm.
    pub gearing: f32,
    /// Gain of the integrating controller.
    pub gain: f32,
    /// Low-pass time constant applied to the measured rpm, in seconds.
    pub smoothing: f32,
    /// Digital port of the encoder's top wire.
    pub encoder_port_top: u8,
    /// Digital port of the encoder's bottom wire.
    pub encoder_port_bottom: u8,
    #[serde(default)]
    pub encoder_reverse: bool,
    #[serde(default = "default_ticks_per_revolution")]
    pub ticks_per_revolution: f32,
    /// Control law to start with.
    #[serde(default)]
    pub controller: ControllerKind,
}

fn default_ticks_per_revolution() -> f32 {
    360.0
}

/// Cadence, priority and tolerance settings shared by every flywheel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlywheelTuning {
    /// Largest |error| (rpm), exclusive, still considered ready.
    pub error_tolerance: f32,
    /// Largest |derivative| (rpm/s), exclusive, still considered ready.
    pub derivative_tolerance: f32,
    pub active_priority: Priority,
    pub ready_priority: Priority,
    pub active_delay: Duration,
    pub ready_delay: Duration,
    /// Number of updates between readiness checks.
    pub check_ready_period: u32,
    /// Upper bound on any wait for the target lock.
    pub target_lock_timeout: Duration,
}

impl FlywheelTuning {
    pub const DEFAULT: Self = Self {
        error_tolerance: 1.0,
        derivative_tolerance: 1.0,
        active_priority: Priority(3),
        ready_priority: Priority(2),
        active_delay: Duration::from_millis(20),
        ready_delay: Duration::from_millis(200),
        check_ready_period: 20,
        target_lock_timeout: Duration::from_millis(100),
    };
}

impl Default for FlywheelTuning {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Controller mode, selecting update cadence and task priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlywheelMode {
    /// Converging: short delay, high priority.
    Active,
    /// Settled on target: long delay, low priority.
    Ready,
}

impl FlywheelMode {
    /// Mode implied by the current error and derivative.
    ///
    /// Ready only when both magnitudes are strictly below their tolerances. A
    /// NaN in either input evaluates as active.
    pub fn evaluate(
        error: f32,
        derivative: f32,
        tuning: &FlywheelTuning,
    ) -> Self {
        let error_ready = libm::fabsf(error) < tuning.error_tolerance;
        let derivative_ready = libm::fabsf(derivative) < tuning.derivative_tolerance;
        if error_ready && derivative_ready {
            FlywheelMode::Ready
        } else {
            FlywheelMode::Active
        }
    }

    pub fn delay(
        self,
        tuning: &FlywheelTuning,
    ) -> Duration {
        match self {
            FlywheelMode::Active => tuning.active_delay,
            FlywheelMode::Ready => tuning.ready_delay,
        }
    }

    pub fn priority(
        self,
        tuning: &FlywheelTuning,
    ) -> Priority {
        match self {
            FlywheelMode::Active => tuning.active_priority,
            FlywheelMode::Ready => tuning.ready_priority,
        }
    }
}

/// State shared between a flywheel's task and the rest of the system.
///
/// Usually placed in a `static` (see [`crate::mk_static!`]). The target has its
/// own mutex; the mode is a flag so a target change can flip it synchronously.
pub struct FlywheelShared {
    target: Mutex<CriticalSectionRawMutex, f32>,
    ready: AtomicBool,
    allow_ready: AtomicBool,
    /// Bumped on every target write, under the target lock.
    generation: AtomicU32,
    wake: Signal<CriticalSectionRawMutex, ()>,
    smoothing: Signal<CriticalSectionRawMutex, f32>,
    controller: Signal<CriticalSectionRawMutex, ControllerKind>,
    tuning: FlywheelTuning,
}

impl FlywheelShared {
    /// Shared state for a stopped flywheel: target 0, ready.
    pub const fn new(tuning: FlywheelTuning) -> Self {
        Self {
            target: Mutex::new(0.0),
            ready: AtomicBool::new(true),
            allow_ready: AtomicBool::new(true),
            generation: AtomicU32::new(0),
            wake: Signal::new(),
            smoothing: Signal::new(),
            controller: Signal::new(),
            tuning,
        }
    }

    pub fn handle(&self) -> FlywheelHandle<'_> {
        FlywheelHandle { shared: self }
    }

    pub fn tuning(&self) -> &FlywheelTuning {
        &self.tuning
    }

    fn mode(&self) -> FlywheelMode {
        if self.ready.load(Ordering::Acquire) {
            FlywheelMode::Ready
        } else {
            FlywheelMode::Active
        }
    }

    fn set_mode(
        &self,
        mode: FlywheelMode,
    ) {
        self.ready
            .store(mode == FlywheelMode::Ready, Ordering::Release);
    }

    /// Make a ready flywheel active and wake its task.
    fn activate(&self) {
        if self.mode() == FlywheelMode::Ready {
            self.set_mode(FlywheelMode::Active);
            self.wake.signal(());
        }
    }

    async fn lock_target(
        &self,
    ) -> Result<MutexGuard<'_, CriticalSectionRawMutex, f32>, FlywheelError> {
        with_timeout(self.tuning.target_lock_timeout, self.target.lock())
            .await
            .map_err(|_| {
                tracing::error!(
                    timeout_ms = self.tuning.target_lock_timeout.as_millis(),
                    "flywheel target lock timed out"
                );
                FlywheelError::TargetUnavailable
            })
    }
}

/// Cheap, copyable access to a flywheel from any task.
#[derive(Clone, Copy)]
pub struct FlywheelHandle<'a> {
    shared: &'a FlywheelShared,
}

impl<'a> FlywheelHandle<'a> {
    /// Set the target speed in rpm.
    ///
    /// A ready flywheel becomes active before this returns, so the faster
    /// cadence is visible immediately; its task picks up the higher priority as
    /// soon as it wakes.
    pub async fn set_target(
        &self,
        rpm: f32,
    ) -> Result<(), FlywheelError> {
        {
            let mut target = self.shared.lock_target().await?;
            *target = rpm;
            self.shared.generation.fetch_add(1, Ordering::AcqRel);
        }
        tracing::debug!(rpm, "flywheel target set");
        self.shared.activate();
        Ok(())
    }

    /// Current target speed in rpm.
    pub async fn target(&self) -> Result<f32, FlywheelError> {
        Ok(*self.shared.lock_target().await?)
    }

    pub fn mode(&self) -> FlywheelMode {
        self.shared.mode()
    }

    /// Delay the controller task sleeps between updates in its current mode.
    pub fn update_delay(&self) -> Duration {
        self.shared.mode().delay(&self.shared.tuning)
    }

    /// Request a new low-pass time constant (seconds). Applied by the
    /// controller task on its next update; the latest request wins.
    pub fn set_smoothing(
        &self,
        time_constant: f32,
    ) {
        self.shared.smoothing.signal(time_constant);
    }

    /// Request a different control law. Applied by the controller task on its
    /// next update, starting the new law from fresh state.
    pub fn set_controller(
        &self,
        kind: ControllerKind,
    ) {
        self.shared.controller.signal(kind);
    }

    /// Allow or forbid the ready mode. Forbidding it activates a ready flywheel.
    pub fn allow_ready(
        &self,
        allow: bool,
    ) {
        self.shared.allow_ready.store(allow, Ordering::Release);
        if !allow {
            self.shared.activate();
        }
    }
}

/// Snapshot of a flywheel's working state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FlywheelStatus {
    pub mode: FlywheelMode,
    /// Target observed by the latest update.
    pub target: f32,
    pub measured: f32,
    pub derivative: f32,
    pub error: f32,
    pub action: f32,
}

/// A flywheel controller, owned and driven by its own task.
pub struct Flywheel<'a, E, C, P> {
    shared: &'a FlywheelShared,
    encoder: Oriented<E>,
    clock: C,
    priority: P,
    stopwatch: Stopwatch,
    filter: LowPass<C>,
    law: SpeedLaw,

    target: f32,
    measured: f32,
    derivative: f32,
    error: f32,
    action: f32,
    reading: i32,
    /// Target generation seen by the latest update.
    generation: u32,

    gearing: f32,
    ticks_per_revolution: f32,

    applied: FlywheelMode,
    ticks: u32,
}

impl<'a, E, C, P> Flywheel<'a, E, C, P>
where
    E: Encoder,
    C: Clock + Clone,
    P: TaskPriority,
{
    /// Attach the encoder, seed the filter and clock, and put the task at the
    /// priority of the current mode (ready for fresh shared state).
    pub fn new<B>(
        setup: &FlywheelSetup,
        shared: &'a FlywheelShared,
        ports: &mut B,
        clock: C,
        mut priority: P,
    ) -> Self
    where
        B: EncoderPorts<Encoder = E>,
    {
        let mut encoder = Oriented::new(
            ports.attach(setup.encoder_port_top, setup.encoder_port_bottom),
            setup.encoder_reverse,
        );
        let reading = encoder.count();

        let applied = shared.mode();
        priority.set_priority(applied.priority(&shared.tuning));

        tracing::info!(
            gearing = setup.gearing,
            gain = setup.gain,
            controller = ?setup.controller,
            smoothing = setup.smoothing,
            top = setup.encoder_port_top,
            bottom = setup.encoder_port_bottom,
            reverse = setup.encoder_reverse,
            "flywheel initialized"
        );

        Self {
            shared,
            encoder,
            stopwatch: Stopwatch::start(&clock),
            filter: LowPass::new(clock.clone(), 0.0, setup.smoothing),
            law: SpeedLaw::new(setup.controller, setup.gain),
            clock,
            priority,
            target: 0.0,
            measured: 0.0,
            derivative: 0.0,
            error: 0.0,
            action: 0.0,
            reading,
            generation: 0,
            gearing: setup.gearing,
            ticks_per_revolution: setup.ticks_per_revolution,
            applied,
            ticks: 0,
        }
    }

    pub fn handle(&self) -> FlywheelHandle<'a> {
        self.shared.handle()
    }

    pub fn mode(&self) -> FlywheelMode {
        self.shared.mode()
    }

    /// Time constant currently used by the speed filter.
    pub fn smoothing(&self) -> f32 {
        self.filter.time_constant()
    }

    pub fn controller(&self) -> ControllerKind {
        self.law.kind()
    }

    pub fn status(&self) -> FlywheelStatus {
        FlywheelStatus {
            mode: self.shared.mode(),
            target: self.target,
            measured: self.measured,
            derivative: self.derivative,
            error: self.error,
            action: self.action,
        }
    }

    /// Run the control loop forever. Only returns if the target lock stalls.
    pub async fn run(&mut self) -> Result<Infallible, FlywheelError> {
        self.run_with(|_| {}).await
    }

    /// Like [`Flywheel::run`], handing the status to `observe` after every step.
    ///
    /// Sleeps for the current mode's delay between steps. A target change that
    /// activates the flywheel cuts the sleep short.
    pub async fn run_with<F>(
        &mut self,
        mut observe: F,
    ) -> Result<Infallible, FlywheelError>
    where
        F: FnMut(&FlywheelStatus),
    {
        loop {
            self.step().await?;
            observe(&self.status());
            let delay = self.shared.mode().delay(&self.shared.tuning);
            select(Timer::after(delay), self.shared.wake.wait()).await;
        }
    }

    /// One iteration of the control loop, without the sleep.
    ///
    /// Applies pending smoothing, controller and priority changes, updates the controller,
    /// and checks readiness every `check_ready_period` calls.
    pub async fn step(&mut self) -> Result<(), FlywheelError> {
        if let Some(time_constant) = self.shared.smoothing.try_take() {
            tracing::debug!(time_constant, "flywheel smoothing adjusted");
            self.filter.adjust(time_constant);
        }
        if let Some(kind) = self.shared.controller.try_take() {
            tracing::info!(controller = ?kind, "flywheel controller switched");
            self.law.switch(kind);
        }
        self.sync_priority();

        self.update().await?;

        self.ticks += 1;
        if self.ticks >= self.shared.tuning.check_ready_period {
            self.ticks = 0;
            self.check_ready();
        }
        Ok(())
    }

    /// Measure the speed and advance the controller by the elapsed time.
    pub async fn update(&mut self) -> Result<(), FlywheelError> {
        let dt = self.stopwatch.lap(&self.clock);
        self.measure(dt);
        self.control(dt).await
    }

    /// Switch between ready and active if the measurements call for it.
    ///
    /// Never becomes ready on an error computed against a target that has
    /// since been replaced.
    pub fn check_ready(&mut self) {
        let current = self.shared.mode();
        let stale = self.shared.generation.load(Ordering::Acquire) != self.generation;
        let next = if !self.shared.allow_ready.load(Ordering::Acquire) || stale {
            FlywheelMode::Active
        } else {
            FlywheelMode::evaluate(self.error, self.derivative, &self.shared.tuning)
        };

        if next != current {
            tracing::info!(
                from = ?current,
                to = ?next,
                error = self.error,
                derivative = self.derivative,
                "flywheel mode changed"
            );
            self.shared.set_mode(next);
        }
        self.sync_priority();
    }

    /// Encoder change -> rpm -> filtered rpm, plus its rate of change.
    fn measure(
        &mut self,
        dt: f32,
    ) {
        let reading = self.encoder.count();
        let delta = reading.wrapping_sub(self.reading);
        self.reading = reading;

        // no time has passed, keep the previous measurement
        if dt <= 0.0 {
            return;
        }

        let rpm =
            delta as f32 / self.ticks_per_revolution * self.gearing * SECONDS_PER_MINUTE / dt;
        let previous = self.measured;
        self.measured = self.filter.update(rpm);
        self.derivative = (self.measured - previous) / dt;

        tracing::trace!(
            delta,
            dt,
            rpm,
            measured = self.measured,
            derivative = self.derivative,
            "flywheel measured"
        );
    }

    /// Error against the current target, then the next action from the law.
    async fn control(
        &mut self,
        dt: f32,
    ) -> Result<(), FlywheelError> {
        let target = {
            let guard = self.shared.lock_target().await?;
            self.generation = self.shared.generation.load(Ordering::Acquire);
            *guard
        };
        if target != self.target {
            self.law.retarget();
        }
        self.target = target;
        self.error = self.measured - target;
        self.action = self
            .law
            .update(self.action, self.error, self.derivative, dt);
        Ok(())
    }

    fn sync_priority(&mut self) {
        let mode = self.shared.mode();
        if mode != self.applied {
            self.priority
                .set_priority(mode.priority(&self.shared.tuning));
            self.applied = mode;
        }
    }
}

#[cfg(test)]
mod tests {
    use core::cell::{Cell, RefCell};

    use embassy_futures::block_on;
    // std pender for the embassy time driver
    use embassy_executor as _;

    use super::*;
    use crate::utils::math::time::ManualClock;

    struct Ticks<'a>(&'a Cell<i32>);

    impl Encoder for Ticks<'_> {
        fn count(&mut self) -> i32 {
            self.0.get()
        }
    }

    struct Ports<'a>(&'a Cell<i32>);

    impl<'a> EncoderPorts for Ports<'a> {
        type Encoder = Ticks<'a>;

        fn attach(
            &mut self,
            _top: u8,
            _bottom: u8,
        ) -> Self::Encoder {
            Ticks(self.0)
        }
    }

    struct Recorder<'a>(&'a RefCell<Vec<Priority>>);

    impl TaskPriority for Recorder<'_> {
        fn set_priority(
            &mut self,
            priority: Priority,
        ) {
            self.0.borrow_mut().push(priority);
        }
    }

    const SETUP: FlywheelSetup = FlywheelSetup {
        gearing: 1.0,
        gain: 0.01,
        smoothing: 0.5,
        encoder_port_top: 1,
        encoder_port_bottom: 2,
        encoder_reverse: false,
        ticks_per_revolution: 360.0,
        controller: ControllerKind::Integrating,
    };

    #[test]
    fn test_evaluate_inside_and_outside_error_tolerance() {
        let t = FlywheelTuning::DEFAULT;
        assert_eq!(FlywheelMode::evaluate(0.999, 0.0, &t), FlywheelMode::Ready);
        assert_eq!(FlywheelMode::evaluate(-0.999, 0.0, &t), FlywheelMode::Ready);
        assert_eq!(FlywheelMode::evaluate(1.0, 0.0, &t), FlywheelMode::Active);
        assert_eq!(FlywheelMode::evaluate(-1.0, 0.0, &t), FlywheelMode::Active);
        assert_eq!(FlywheelMode::evaluate(1.001, 0.0, &t), FlywheelMode::Active);
    }

    #[test]
    fn test_evaluate_inside_and_outside_derivative_tolerance() {
        let t = FlywheelTuning::DEFAULT;
        assert_eq!(FlywheelMode::evaluate(0.0, 0.999, &t), FlywheelMode::Ready);
        assert_eq!(FlywheelMode::evaluate(0.0, -0.999, &t), FlywheelMode::Ready);
        assert_eq!(FlywheelMode::evaluate(0.0, 1.0, &t), FlywheelMode::Active);
        assert_eq!(FlywheelMode::evaluate(0.0, -1.0, &t), FlywheelMode::Active);
    }

    #[test]
    fn test_evaluate_both_at_boundary_is_active() {
        let t = FlywheelTuning::DEFAULT;
        assert_eq!(FlywheelMode::evaluate(1.0, 1.0, &t), FlywheelMode::Active);
        assert_eq!(FlywheelMode::evaluate(-1.0, -1.0, &t), FlywheelMode::Active);
        assert_eq!(FlywheelMode::evaluate(f32::NAN, 0.0, &t), FlywheelMode::Active);
        assert_eq!(FlywheelMode::evaluate(0.0, f32::NAN, &t), FlywheelMode::Active);
    }

    #[test]
    fn test_mode_delay_and_priority() {
        let t = FlywheelTuning::DEFAULT;
        assert_eq!(FlywheelMode::Active.delay(&t), Duration::from_millis(20));
        assert_eq!(FlywheelMode::Ready.delay(&t), Duration::from_millis(200));
        assert!(FlywheelMode::Active.priority(&t) > FlywheelMode::Ready.priority(&t));
    }

    #[test]
    fn test_check_ready_flips_every_time_without_hysteresis() {
        let shared = FlywheelShared::new(FlywheelTuning::DEFAULT);
        let ticks = Cell::new(0);
        let clock = ManualClock::new(0);
        let priorities = RefCell::new(Vec::new());
        let mut fw = Flywheel::new(
            &SETUP,
            &shared,
            &mut Ports(&ticks),
            &clock,
            Recorder(&priorities),
        );

        fw.error = 1.0;
        fw.check_ready();
        assert_eq!(fw.mode(), FlywheelMode::Active);

        fw.error = 0.99;
        fw.check_ready();
        assert_eq!(fw.mode(), FlywheelMode::Ready);

        fw.error = -1.0;
        fw.check_ready();
        assert_eq!(fw.mode(), FlywheelMode::Active);

        fw.error = 0.0;
        fw.derivative = 1.0;
        fw.check_ready();
        assert_eq!(fw.mode(), FlywheelMode::Active);

        fw.derivative = -0.5;
        fw.check_ready();
        assert_eq!(fw.mode(), FlywheelMode::Ready);

        assert_eq!(
            *priorities.borrow(),
            [
                Priority(2),
                Priority(3),
                Priority(2),
                Priority(3),
                Priority(2)
            ]
        );
    }

    #[test]
    fn test_set_target_signals_the_task() {
        let shared = FlywheelShared::new(FlywheelTuning::DEFAULT);
        assert!(!shared.wake.signaled());
        block_on(shared.handle().set_target(50.0)).unwrap();
        assert!(shared.wake.signaled());
        assert_eq!(block_on(shared.handle().target()), Ok(50.0));
    }

    #[test]
    fn test_set_target_times_out_while_lock_is_held() {
        let shared = FlywheelShared::new(FlywheelTuning {
            target_lock_timeout: Duration::from_millis(10),
            ..FlywheelTuning::DEFAULT
        });
        let handle = shared.handle();

        let guard = block_on(shared.target.lock());
        assert_eq!(
            block_on(handle.set_target(10.0)),
            Err(FlywheelError::TargetUnavailable)
        );
        // a failed write does not touch the mode
        assert_eq!(handle.mode(), FlywheelMode::Ready);
        drop(guard);

        assert_eq!(block_on(handle.set_target(10.0)), Ok(()));
        assert_eq!(handle.mode(), FlywheelMode::Active);
    }

    #[test]
    fn test_run_stops_when_target_lock_stalls() {
        let shared = FlywheelShared::new(FlywheelTuning {
            target_lock_timeout: Duration::from_millis(10),
            ..FlywheelTuning::DEFAULT
        });
        let ticks = Cell::new(0);
        let clock = ManualClock::new(0);
        let priorities = RefCell::new(Vec::new());
        let mut fw = Flywheel::new(
            &SETUP,
            &shared,
            &mut Ports(&ticks),
            &clock,
            Recorder(&priorities),
        );

        let _guard = block_on(shared.target.lock());
        assert_eq!(block_on(fw.run()), Err(FlywheelError::TargetUnavailable));
    }

    #[test]
    fn test_error_display() {
        let text = format!("{}", FlywheelError::TargetUnavailable);
        assert!(text.contains("stalled"));
    }
}
