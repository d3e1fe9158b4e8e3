use clap::Parser;
use embassy_executor::{Executor, Spawner};
use embassy_time::{Duration, Instant, Timer};
use flywheel_core::mk_static;
use flywheel_core::utils::controllers::{
    ControllerKind, Encoder, EncoderPorts, Flywheel, FlywheelHandle, FlywheelSetup, FlywheelShared,
    FlywheelStatus, FlywheelTuning, Priority, TaskPriority,
};
use flywheel_core::utils::EmbassyClock;
use static_cell::StaticCell;
use tracing::{error, info, warn};

#[derive(Parser)]
#[clap(version = "1.0")]
struct Opts {
    /// Flywheel setup as JSON (defaults to a direct drive, 360 tick encoder)
    #[clap(long)]
    setup: Option<String>,
    /// Control law to switch to once running, as JSON (e.g. `"bang_bang"`)
    #[clap(long)]
    controller: Option<String>,
    /// Speed the simulated wheel spins at, in flywheel rpm
    #[clap(long, default_value_t = 60.0)]
    wheel_rpm: f32,
    /// Target speeds to request one after another, in rpm
    #[clap(long = "target", default_values_t = [60.0])]
    targets: Vec<f32>,
    /// Seconds to hold each target before requesting the next
    #[clap(long, default_value_t = 5)]
    hold_secs: u64,
    /// Exit after this many seconds instead of running forever
    #[clap(long)]
    run_secs: Option<u64>,
    /// Print the controller status as JSON lines
    #[clap(long)]
    json: bool,
    /// Minimum interval between status reports, in milliseconds
    #[clap(long, default_value_t = 500)]
    report_ms: u64,
}

const DEFAULT_SETUP: FlywheelSetup = FlywheelSetup {
    gearing: 1.0,
    gain: 0.01,
    smoothing: 0.5,
    encoder_port_top: 1,
    encoder_port_bottom: 2,
    encoder_reverse: false,
    ticks_per_revolution: 360.0,
    controller: ControllerKind::Integrating,
};

/// Encoder on a wheel spinning at a constant speed since it was attached.
struct SimEncoder {
    started: Instant,
    ticks_per_second: f32,
}

impl Encoder for SimEncoder {
    fn count(&mut self) -> i32 {
        let seconds = self.started.elapsed().as_micros() as f32 / 1_000_000.0;
        (seconds * self.ticks_per_second) as i32
    }
}

struct SimPorts {
    ticks_per_second: f32,
}

impl EncoderPorts for SimPorts {
    type Encoder = SimEncoder;

    fn attach(
        &mut self,
        top: u8,
        bottom: u8,
    ) -> Self::Encoder {
        info!(top, bottom, "encoder attached");
        SimEncoder {
            started: Instant::now(),
            ticks_per_second: self.ticks_per_second,
        }
    }
}

/// The std executor has no task priorities, so requests are only logged.
struct LoggedPriority;

impl TaskPriority for LoggedPriority {
    fn set_priority(
        &mut self,
        priority: Priority,
    ) {
        info!(priority = priority.0, "flywheel task priority");
    }
}

type SimFlywheel = Flywheel<'static, SimEncoder, EmbassyClock, LoggedPriority>;

#[embassy_executor::task]
async fn flywheel_task(
    mut flywheel: SimFlywheel,
    json: bool,
    report: Duration,
) {
    let mut last_report: Option<Instant> = None;
    let result = flywheel
        .run_with(|status| {
            let due = last_report.is_none_or(|at| at.elapsed() >= report);
            if due {
                last_report = Some(Instant::now());
                report_status(status, json);
            }
        })
        .await;

    if let Err(e) = result {
        error!(%e, "flywheel control loop halted");
        std::process::exit(1);
    }
}

#[embassy_executor::task]
async fn operator_task(
    handle: FlywheelHandle<'static>,
    controller: Option<ControllerKind>,
    targets: Vec<f32>,
    hold: Duration,
) {
    if let Some(kind) = controller {
        info!(controller = ?kind, "requesting controller");
        handle.set_controller(kind);
    }
    for rpm in targets {
        info!(rpm, "requesting target");
        if let Err(e) = handle.set_target(rpm).await {
            error!(%e, "failed to set target");
        }
        Timer::after(hold).await;
    }
    info!("target sequence finished");
}

#[embassy_executor::task]
async fn shutdown_task(after: Duration) {
    Timer::after(after).await;
    info!("run time elapsed, exiting");
    std::process::exit(0);
}

fn report_status(
    status: &FlywheelStatus,
    json: bool,
) {
    if json {
        match serde_json::to_string(status) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("failed to serialize status: {:?}", e),
        }
    } else {
        info!(
            mode = ?status.mode,
            target = status.target,
            measured = status.measured,
            error = status.error,
            action = status.action,
            "flywheel status"
        );
    }
}

#[embassy_executor::task]
async fn main_task(
    spawner: Spawner,
    opts: Opts,
    setup: FlywheelSetup,
    controller: Option<ControllerKind>,
) {
    let shared: &'static FlywheelShared =
        mk_static!(FlywheelShared, FlywheelShared::new(FlywheelTuning::DEFAULT));
    let tuning = shared.tuning();
    info!(
        active_ms = tuning.active_delay.as_millis(),
        ready_ms = tuning.ready_delay.as_millis(),
        check_ready_period = tuning.check_ready_period,
        "flywheel tuning"
    );

    // encoder revolutions are flywheel revolutions divided by the gearing
    let ticks_per_second =
        opts.wheel_rpm / 60.0 / setup.gearing * setup.ticks_per_revolution;
    let mut ports = SimPorts { ticks_per_second };
    let flywheel = Flywheel::new(&setup, shared, &mut ports, EmbassyClock, LoggedPriority);
    let handle = flywheel.handle();

    let report = Duration::from_millis(opts.report_ms);
    if let Err(e) = spawner.spawn(flywheel_task(flywheel, opts.json, report)) {
        error!("failed to spawn flywheel task: {:?}", e);
        return;
    }

    let hold = Duration::from_secs(opts.hold_secs);
    if let Err(e) = spawner.spawn(operator_task(handle, controller, opts.targets, hold)) {
        error!("failed to spawn operator task: {:?}", e);
    }

    if let Some(secs) = opts.run_secs {
        if let Err(e) = spawner.spawn(shutdown_task(Duration::from_secs(secs))) {
            error!("failed to spawn shutdown task: {:?}", e);
        }
    }
}

static EXECUTOR: StaticCell<Executor> = StaticCell::new();

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opts: Opts = Opts::parse();
    let setup = match opts.setup.as_deref() {
        Some(json) => match serde_json::from_str::<FlywheelSetup>(json) {
            Ok(setup) => setup,
            Err(e) => {
                error!("invalid flywheel setup: {}", e);
                std::process::exit(2);
            }
        },
        None => DEFAULT_SETUP,
    };
    let controller = match opts.controller.as_deref() {
        Some(json) => match serde_json::from_str::<ControllerKind>(json) {
            Ok(kind) => Some(kind),
            Err(e) => {
                error!("invalid controller: {}", e);
                std::process::exit(2);
            }
        },
        None => None,
    };

    let executor = EXECUTOR.init(Executor::new());
    executor.run(|spawner| {
        if let Err(e) = spawner.spawn(main_task(spawner, opts, setup, controller)) {
            error!("failed to spawn main task: {:?}", e);
        }
    });
}
