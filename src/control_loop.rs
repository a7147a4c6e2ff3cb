use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime};

use canonical_error::{CanonicalError, CanonicalErrorCode,
                      deadline_exceeded_error};
use log::{debug, error, info, warn};
use pico_args::Arguments;
use tracing_appender::non_blocking::NonBlockingBuilder;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry, EnvFilter};

use crate::config::{Config, ImuModel};
use crate::controller::FlcController;
use crate::imu_conditioner::ImuConditioner;
use crate::imu_transport::ImuTransport;
use crate::lsm6ds3tr::Lsm6ds3tr;
use crate::mpu6050::Mpu6050;
use crate::pwm_motor::{DualPwmController, MotorDrive};
use crate::telemetry::{TelemetrySink, TickRecord};

// How long the startup probe waits for the IMU to produce a sample before
// the process gives up (so an init supervisor can restart it).
pub const STARTUP_DEADLINE: Duration = Duration::from_secs(3);

// Tail-end sleep granularity; shutdown requests are honored between slices.
const SLEEP_SLICE: Duration = Duration::from_millis(1);

// Consecutive per-tick failure budgets before the loop gives up.
const MAX_CONSECUTIVE_BUS_ERRORS: u32 = 10;
const MAX_CONSECUTIVE_NOT_READY: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Init,
    Running,
    Stopping,
    Stopped,
}

// The fixed-rate scheduler driving the whole pipeline:
// conditioner -> fuzzy controller -> motor, once per period.
//
// Single-threaded cooperative: this loop is the only mutator of the filter
// state and the motor. Shutdown is requested through `got_signal`.
pub struct ControlLoop {
    conditioner: ImuConditioner,
    controller: FlcController,
    motor: Box<dyn MotorDrive + Send>,
    period: Duration,
    got_signal: Arc<AtomicBool>,
    telemetry: Option<Box<dyn TelemetrySink>>,

    state: LoopState,
    loop_index: u64,
    overrun_count: u64,
}

impl ControlLoop {
    pub fn new(conditioner: ImuConditioner,
               controller: FlcController,
               motor: Box<dyn MotorDrive + Send>,
               loop_freq_hz: f64,
               got_signal: Arc<AtomicBool>) -> Self {
        ControlLoop{
            conditioner,
            controller,
            motor,
            period: Duration::from_secs_f64(1.0 / loop_freq_hz),
            got_signal,
            telemetry: None,
            state: LoopState::Init,
            loop_index: 0,
            overrun_count: 0,
        }
    }

    pub fn set_telemetry_sink(&mut self, sink: Box<dyn TelemetrySink>) {
        self.telemetry = Some(sink);
    }

    pub fn ticks(&self) -> u64 {
        self.loop_index
    }

    pub fn overrun_count(&self) -> u64 {
        self.overrun_count
    }

    // Runs until shutdown is signaled or a fatal error occurs. The motor is
    // commanded to stop on every exit path.
    pub fn run(&mut self) -> Result<(), CanonicalError> {
        info!("Control loop starting: period {:?}", self.period);
        self.set_state(LoopState::Running);
        let result = self.run_ticks();
        self.set_state(LoopState::Stopping);
        if let Err(e) = self.motor.stop() {
            error!("Motor stop failed: {:?}", e);
        }
        self.set_state(LoopState::Stopped);
        match &result {
            Ok(()) => info!("Control loop stopped after {} tick(s), {} overrun(s)",
                            self.loop_index, self.overrun_count),
            Err(e) => error!("Control loop aborted after {} tick(s): {:?}",
                             self.loop_index, e),
        }
        result
    }

    fn set_state(&mut self, next: LoopState) {
        debug!("Scheduler state: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn run_ticks(&mut self) -> Result<(), CanonicalError> {
        // Conditioned state carried across ticks so a transient sensor
        // hiccup reuses the previous (already filtered) values.
        let mut last_norm = (0.0, 0.0);
        let mut consecutive_bus_errors = 0u32;
        let mut consecutive_not_ready = 0u32;

        while !self.got_signal.load(Ordering::Relaxed) {
            let t0 = Instant::now();

            match self.read_with_retry() {
                Ok(norm) => {
                    consecutive_bus_errors = 0;
                    consecutive_not_ready = 0;
                    last_norm = norm;
                }
                Err(e) if e.code == CanonicalErrorCode::DeadlineExceeded => {
                    consecutive_not_ready += 1;
                    warn!("IMU not ready ({} consecutive): {:?}",
                          consecutive_not_ready, e);
                    if consecutive_not_ready >= MAX_CONSECUTIVE_NOT_READY {
                        return Err(e);
                    }
                }
                Err(e) => {
                    consecutive_bus_errors += 1;
                    warn!("IMU bus error ({} consecutive): {:?}",
                          consecutive_bus_errors, e);
                    if consecutive_bus_errors >= MAX_CONSECUTIVE_BUS_ERRORS {
                        return Err(e);
                    }
                }
            }

            let (theta_n, omega_n) = last_norm;
            let (motor_cmd, rule_outputs) =
                self.controller.calculate_with_trace(theta_n, omega_n)?;
            if let Err(e) = self.motor.set_speed(motor_cmd) {
                warn!("Motor command failed, retrying: {:?}", e);
                self.motor.set_speed(motor_cmd)?;
            }

            if let Some(sink) = &self.telemetry {
                sink.record(TickRecord{
                    timestamp: SystemTime::now(),
                    loop_index: self.loop_index,
                    theta_n,
                    omega_n,
                    rule_outputs: Some(rule_outputs),
                    motor_cmd,
                });
            }
            self.loop_index += 1;

            let elapsed = t0.elapsed();
            if elapsed > self.period {
                self.overrun_count += 1;
                warn!("Loop overrun at tick {}: {:?} > {:?}",
                      self.loop_index, elapsed, self.period);
            } else {
                self.sleep_remainder(self.period - elapsed);
            }
        }
        Ok(())
    }

    // A bus-level failure is retried once within the tick; a data-ready
    // timeout is not (the next tick will poll again).
    fn read_with_retry(&mut self) -> Result<(f64, f64), CanonicalError> {
        match self.conditioner.read_normalized() {
            Ok(norm) => Ok(norm),
            Err(e) if e.code == CanonicalErrorCode::DeadlineExceeded => Err(e),
            Err(e) => {
                debug!("Transport error, retrying once: {:?}", e);
                self.conditioner.read_normalized()
            }
        }
    }

    fn sleep_remainder(&self, mut remaining: Duration) {
        while remaining > Duration::ZERO
            && !self.got_signal.load(Ordering::Relaxed) {
            let slice = remaining.min(SLEEP_SLICE);
            sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
    }
}

// Polls the transport until it produces a sample or the deadline elapses.
pub fn wait_for_imu(transport: &mut dyn ImuTransport, deadline: Duration)
                    -> Result<(), CanonicalError> {
    let give_up = Instant::now() + deadline;
    loop {
        match transport.read_all_axes() {
            Ok(_) => {
                info!("IMU ready ({})", transport.model());
                return Ok(());
            }
            Err(e) => {
                if Instant::now() >= give_up {
                    return Err(deadline_exceeded_error(&format!(
                        "IMU not ready within {:?}: {:?}", deadline, e)));
                }
                debug!("IMU probe failed, retrying: {:?}", e);
                sleep(Duration::from_millis(50));
            }
        }
    }
}

// Loads the configuration, brings up the hardware and runs the control loop
// to completion. Returns the process exit code: 0 normal shutdown, 1 startup
// failure, 2 fault while running.
pub fn run_controller(config_path: &Path, got_signal: Arc<AtomicBool>) -> i32 {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Config error: {:?}", e);
            return 1;
        }
    };
    let params = config.params.clone();

    let mut transport: Box<dyn ImuTransport + Send> = match params.imu_model {
        ImuModel::Lsm6ds3tr => {
            match Lsm6ds3tr::new(params.i2c_bus, params.i2c_addr) {
                Ok(imu) => Box::new(imu),
                Err(e) => {
                    error!("LSM6DS3TR-C init failed: {:?}", e);
                    return 1;
                }
            }
        }
        ImuModel::Mpu6050 => {
            match Mpu6050::new(params.i2c_bus, params.i2c_addr) {
                Ok(imu) => Box::new(imu),
                Err(e) => {
                    error!("MPU-6050 init failed: {:?}", e);
                    return 1;
                }
            }
        }
    };
    if let Err(e) = wait_for_imu(transport.as_mut(), STARTUP_DEADLINE) {
        error!("IMU not ready at startup: {:?}", e);
        return 1;
    }

    let conditioner = match ImuConditioner::new(transport, &config) {
        Ok(conditioner) => conditioner,
        Err(e) => {
            error!("IMU conditioner init failed: {:?}", e);
            return 1;
        }
    };
    let controller = FlcController::new(&config);
    let motor = match DualPwmController::new(
        params.pwm_freq_hz, params.min_pwm, params.max_pwm) {
        Ok(motor) => motor,
        Err(e) => {
            error!("PWM init failed: {:?}", e);
            return 1;
        }
    };

    let mut control_loop = ControlLoop::new(
        conditioner, controller, Box::new(motor), params.loop_freq_hz,
        got_signal);
    match control_loop.run() {
        Ok(()) => 0,
        Err(e) => {
            error!("Fatal control fault: {:?}", e);
            2
        }
    }
}

struct AppArgs {
    config: PathBuf,
    log_dir: String,
    log_file: String,
}

// Process entry shared by product binaries: command line, logging, signal
// handling, then run_controller().
pub fn control_main(product_name: &str) {
    const HELP: &str = "\
    FLAGS:
      -h, --help                     Prints help information

    OPTIONS:
      --config <path>                ./flc_config.toml
      --log_dir <path>               .
      --log_file <file>              stabilizer_log.txt
    ";

    let mut pargs = Arguments::from_env();
    if pargs.contains(["-h", "--help"]) {
        println!("{}", HELP);
        std::process::exit(0);
    }
    let args = AppArgs{
        config: pargs.value_from_str("--config")
            .unwrap_or(PathBuf::from("./flc_config.toml")),
        log_dir: pargs.value_from_str("--log_dir")
            .unwrap_or(".".to_string()),
        log_file: pargs.value_from_str("--log_file")
            .unwrap_or("stabilizer_log.txt".to_string()),
    };

    // Set up logging: stdout plus a daily-rotated file. TARGET_MODE=1
    // (production deployment) suppresses everything below error.
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&args.log_file)
        .max_log_files(10)
        .build(&args.log_dir).unwrap();
    let (non_blocking_file, _guard1) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(file_appender);
    let (non_blocking_stdout, _guard2) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stdout());
    let default_filter =
        if std::env::var("TARGET_MODE").map(|v| v == "1").unwrap_or(false) {
            "error"
        } else {
            "info"
        };
    let _subscriber = registry()
        .with(EnvFilter::try_from_default_env()
              .unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(fmt::layer().with_writer(non_blocking_stdout))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking_file))
        .init();

    info!("{} (version {})", product_name, env!("CARGO_PKG_VERSION"));

    // If any thread panics, bail out.
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Thread panicked: {}", panic_info);
        std::process::exit(2);
    }));

    let got_signal = Arc::new(AtomicBool::new(false));
    let got_signal2 = got_signal.clone();
    ctrlc::set_handler(move || {
        if got_signal2.swap(true, Ordering::Relaxed) {
            // Second signal: stop waiting for the loop to wind down.
            std::process::exit(2);
        }
    }).unwrap();

    std::process::exit(run_controller(&args.config, got_signal));
}

// mod tests.
