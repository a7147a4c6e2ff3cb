// Offline closed-loop simulation: steps the carriage plant against the
// production fuzzy controller and writes a CSV time series to stdout for
// external plotting tools.

use std::path::PathBuf;

use canonical_error::CanonicalError;
use pico_args::Arguments;

use carriage_stabilizer::config::Config;
use carriage_stabilizer::controller::FlcController;
use carriage_stabilizer::simulator::{CarriageSimulator, MotorParams,
                                     PlantParams};

fn parse_pair(arg: &str) -> Result<(f64, f64), String> {
    let (a, b) = arg.split_once(':')
        .ok_or_else(|| format!("expected <a>:<b>, got '{}'", arg))?;
    let a = a.parse().map_err(|e| format!("{}", e))?;
    let b = b.parse().map_err(|e| format!("{}", e))?;
    Ok((a, b))
}

fn main() -> Result<(), CanonicalError> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("warn")).init();

    let mut pargs = Arguments::from_env();
    let config_path: PathBuf = pargs.value_from_str("--config")
        .unwrap_or(PathBuf::from("./flc_config.toml"));
    let duration: f64 = pargs.value_from_str("--duration").unwrap_or(10.0);
    let dt: f64 = pargs.value_from_str("--dt").unwrap_or(0.002);
    let theta0: f64 = pargs.value_from_str("--theta0").unwrap_or(0.3);
    let omega0: f64 = pargs.value_from_str("--omega0").unwrap_or(0.0);
    // Optional disturbances: "--impulse t0:mag" and "--sine amp:freq".
    let impulse: Option<(f64, f64)> =
        pargs.opt_value_from_fn("--impulse", parse_pair).unwrap_or(None);
    let sine: Option<(f64, f64)> =
        pargs.opt_value_from_fn("--sine", parse_pair).unwrap_or(None);

    let config = Config::load(&config_path)?;
    let flc = FlcController::new(&config);
    let mut sim = CarriageSimulator::new(
        PlantParams::default(), MotorParams::default(), dt);
    if let Some((t0, magnitude)) = impulse {
        sim.perturb.add_impulse(t0, magnitude);
    }
    if let Some((amplitude, freq_hz)) = sine {
        sim.perturb.add_sine(amplitude, freq_hz, 0.0, 0.0, duration);
    }
    sim.reset(theta0, omega0);

    println!("t,theta,omega,motor_cmd");
    let steps = (duration / dt).ceil() as u64;
    for _ in 0..steps {
        let theta_n =
            (sim.theta / config.scaling.theta_max_rad).clamp(-1.0, 1.0);
        let omega_n =
            (sim.omega / config.scaling.omega_max_rad_s).clamp(-1.0, 1.0);
        let motor_cmd = flc.calculate_motor_cmd(theta_n, omega_n)?;
        println!("{:.4},{:.6},{:.6},{:.6}", sim.t, sim.theta, sim.omega,
                 motor_cmd);
        sim.step(motor_cmd);
    }
    Ok(())
}
