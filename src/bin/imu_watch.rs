// Bring-up utility: initializes the configured IMU and prints conditioned
// samples until interrupted.

use std::path::PathBuf;
use std::thread::sleep;
use std::time::Duration;

use canonical_error::CanonicalError;
use pico_args::Arguments;

use carriage_stabilizer::config::{Config, ImuModel};
use carriage_stabilizer::imu_conditioner::ImuConditioner;
use carriage_stabilizer::imu_transport::ImuTransport;
use carriage_stabilizer::lsm6ds3tr::Lsm6ds3tr;
use carriage_stabilizer::mpu6050::Mpu6050;

fn main() -> Result<(), CanonicalError> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();

    let mut pargs = Arguments::from_env();
    let config_path: PathBuf = pargs.value_from_str("--config")
        .unwrap_or(PathBuf::from("./flc_config.toml"));
    let config = Config::load(&config_path)?;
    let params = &config.params;

    let transport: Box<dyn ImuTransport + Send> = match params.imu_model {
        ImuModel::Lsm6ds3tr =>
            Box::new(Lsm6ds3tr::new(params.i2c_bus, params.i2c_addr)?),
        ImuModel::Mpu6050 =>
            Box::new(Mpu6050::new(params.i2c_bus, params.i2c_addr)?),
    };
    log::info!("IMU found and initialized");

    let mut conditioner = ImuConditioner::new(transport, &config)?;
    let period = Duration::from_secs_f64(1.0 / config.iir.sample_rate_hz);
    loop {
        let (theta_n, omega_n) = conditioner.read_normalized()?;
        log::info!("theta_n={:+.4} ({:+.3} rad)  omega_n={:+.4} ({:+.3} rad/s)",
                   theta_n, theta_n * params.theta_range_rad,
                   omega_n, omega_n * params.gyro_full_scale_rads_s);
        sleep(period);
    }
}
