use std::time::Instant;

use canonical_error::CanonicalError;
use log::{debug, info};

use crate::config::{Config, RateAxis, TiltPlane};
use crate::imu_transport::{ImuTransport, RawSample};

// Full scale of the normalized gyro channel, in raw LSB.
pub const OMEGA_FS_LSB: f64 = 32768.0;

// Soft saturation: linear near zero, asymptotic at ±fs. Avoids the flat-top
// bias a hard clip would feed into atan2.
pub(crate) fn soft_clip(v: f64, fs: f64) -> f64 {
    fs * (v / fs).tanh()
}

// First-order low-pass coefficient for a given sample rate and cutoff.
fn lowpass_alpha(sample_rate_hz: f64, cutoff_hz: f64) -> f64 {
    let dt = 1.0 / sample_rate_hz;
    let rc = 1.0 / (2.0 * std::f64::consts::PI * cutoff_hz);
    dt / (rc + dt)
}

// Turns raw six-axis samples into normalized (theta, omega), each in
// [-1, +1]. Owns all filter state; single-threaded use only.
pub struct ImuConditioner {
    transport: Box<dyn ImuTransport + Send>,

    tilt_plane: TiltPlane,
    rate_axis: RateAxis,
    theta_range_rad: f64,
    accel_raw_fs: f64,
    accel_1g_raw: f64,
    gyro_lsb_per_dps: f64,
    use_complementary: bool,
    comp_alpha: f64,
    accel_mag_tol_g: f64,

    // Derived once at construction; both in (0, 1).
    alpha_accel: f64,
    alpha_omega: f64,

    // Low-pass state for the two tilt-plane accel axes (LSB units).
    num_lp: f64,
    den_lp: f64,

    // Low-pass state for the bias-corrected rate channel (LSB units).
    omega_filt: f64,

    // Constant after the calibration phase.
    gyro_bias: f64,

    // Complementary-filter accumulator.
    theta_est: f64,
    last_update: Option<Instant>,
}

impl ImuConditioner {
    // Takes ownership of the transport. When bias calibration is enabled the
    // carriage must be stationary for the duration of this call; the
    // calibration samples are discarded and filter state starts from zero.
    pub fn new(transport: Box<dyn ImuTransport + Send>, config: &Config)
               -> Result<Self, CanonicalError> {
        let alpha_accel = lowpass_alpha(config.iir.sample_rate_hz,
                                        config.iir.accel_cutoff_hz);
        let alpha_omega = lowpass_alpha(config.iir.sample_rate_hz,
                                        config.iir.omega_cutoff_hz);
        let params = &config.params;
        let mut conditioner = ImuConditioner{
            transport,
            tilt_plane: params.tilt_plane,
            rate_axis: params.rate_axis,
            theta_range_rad: params.theta_range_rad,
            accel_raw_fs: params.accel_raw_fs,
            accel_1g_raw: params.accel_1g_raw,
            gyro_lsb_per_dps: params.gyro_lsb_per_dps,
            use_complementary: params.use_complementary,
            comp_alpha: params.comp_alpha,
            accel_mag_tol_g: params.accel_mag_tol_g,
            alpha_accel,
            alpha_omega,
            num_lp: 0.0,
            den_lp: 0.0,
            omega_filt: 0.0,
            gyro_bias: 0.0,
            theta_est: 0.0,
            last_update: None,
        };
        info!("IMU conditioner: {} tilt={:?} rate={:?} alpha_accel={:.4} \
               alpha_omega={:.4}",
              conditioner.transport.model(), conditioner.tilt_plane,
              conditioner.rate_axis, alpha_accel, alpha_omega);
        if params.do_gyro_bias_cal {
            conditioner.calibrate_gyro_bias(params.gyro_bias_samples)?;
        }
        Ok(conditioner)
    }

    // Averages the rate channel over `samples` reads. The data-ready gate in
    // the transport paces the loop at the device output rate.
    fn calibrate_gyro_bias(&mut self, samples: usize) -> Result<(), CanonicalError> {
        let mut sum = 0.0;
        for _ in 0..samples {
            let sample = self.transport.read_all_axes()?;
            sum += self.rate_raw(&sample);
        }
        self.gyro_bias = sum / samples as f64;
        // Calibration samples are discarded.
        self.num_lp = 0.0;
        self.den_lp = 0.0;
        self.omega_filt = 0.0;
        self.theta_est = 0.0;
        self.last_update = None;
        info!("Gyro bias calibrated over {} samples: {:.2} LSB",
              samples, self.gyro_bias);
        Ok(())
    }

    // Reads one sample and returns normalized (theta, omega). Transport
    // errors propagate; the conditioning itself cannot fail.
    pub fn read_normalized(&mut self) -> Result<(f64, f64), CanonicalError> {
        let sample = self.transport.read_all_axes()?;
        Ok(self.condition(&sample, Instant::now()))
    }

    fn condition(&mut self, sample: &RawSample, now: Instant) -> (f64, f64) {
        let (raw_num, raw_den) = match self.tilt_plane {
            TiltPlane::Xz => (sample.ax, sample.az),
            TiltPlane::Yz => (sample.ay, sample.az),
        };
        self.num_lp += self.alpha_accel
            * (soft_clip(raw_num as f64, self.accel_raw_fs) - self.num_lp);
        self.den_lp += self.alpha_accel
            * (soft_clip(raw_den as f64, self.accel_raw_fs) - self.den_lp);
        self.omega_filt += self.alpha_omega
            * ((self.rate_raw(sample) - self.gyro_bias) - self.omega_filt);

        let theta_acc = match self.tilt_plane {
            TiltPlane::Xz => self.num_lp.atan2(-self.den_lp),
            TiltPlane::Yz => self.num_lp.atan2(self.den_lp),
        };
        let theta = if self.use_complementary {
            let dt = match self.last_update {
                Some(last) => now.duration_since(last).as_secs_f64(),
                None => 0.0,
            };
            self.last_update = Some(now);
            let accel_mag_g = ((sample.ax as f64).powi(2)
                               + (sample.ay as f64).powi(2)
                               + (sample.az as f64).powi(2)).sqrt()
                / self.accel_1g_raw;
            self.blend_theta(theta_acc, dt, accel_mag_g)
        } else {
            theta_acc
        };

        let theta_n = (theta / self.theta_range_rad).clamp(-1.0, 1.0);
        let omega_n = (self.omega_filt / OMEGA_FS_LSB).clamp(-1.0, 1.0);
        debug!("theta={:.4} rad theta_n={:.4} omega_n={:.4}",
               theta, theta_n, omega_n);
        (theta_n, omega_n)
    }

    // Complementary blend of integrated gyro rate and accelerometer tilt.
    // When the accel magnitude strays from 1 g the accelerometer is seeing
    // non-gravity acceleration and the gyro is trusted alone for this sample.
    fn blend_theta(&mut self, theta_acc: f64, dt: f64, accel_mag_g: f64) -> f64 {
        if dt <= 0.0 {
            // First sample; seed from the absolute reference.
            self.theta_est = theta_acc;
            return self.theta_est;
        }
        let omega_rad_s =
            (self.omega_filt / self.gyro_lsb_per_dps).to_radians();
        let theta_gyro = self.theta_est + omega_rad_s * dt;
        let alpha = if (accel_mag_g - 1.0).abs() <= self.accel_mag_tol_g {
            self.comp_alpha
        } else {
            1.0
        };
        self.theta_est = alpha * theta_gyro + (1.0 - alpha) * theta_acc;
        self.theta_est
    }

    fn rate_raw(&self, sample: &RawSample) -> f64 {
        (match self.rate_axis {
            RateAxis::X => sample.gx,
            RateAxis::Y => sample.gy,
            RateAxis::Z => sample.gz,
        }) as f64
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use std::time::Duration;
    use super::*;
    use crate::config::Config;
    use crate::simulator::ScriptedImu;

    fn test_config(theta_range: f64) -> Config {
        let mut config =
            Config::from_toml_str(include_str!("../flc_config.toml")).unwrap();
        config.params.theta_range_rad = theta_range;
        config.params.do_gyro_bias_cal = false;
        config.params.use_complementary = false;
        config
    }

    fn conditioner_with(samples: Vec<RawSample>, config: &Config) -> ImuConditioner {
        ImuConditioner::new(Box::new(ScriptedImu::new(samples)), config).unwrap()
    }

    fn sample(ax: i32, az: i32, gy: i32) -> RawSample {
        RawSample{ax, ay: 0, az, gx: 0, gy, gz: 0}
    }

    #[test]
    fn test_upright_and_still() {
        let config = test_config(std::f64::consts::PI);
        let mut c = conditioner_with(vec![sample(0, -16384, 0)], &config);
        let (theta_n, omega_n) = c.read_normalized().unwrap();
        assert_abs_diff_eq!(theta_n, 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(omega_n, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_quarter_tilt_reads_quarter_range() {
        // +45° tilt with THETA_RANGE_RAD = pi. Both axes pass through the
        // same soft clip and low-pass, so the atan2 ratio is exact from the
        // first sample.
        let config = test_config(std::f64::consts::PI);
        let a = (std::f64::consts::FRAC_PI_4.sin() * 16384.0) as i32;
        let mut c = conditioner_with(vec![sample(a, -a, 0)], &config);
        let (theta_n, omega_n) = c.read_normalized().unwrap();
        assert_abs_diff_eq!(theta_n, 0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(omega_n, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_ninety_degree_tilt_with_half_pi_range() {
        let config = test_config(std::f64::consts::FRAC_PI_2);
        let samples = vec![sample(16384, 0, 0); 50];
        let mut c = conditioner_with(samples, &config);
        let mut theta_n = 0.0;
        for _ in 0..50 {
            theta_n = c.read_normalized().unwrap().0;
        }
        assert!(theta_n > 0.9);
    }

    #[test]
    fn test_theta_clamped_at_range() {
        // Inverted carriage reads pi; with a half-pi range it clamps to 1.
        let config = test_config(std::f64::consts::FRAC_PI_2);
        let mut c = conditioner_with(vec![sample(0, 16384, 0); 5], &config);
        let mut theta_n = 0.0;
        for _ in 0..5 {
            theta_n = c.read_normalized().unwrap().0;
        }
        assert_eq!(theta_n, 1.0);
    }

    #[test]
    fn test_omega_saturates_beyond_full_scale() {
        // A rate beyond the 16-bit full scale clamps to exactly +1 once the
        // low-pass has converged.
        let config = test_config(std::f64::consts::PI);
        let mut c = conditioner_with(vec![sample(0, -16384, 40_000); 20], &config);
        let mut omega_n = 0.0;
        for _ in 0..20 {
            omega_n = c.read_normalized().unwrap().1;
        }
        assert_eq!(omega_n, 1.0);
    }

    #[test]
    fn test_lowpass_step_response() {
        // After k samples of a unit step the filter reads 1 - (1 - alpha)^k.
        let config = test_config(std::f64::consts::PI);
        let alpha = lowpass_alpha(config.iir.sample_rate_hz,
                                  config.iir.omega_cutoff_hz);
        let step = 1000.0;
        let mut c = conditioner_with(vec![sample(0, -16384, 1000); 8], &config);
        for k in 1..=8 {
            let (_, omega_n) = c.read_normalized().unwrap();
            let expected = step * (1.0 - (1.0 - alpha).powi(k)) / OMEGA_FS_LSB;
            assert_abs_diff_eq!(omega_n, expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_gyro_bias_calibration_zeroes_omega() {
        let mut config = test_config(std::f64::consts::PI);
        config.params.do_gyro_bias_cal = true;
        config.params.gyro_bias_samples = 10;
        // 10 calibration samples plus the reads under test, all at GY=+100.
        let mut c = conditioner_with(vec![sample(0, -16384, 100); 15], &config);
        for _ in 0..5 {
            let (_, omega_n) = c.read_normalized().unwrap();
            assert_abs_diff_eq!(omega_n, 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_complementary_rejects_non_gravity_accel() {
        // Second sample has a bogus accel magnitude; the blend must force
        // alpha=1 and track the integrated gyro rate instead of the
        // accelerometer's (wild) tilt.
        let mut config = test_config(std::f64::consts::FRAC_PI_2);
        config.params.use_complementary = true;
        config.params.comp_alpha = 0.5;
        config.params.accel_mag_tol_g = 0.05;
        let mut c = conditioner_with(
            vec![sample(0, -16384, 0), sample(32_000, -32_000, 1000)], &config);
        let t0 = Instant::now();
        let dt = 0.01;

        let s = c.transport.read_all_axes().unwrap();
        c.condition(&s, t0);  // Seeds theta_est near 0.
        let s = c.transport.read_all_axes().unwrap();
        let (theta_n, _) = c.condition(&s, t0 + Duration::from_millis(10));

        let omega_lsb = c.omega_filt;
        let omega_rad_s = (omega_lsb / config.params.gyro_lsb_per_dps).to_radians();
        let expected = omega_rad_s * dt / std::f64::consts::FRAC_PI_2;
        assert!(theta_n < 0.2);
        assert_abs_diff_eq!(theta_n, expected, epsilon = 0.05);
    }

    #[test]
    fn test_complementary_blends_toward_accel_when_stationary() {
        let mut config = test_config(std::f64::consts::FRAC_PI_2);
        config.params.use_complementary = true;
        config.params.comp_alpha = 0.5;
        // Stationary at +45°: accel magnitude is 1 g, so each sample blends
        // half of the accel tilt in and theta converges to it.
        let a = (std::f64::consts::FRAC_PI_4.sin() * 16384.0) as i32;
        let mut c = conditioner_with(vec![sample(a, -a, 0); 40], &config);
        let t0 = Instant::now();
        let mut theta_n = 0.0;
        for k in 0..40 {
            let s = c.transport.read_all_axes().unwrap();
            theta_n = c.condition(&s, t0 + Duration::from_millis(10 * k)).0;
        }
        assert_abs_diff_eq!(theta_n, 0.5, epsilon = 1e-3);
    }

    #[test]
    fn test_soft_clip_never_reaches_full_scale() {
        let fs = 16384.0;
        for v in [-50_000.0, -32768.0, -16384.0, 16384.0, 32767.0, 50_000.0] {
            assert!(soft_clip(v, fs).abs() < fs);
        }
        // Linear near zero.
        assert_abs_diff_eq!(soft_clip(100.0, fs), 100.0, epsilon = 0.1);
    }

    #[test]
    fn test_outputs_always_finite_and_clamped() {
        let config = test_config(std::f64::consts::PI);
        let extremes = vec![
            RawSample{ax: i16::MAX as i32, ay: i16::MIN as i32,
                      az: i16::MAX as i32, gx: 0, gy: i16::MIN as i32, gz: 0},
            RawSample{ax: 0, ay: 0, az: 0, gx: 0, gy: 0, gz: 0},
            RawSample{ax: -40_000, ay: 0, az: 40_000, gx: 0, gy: -40_000, gz: 0},
        ];
        let mut c = conditioner_with(extremes.clone(), &config);
        for _ in 0..extremes.len() {
            let (theta_n, omega_n) = c.read_normalized().unwrap();
            assert!(theta_n.is_finite() && (-1.0..=1.0).contains(&theta_n));
            assert!(omega_n.is_finite() && (-1.0..=1.0).contains(&omega_n));
        }
    }
}  // mod tests.
