use canonical_error::CanonicalError;
use log::{debug, info};

use crate::config::Config;
use crate::defuzzifier::Defuzzifier;
use crate::fuzzifier::Fuzzifier;
use crate::rule_engine::RuleEngine;

// The Sugeno fuzzy-logic controller: fuzzification, rule evaluation and
// defuzzification in one pipeline. Pure computation; owns no hardware.
pub struct FlcController {
    fuzzifier: Fuzzifier,
    rule_engine: RuleEngine,
    defuzzifier: Defuzzifier,
}

impl FlcController {
    pub fn new(config: &Config) -> Self {
        let fuzzifier = Fuzzifier::new(config.theta_sets.clone(),
                                       config.omega_sets.clone());
        let rule_engine = RuleEngine::new(config.rules.clone(),
                                          config.scaling.theta_scale_factor,
                                          config.scaling.omega_scale_factor);
        info!("FLC controller ready ({} rules)", rule_engine.rule_count());
        FlcController{fuzzifier, rule_engine, defuzzifier: Defuzzifier::new()}
    }

    // One full inference cycle: normalized (theta, omega) in, normalized
    // motor command in [-1, +1] out.
    pub fn calculate_motor_cmd(&self, theta_n: f64, omega_n: f64)
                               -> Result<f64, CanonicalError> {
        let (motor_cmd, _) = self.calculate_with_trace(theta_n, omega_n)?;
        Ok(motor_cmd)
    }

    // As calculate_motor_cmd(), but also returns the per-rule (W, Z) pairs
    // for telemetry consumers.
    pub fn calculate_with_trace(&self, theta_n: f64, omega_n: f64)
                                -> Result<(f64, Vec<(f64, f64)>), CanonicalError> {
        debug!("FLC cycle start: theta={:.3} omega={:.3}", theta_n, omega_n);
        let fuzzified_theta = self.fuzzifier.fuzzify("theta", theta_n)?;
        let fuzzified_omega = self.fuzzifier.fuzzify("omega", omega_n)?;
        let rule_outputs = self.rule_engine.evaluate(
            &fuzzified_theta, &fuzzified_omega, theta_n, omega_n);
        let motor_cmd = self.defuzzifier.defuzzify(&rule_outputs);
        debug!("FLC cycle end: motor_cmd={:.4}", motor_cmd);
        Ok((motor_cmd, rule_outputs))
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use super::*;
    use crate::config::Config;

    fn shipped() -> FlcController {
        let config =
            Config::from_toml_str(include_str!("../flc_config.toml")).unwrap();
        FlcController::new(&config)
    }

    #[test]
    fn test_zero_input_zero_output() {
        let flc = shipped();
        let u = flc.calculate_motor_cmd(0.0, 0.0).unwrap();
        assert_abs_diff_eq!(u, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_output_always_in_range() {
        let flc = shipped();
        let mut x = -1.0;
        while x <= 1.0 {
            let mut y = -1.0;
            while y <= 1.0 {
                let u = flc.calculate_motor_cmd(x, y).unwrap();
                assert!((-1.0..=1.0).contains(&u), "u={} at ({}, {})", u, x, y);
                assert!(u.is_finite());
                y += 0.125;
            }
            x += 0.125;
        }
    }

    #[test]
    fn test_negative_feedback_sign() {
        let flc = shipped();
        let mut x = 0.05;
        while x <= 1.0 {
            assert!(flc.calculate_motor_cmd(x, 0.0).unwrap() <= 0.0);
            assert!(flc.calculate_motor_cmd(-x, 0.0).unwrap() >= 0.0);
            assert!(flc.calculate_motor_cmd(0.0, x).unwrap() <= 0.0);
            assert!(flc.calculate_motor_cmd(0.0, -x).unwrap() >= 0.0);
            x += 0.05;
        }
    }

    #[test]
    fn test_magnitude_monotone_in_theta() {
        let flc = shipped();
        let mut prev = 0.0;
        let mut x = 0.0;
        while x <= 1.0 {
            let mag = flc.calculate_motor_cmd(x, 0.0).unwrap().abs();
            assert!(mag >= prev - 1e-9, "|u| regressed at theta={}", x);
            prev = mag;
            x += 0.05;
        }
    }

    #[test]
    fn test_magnitude_monotone_in_omega() {
        let flc = shipped();
        let mut prev = 0.0;
        let mut y = 0.0;
        while y <= 1.0 {
            let mag = flc.calculate_motor_cmd(0.0, y).unwrap().abs();
            assert!(mag >= prev - 1e-9, "|u| regressed at omega={}", y);
            prev = mag;
            y += 0.05;
        }
    }

    #[test]
    fn test_every_input_covered_by_some_set() {
        // Not a partition of unity, but no dead zones in the input domain.
        let config =
            Config::from_toml_str(include_str!("../flc_config.toml")).unwrap();
        let flc = FlcController::new(&config);
        let mut x = -1.0;
        while x <= 1.0 {
            let fz_t = flc.fuzzifier.fuzzify("theta", x).unwrap();
            let fz_o = flc.fuzzifier.fuzzify("omega", x).unwrap();
            assert!(!fz_t.is_empty(), "theta uncovered at {}", x);
            assert!(!fz_o.is_empty(), "omega uncovered at {}", x);
            x += 0.01;
        }
    }

    #[test]
    fn test_tilted_quarter_turn_commands_restoring_torque() {
        let flc = shipped();
        let u = flc.calculate_motor_cmd(0.25, 0.0).unwrap();
        assert!(u < 0.0);
        assert!(u.abs() >= 0.25);
    }

    #[test]
    fn test_fast_rotation_while_upright_commands_braking() {
        // Sensor path plus inference: upright carriage spinning at half the
        // gyro full scale must be braked.
        use crate::imu_conditioner::ImuConditioner;
        use crate::imu_transport::RawSample;
        use crate::simulator::ScriptedImu;

        let mut config =
            Config::from_toml_str(include_str!("../flc_config.toml")).unwrap();
        config.params.do_gyro_bias_cal = false;
        let flc = FlcController::new(&config);
        let sample = RawSample{ax: 0, ay: 0, az: -16384,
                               gx: 0, gy: 16384, gz: 0};
        let mut conditioner = ImuConditioner::new(
            Box::new(ScriptedImu::new(vec![sample; 40])), &config).unwrap();
        let mut norm = (0.0, 0.0);
        for _ in 0..40 {
            norm = conditioner.read_normalized().unwrap();
        }
        let (theta_n, omega_n) = norm;
        assert_abs_diff_eq!(theta_n, 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(omega_n, 0.5, epsilon = 1e-3);
        let u = flc.calculate_motor_cmd(theta_n, omega_n).unwrap();
        assert!(u < 0.0);
    }

    #[test]
    fn test_saturated_rate_clamps_command_to_full_reverse() {
        // With a single wide ZERO/ZERO rule (unit coefficients, no bias) a
        // saturated rate input drives the command to exactly -1.
        let toml = r#"
[scaling]
THETA_MAX_RAD = 3.14159265358979
OMEGA_MAX_RAD_S = 4.27605666739085

[iir_filter]
SAMPLE_RATE_HZ = 100.0
ACCEL_CUTOFF_HZ = 4.0
OMEGA_CUTOFF_HZ = 8.0

[controller_params]
LOOP_FREQ_HZ = 100.0

[membership_functions.theta]
ZE = [-1.0, 0.0, 1.0]

[membership_functions.omega]
ZE = [-1.0, 0.0, 1.0]

[[rule_base]]
rule = ["ZE", "ZE"]
output = { theta_coeff = -1.0, omega_coeff = -1.0, bias = 0.0 }
"#;
        let config = Config::from_toml_str(toml).unwrap();
        let flc = FlcController::new(&config);
        assert_eq!(flc.calculate_motor_cmd(0.0, 1.0).unwrap(), -1.0);
        assert_eq!(flc.calculate_motor_cmd(0.0, -1.0).unwrap(), 1.0);
    }

    #[test]
    fn test_trace_reports_active_rules() {
        let flc = shipped();
        let (_, trace) = flc.calculate_with_trace(0.25, 0.0).unwrap();
        assert!(!trace.is_empty());
        for (w, z) in trace {
            assert!(w > 0.0 && w <= 1.0);
            assert!(z.is_finite());
        }
    }
}  // mod tests.
