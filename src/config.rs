use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use canonical_error::{CanonicalError,
                      failed_precondition_error, invalid_argument_error};
use log::{info, warn};
use serde::Deserialize;

use crate::fuzzifier::MembershipFn;
use crate::rule_engine::{Rule, RuleConsequent};

// Input scaling applied around the fuzzy pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct Scaling {
    #[serde(rename = "THETA_MAX_RAD")]
    pub theta_max_rad: f64,
    #[serde(rename = "OMEGA_MAX_RAD_S")]
    pub omega_max_rad_s: f64,
    #[serde(rename = "THETA_SCALE_FACTOR", default = "default_unity")]
    pub theta_scale_factor: f64,
    #[serde(rename = "OMEGA_SCALE_FACTOR", default = "default_unity")]
    pub omega_scale_factor: f64,
}

// First-order IIR low-pass parameters, resolved from the raw table.
#[derive(Debug, Clone)]
pub struct IirParams {
    pub sample_rate_hz: f64,
    pub accel_cutoff_hz: f64,
    pub omega_cutoff_hz: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct IirFilterRaw {
    #[serde(rename = "SAMPLE_RATE_HZ")]
    sample_rate_hz: f64,
    #[serde(rename = "ACCEL_CUTOFF_HZ")]
    accel_cutoff_hz: f64,
    #[serde(rename = "OMEGA_CUTOFF_HZ")]
    omega_cutoff_hz: Option<f64>,
    // Legacy spelling of the gyro-channel cutoff. OMEGA_CUTOFF_HZ wins when
    // both are present.
    #[serde(rename = "CUTOFF_FREQ_HZ")]
    cutoff_freq_hz: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ImuModel {
    #[serde(rename = "lsm6ds3tr")]
    Lsm6ds3tr,
    #[serde(rename = "mpu6050")]
    Mpu6050,
}

// Which accelerometer pair forms the tilt plane. Set by the mechanical
// mounting, not by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TiltPlane {
    #[serde(rename = "XZ")]
    Xz,
    #[serde(rename = "YZ")]
    Yz,
}

// Which gyro axis senses the tilt rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RateAxis {
    X,
    Y,
    Z,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerParams {
    #[serde(rename = "THETA_RANGE_RAD", default = "default_theta_range")]
    pub theta_range_rad: f64,
    #[serde(rename = "GYRO_FULL_SCALE_RADS_S", default = "default_gyro_full_scale")]
    pub gyro_full_scale_rads_s: f64,
    #[serde(rename = "ACCEL_RAW_FS", default = "default_accel_raw")]
    pub accel_raw_fs: f64,
    #[serde(rename = "ACCEL_1G_RAW", default = "default_accel_raw")]
    pub accel_1g_raw: f64,
    #[serde(rename = "GYRO_LSB_PER_DPS", default = "default_gyro_lsb_per_dps")]
    pub gyro_lsb_per_dps: f64,
    #[serde(rename = "DO_GYRO_BIAS_CAL", default)]
    pub do_gyro_bias_cal: bool,
    #[serde(rename = "GYRO_BIAS_SAMPLES", default = "default_bias_samples")]
    pub gyro_bias_samples: usize,
    #[serde(rename = "USE_COMPLEMENTARY", default)]
    pub use_complementary: bool,
    #[serde(rename = "COMP_ALPHA", default = "default_comp_alpha")]
    pub comp_alpha: f64,
    #[serde(rename = "ACCEL_MAG_TOL_G", default = "default_accel_mag_tol")]
    pub accel_mag_tol_g: f64,
    #[serde(rename = "LOOP_FREQ_HZ", default = "default_loop_freq")]
    pub loop_freq_hz: f64,
    #[serde(rename = "PWM_FREQ_HZ", default = "default_pwm_freq")]
    pub pwm_freq_hz: f64,
    #[serde(rename = "MIN_PWM", default = "default_min_pwm")]
    pub min_pwm: u32,
    #[serde(rename = "MAX_PWM", default = "default_max_pwm")]
    pub max_pwm: u32,
    #[serde(rename = "I2C_BUS", default = "default_i2c_bus")]
    pub i2c_bus: u8,
    #[serde(rename = "I2C_ADDR", default = "default_i2c_addr")]
    pub i2c_addr: u16,
    #[serde(rename = "IMU_MODEL", default = "default_imu_model")]
    pub imu_model: ImuModel,
    #[serde(rename = "TILT_PLANE", default = "default_tilt_plane")]
    pub tilt_plane: TiltPlane,
    #[serde(rename = "RATE_AXIS", default = "default_rate_axis")]
    pub rate_axis: RateAxis,
}

fn default_unity() -> f64 { 1.0 }
fn default_theta_range() -> f64 { std::f64::consts::PI }
fn default_gyro_full_scale() -> f64 { 245.0_f64.to_radians() }
fn default_accel_raw() -> f64 { 16384.0 }
fn default_gyro_lsb_per_dps() -> f64 { 131.0 }
fn default_bias_samples() -> usize { 200 }
fn default_comp_alpha() -> f64 { 0.98 }
fn default_accel_mag_tol() -> f64 { 0.15 }
fn default_loop_freq() -> f64 { 100.0 }
fn default_pwm_freq() -> f64 { 250.0 }
fn default_min_pwm() -> u32 { 57_000 }
fn default_max_pwm() -> u32 { 1_000_000 }
fn default_i2c_bus() -> u8 { 1 }
fn default_i2c_addr() -> u16 { 0x6B }
fn default_imu_model() -> ImuModel { ImuModel::Lsm6ds3tr }
fn default_tilt_plane() -> TiltPlane { TiltPlane::Xz }
fn default_rate_axis() -> RateAxis { RateAxis::Y }

#[derive(Debug, Clone, Deserialize)]
struct MembershipTablesRaw {
    theta: BTreeMap<String, Vec<f64>>,
    omega: BTreeMap<String, Vec<f64>>,
}

#[derive(Debug, Clone, Deserialize)]
struct RuleSpec {
    rule: (String, String),
    output: ConsequentSpec,
}

#[derive(Debug, Clone, Deserialize)]
struct ConsequentSpec {
    theta_coeff: f64,
    omega_coeff: f64,
    #[serde(default)]
    bias: f64,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    scaling: Scaling,
    #[serde(alias = "iir_params")]
    iir_filter: IirFilterRaw,
    controller_params: ControllerParams,
    membership_functions: MembershipTablesRaw,
    #[serde(default)]
    rule_base: Vec<RuleSpec>,
}

// The single load-once configuration consumed by all components. Immutable
// for the program lifetime; shared by reference, never by lock.
#[derive(Debug, Clone)]
pub struct Config {
    pub scaling: Scaling,
    pub iir: IirParams,
    pub params: ControllerParams,
    pub theta_sets: BTreeMap<String, MembershipFn>,
    pub omega_sets: BTreeMap<String, MembershipFn>,
    pub rules: Vec<Rule>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, CanonicalError> {
        let text = fs::read_to_string(path).map_err(|e| {
            failed_precondition_error(&format!(
                "Cannot read config file {:?}: {}", path, e))
        })?;
        let config = Self::from_toml_str(&text)?;
        info!("Loaded config from {:?}: {} theta set(s), {} omega set(s), {} rule(s)",
              path, config.theta_sets.len(), config.omega_sets.len(),
              config.rules.len());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Config, CanonicalError> {
        let raw: RawConfig = toml::from_str(text).map_err(|e| {
            invalid_argument_error(&format!("Malformed config: {}", e))
        })?;
        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> Result<Config, CanonicalError> {
        let iir = resolve_iir(&raw.iir_filter)?;
        validate_params(&raw.scaling, &raw.controller_params)?;

        let theta_sets = build_sets("theta", &raw.membership_functions.theta)?;
        let omega_sets = build_sets("omega", &raw.membership_functions.omega)?;
        if theta_sets.is_empty() || omega_sets.is_empty() {
            return Err(invalid_argument_error(
                "Both theta and omega need at least one membership function"));
        }

        let mut rules = Vec::with_capacity(raw.rule_base.len());
        for (i, spec) in raw.rule_base.iter().enumerate() {
            let (theta_set, omega_set) = &spec.rule;
            if !theta_sets.contains_key(theta_set) {
                return Err(invalid_argument_error(&format!(
                    "Rule {} references unknown theta set '{}'", i, theta_set)));
            }
            if !omega_sets.contains_key(omega_set) {
                return Err(invalid_argument_error(&format!(
                    "Rule {} references unknown omega set '{}'", i, omega_set)));
            }
            // Non-positive coefficients guarantee negative feedback at the
            // rule level.
            if spec.output.theta_coeff > 0.0 || spec.output.omega_coeff > 0.0 {
                return Err(invalid_argument_error(&format!(
                    "Rule {} ({}/{}) has a positive feedback coefficient",
                    i, theta_set, omega_set)));
            }
            rules.push(Rule{
                theta_set: theta_set.clone(),
                omega_set: omega_set.clone(),
                consequent: RuleConsequent{
                    theta_coeff: spec.output.theta_coeff,
                    omega_coeff: spec.output.omega_coeff,
                    bias: spec.output.bias,
                },
            });
        }
        if rules.is_empty() {
            return Err(invalid_argument_error("Empty rule base"));
        }

        Ok(Config{
            scaling: raw.scaling,
            iir,
            params: raw.controller_params,
            theta_sets,
            omega_sets,
            rules,
        })
    }
}

fn resolve_iir(raw: &IirFilterRaw) -> Result<IirParams, CanonicalError> {
    let omega_cutoff_hz = match (raw.omega_cutoff_hz, raw.cutoff_freq_hz) {
        (Some(omega), Some(legacy)) => {
            if omega != legacy {
                warn!("Both OMEGA_CUTOFF_HZ ({}) and CUTOFF_FREQ_HZ ({}) set; \
                       using OMEGA_CUTOFF_HZ", omega, legacy);
            }
            omega
        }
        (Some(omega), None) => omega,
        (None, Some(legacy)) => legacy,
        (None, None) => {
            return Err(invalid_argument_error(
                "IIR table needs OMEGA_CUTOFF_HZ (or legacy CUTOFF_FREQ_HZ)"));
        }
    };
    let iir = IirParams{
        sample_rate_hz: raw.sample_rate_hz,
        accel_cutoff_hz: raw.accel_cutoff_hz,
        omega_cutoff_hz,
    };
    if iir.sample_rate_hz <= 0.0 || iir.accel_cutoff_hz <= 0.0
        || iir.omega_cutoff_hz <= 0.0 {
        return Err(invalid_argument_error(&format!(
            "IIR parameters must be positive: {:?}", iir)));
    }
    Ok(iir)
}

fn validate_params(scaling: &Scaling, params: &ControllerParams)
                   -> Result<(), CanonicalError> {
    if scaling.theta_max_rad <= 0.0 || scaling.omega_max_rad_s <= 0.0 {
        return Err(invalid_argument_error(
            "Scaling ranges must be strictly positive"));
    }
    if params.theta_range_rad <= 0.0 {
        return Err(invalid_argument_error("THETA_RANGE_RAD must be positive"));
    }
    if params.accel_raw_fs <= 0.0 || params.accel_1g_raw <= 0.0
        || params.gyro_lsb_per_dps <= 0.0 || params.gyro_full_scale_rads_s <= 0.0 {
        return Err(invalid_argument_error("IMU scale factors must be positive"));
    }
    if !(0.0..=1.0).contains(&params.comp_alpha) {
        return Err(invalid_argument_error("COMP_ALPHA must be in [0, 1]"));
    }
    if params.do_gyro_bias_cal && params.gyro_bias_samples == 0 {
        return Err(invalid_argument_error("GYRO_BIAS_SAMPLES must be nonzero"));
    }
    if params.loop_freq_hz <= 0.0 || params.pwm_freq_hz <= 0.0 {
        return Err(invalid_argument_error("Loop and PWM frequencies must be positive"));
    }
    if params.min_pwm == 0 || params.min_pwm >= params.max_pwm
        || params.max_pwm > 1_000_000 {
        return Err(invalid_argument_error(&format!(
            "Dead-zone must satisfy 0 < MIN_PWM < MAX_PWM <= 1000000; \
             got {} / {}", params.min_pwm, params.max_pwm)));
    }
    Ok(())
}

fn build_sets(input_name: &str, table: &BTreeMap<String, Vec<f64>>)
              -> Result<BTreeMap<String, MembershipFn>, CanonicalError> {
    let mut sets = BTreeMap::new();
    for (set_name, params) in table {
        let mf = MembershipFn::from_params(
            &format!("{}.{}", input_name, set_name), params)?;
        sets.insert(set_name.clone(), mf);
    }
    Ok(sets)
}

// mod tests.
