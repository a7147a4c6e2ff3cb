use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use canonical_error::{CanonicalError, unimplemented_error};
use log::debug;

use crate::imu_transport::{ImuTransport, RawSample};
use crate::perturbations::Perturbation;
use crate::pwm_motor::MotorDrive;

// Mechanical parameters of the carriage riding on the wheel rim.
#[derive(Debug, Clone, Copy)]
pub struct PlantParams {
    // Rotational inertia about the contact point, kg·m².
    pub inertia: f64,
    // Carriage mass, kg.
    pub mass: f64,
    // Distance from the rotation axis to the center of mass, m.
    pub radius: f64,
    // Viscous damping, N·m·s/rad.
    pub damping: f64,
    // m/s².
    pub gravity: f64,
}

impl Default for PlantParams {
    fn default() -> Self {
        PlantParams{inertia: 0.02, mass: 0.5, radius: 0.10,
                    damping: 0.05, gravity: 9.80665}
    }
}

// Friction-roller drive: motor torque is multiplied by the roller count and
// the wheel/roller radius ratio.
#[derive(Debug, Clone, Copy)]
pub struct MotorParams {
    // Torque of one motor at full command, N·m.
    pub tau_motor_one: f64,
    pub n_rollers: u32,
    pub r_roller: f64,
    pub r_wheel: f64,
}

impl Default for MotorParams {
    fn default() -> Self {
        MotorParams{tau_motor_one: 0.15, n_rollers: 2,
                    r_roller: 0.02, r_wheel: 0.30}
    }
}

impl MotorParams {
    pub fn wheel_torque(&self, cmd: f64) -> f64 {
        cmd * self.tau_motor_one * self.n_rollers as f64
            * self.r_wheel / self.r_roller
    }
}

// Nonlinear rotary dynamics of the carriage:
//   I·alpha = tau_motor + m·g·r·sin(theta) - b·omega
// integrated with semi-implicit Euler. Upright is theta = 0; gravity torque
// pushes away from upright (inverted pendulum).
#[derive(Debug, Clone)]
pub struct CarriageSimulator {
    pub plant: PlantParams,
    pub motor: MotorParams,
    pub dt: f64,
    pub perturb: Perturbation,
    pub theta: f64,
    pub omega: f64,
    pub t: f64,
}

impl CarriageSimulator {
    pub fn new(plant: PlantParams, motor: MotorParams, dt: f64) -> Self {
        CarriageSimulator{plant, motor, dt, perturb: Perturbation::new(),
                          theta: 0.0, omega: 0.0, t: 0.0}
    }

    pub fn reset(&mut self, theta: f64, omega: f64) {
        self.theta = theta;
        self.omega = omega;
        self.t = 0.0;
    }

    // Advances one time step under the given normalized motor command.
    pub fn step(&mut self, motor_cmd: f64) {
        let tau_m = self.motor.wheel_torque(motor_cmd);
        let tau_g = self.plant.mass * self.plant.gravity * self.plant.radius
            * self.theta.sin();
        let tau_ext = self.perturb.torque_at(self.t, self.dt);
        let alpha = (tau_m + tau_g + tau_ext
                     - self.plant.damping * self.omega) / self.plant.inertia;
        self.omega += alpha * self.dt;
        self.theta += self.omega * self.dt;
        self.t += self.dt;
    }
}

// Plant shared between the simulated IMU (which steps it) and the simulated
// motor (which feeds it commands). Replaces the command mailbox the hardware
// mocks used to keep in module-global state.
#[derive(Clone)]
pub struct SharedPlant {
    inner: Arc<Mutex<PlantShared>>,
}

struct PlantShared {
    sim: CarriageSimulator,
    motor_cmd: f64,
}

impl SharedPlant {
    pub fn new(sim: CarriageSimulator) -> Self {
        SharedPlant{inner: Arc::new(Mutex::new(
            PlantShared{sim, motor_cmd: 0.0}))}
    }

    pub fn set_motor_cmd(&self, cmd: f64) {
        self.inner.lock().unwrap().motor_cmd = cmd;
    }

    // (theta, omega, t) of the underlying simulator.
    pub fn state(&self) -> (f64, f64, f64) {
        let locked = self.inner.lock().unwrap();
        (locked.sim.theta, locked.sim.omega, locked.sim.t)
    }

    fn step_and_state(&self) -> (f64, f64) {
        let mut locked = self.inner.lock().unwrap();
        let cmd = locked.motor_cmd;
        locked.sim.step(cmd);
        (locked.sim.theta, locked.sim.omega)
    }
}

// Synthesizes six-axis samples from the simulated plant. Each read advances
// the plant by one time step, so the control tick and the integration step
// stay in lockstep. XZ tilt plane, gyro-Y rate axis.
pub struct SimulatedImu {
    plant: SharedPlant,
    accel_1g_raw: f64,
    gyro_lsb_per_dps: f64,
}

impl SimulatedImu {
    pub fn new(plant: SharedPlant, accel_1g_raw: f64, gyro_lsb_per_dps: f64)
               -> Self {
        SimulatedImu{plant, accel_1g_raw, gyro_lsb_per_dps}
    }
}

impl ImuTransport for SimulatedImu {
    fn read_byte(&mut self, _reg: u8) -> Result<u8, CanonicalError> {
        Err(unimplemented_error("Simulated IMU has no register file"))
    }

    fn read_block(&mut self, _reg: u8, _len: usize)
                  -> Result<Vec<u8>, CanonicalError> {
        Err(unimplemented_error("Simulated IMU has no register file"))
    }

    fn write_byte(&mut self, _reg: u8, _value: u8) -> Result<(), CanonicalError> {
        Err(unimplemented_error("Simulated IMU has no register file"))
    }

    fn read_all_axes(&mut self) -> Result<RawSample, CanonicalError> {
        let (theta, omega) = self.plant.step_and_state();
        let ax = (theta.sin() * self.accel_1g_raw).round() as i32;
        let az = (-theta.cos() * self.accel_1g_raw).round() as i32;
        let gy = (omega.to_degrees() * self.gyro_lsb_per_dps).round() as i32;
        let sample = RawSample{ax, ay: 0, az, gx: 0, gy, gz: 0};
        debug!("Simulated sample at theta={:.3}: {:?}", theta, sample);
        Ok(sample)
    }

    fn model(&self) -> &'static str {
        "simulated"
    }
}

// Replays a fixed sample sequence, repeating the final sample once the
// script is exhausted.
pub struct ScriptedImu {
    samples: Vec<RawSample>,
    next: usize,
}

impl ScriptedImu {
    pub fn new(samples: Vec<RawSample>) -> Self {
        assert!(!samples.is_empty());
        ScriptedImu{samples, next: 0}
    }
}

impl ImuTransport for ScriptedImu {
    fn read_byte(&mut self, _reg: u8) -> Result<u8, CanonicalError> {
        Err(unimplemented_error("Scripted IMU has no register file"))
    }

    fn read_block(&mut self, _reg: u8, _len: usize)
                  -> Result<Vec<u8>, CanonicalError> {
        Err(unimplemented_error("Scripted IMU has no register file"))
    }

    fn write_byte(&mut self, _reg: u8, _value: u8) -> Result<(), CanonicalError> {
        Err(unimplemented_error("Scripted IMU has no register file"))
    }

    fn read_all_axes(&mut self) -> Result<RawSample, CanonicalError> {
        let sample = self.samples[self.next.min(self.samples.len() - 1)];
        self.next += 1;
        Ok(sample)
    }

    fn model(&self) -> &'static str {
        "scripted"
    }
}

// Motor double: records every command, optionally forwards to a shared
// plant, and can request shutdown after a fixed number of commands so
// closed-loop tests run a deterministic tick count.
#[derive(Clone)]
pub struct RecordingMotor {
    inner: Arc<Mutex<RecorderState>>,
    plant: Option<SharedPlant>,
    stop_after: Option<(u64, Arc<AtomicBool>)>,
}

struct RecorderState {
    commands: Vec<f64>,
    stopped: bool,
}

impl RecordingMotor {
    pub fn new() -> Self {
        RecordingMotor{
            inner: Arc::new(Mutex::new(
                RecorderState{commands: Vec::new(), stopped: false})),
            plant: None,
            stop_after: None,
        }
    }

    pub fn with_plant(mut self, plant: SharedPlant) -> Self {
        self.plant = Some(plant);
        self
    }

    pub fn with_stop_after(mut self, commands: u64,
                           got_signal: Arc<AtomicBool>) -> Self {
        self.stop_after = Some((commands, got_signal));
        self
    }

    pub fn commands(&self) -> Vec<f64> {
        self.inner.lock().unwrap().commands.clone()
    }

    pub fn stopped(&self) -> bool {
        self.inner.lock().unwrap().stopped
    }
}

impl MotorDrive for RecordingMotor {
    fn set_speed(&mut self, u: f64) -> Result<(), CanonicalError> {
        let count = {
            let mut locked = self.inner.lock().unwrap();
            locked.commands.push(u);
            locked.commands.len() as u64
        };
        if let Some(plant) = &self.plant {
            plant.set_motor_cmd(u);
        }
        if let Some((limit, got_signal)) = &self.stop_after {
            if count >= *limit {
                got_signal.store(true, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CanonicalError> {
        let mut locked = self.inner.lock().unwrap();
        locked.commands.push(0.0);
        locked.stopped = true;
        if let Some(plant) = &self.plant {
            plant.set_motor_cmd(0.0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use super::*;
    use crate::config::Config;
    use crate::controller::FlcController;

    #[test]
    fn test_open_loop_carriage_falls() {
        let mut sim = CarriageSimulator::new(
            PlantParams::default(), MotorParams::default(), 0.002);
        sim.reset(0.1, 0.0);
        for _ in 0..2000 {
            sim.step(0.0);
        }
        // Inverted pendulum with no drive: tilt grows.
        assert!(sim.theta.abs() > 0.5);
    }

    #[test]
    fn test_motor_torque_scales_with_gear_ratio() {
        let motor = MotorParams{tau_motor_one: 0.1, n_rollers: 2,
                                r_roller: 0.02, r_wheel: 0.30};
        assert_abs_diff_eq!(motor.wheel_torque(1.0), 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(motor.wheel_torque(-0.5), -1.5, epsilon = 1e-12);
    }

    #[test]
    fn test_flc_stabilizes_plant_from_tilt() {
        // Direct closed loop on the plant state (no sensor path): the
        // controller must bring an initial 0.3 rad tilt back near upright.
        let config =
            Config::from_toml_str(include_str!("../flc_config.toml")).unwrap();
        let flc = FlcController::new(&config);
        let mut sim = CarriageSimulator::new(
            PlantParams::default(), MotorParams::default(), 0.002);
        sim.reset(0.3, 0.0);
        let mut max_theta: f64 = 0.0;
        for _ in 0..4000 {
            let theta_n = (sim.theta / config.scaling.theta_max_rad)
                .clamp(-1.0, 1.0);
            let omega_n = (sim.omega / config.scaling.omega_max_rad_s)
                .clamp(-1.0, 1.0);
            let u = flc.calculate_motor_cmd(theta_n, omega_n).unwrap();
            sim.step(u);
            max_theta = max_theta.max(sim.theta.abs());
        }
        assert!(max_theta < 0.5, "tilt diverged to {}", max_theta);
        assert!(sim.theta.abs() < 0.05, "did not settle: {}", sim.theta);
        assert!(sim.omega.abs() < 0.2, "still moving: {}", sim.omega);
    }

    #[test]
    fn test_flc_rejects_step_disturbance() {
        // A constant load torque over [1, 2) pushes the carriage off
        // upright; the controller must hold the excursion and recover after
        // the load is removed.
        let config =
            Config::from_toml_str(include_str!("../flc_config.toml")).unwrap();
        let flc = FlcController::new(&config);
        let mut sim = CarriageSimulator::new(
            PlantParams::default(), MotorParams::default(), 0.002);
        sim.perturb.add_step(1.0, 2.0, 0.3);
        let mut max_theta: f64 = 0.0;
        for _ in 0..4000 {
            let theta_n = (sim.theta / config.scaling.theta_max_rad)
                .clamp(-1.0, 1.0);
            let omega_n = (sim.omega / config.scaling.omega_max_rad_s)
                .clamp(-1.0, 1.0);
            let u = flc.calculate_motor_cmd(theta_n, omega_n).unwrap();
            sim.step(u);
            max_theta = max_theta.max(sim.theta.abs());
        }
        assert!(max_theta > 0.1, "disturbance had no effect: {}", max_theta);
        assert!(max_theta < 0.6, "disturbance not contained: {}", max_theta);
        assert!(sim.theta.abs() < 0.05, "did not recover: {}", sim.theta);
    }

    #[test]
    fn test_simulated_imu_sample_matches_plant_state() {
        let sim = CarriageSimulator::new(
            PlantParams::default(), MotorParams::default(), 0.002);
        let plant = SharedPlant::new(sim);
        let mut imu = SimulatedImu::new(plant.clone(), 16384.0, 131.0);
        {
            let mut locked = plant.inner.lock().unwrap();
            locked.sim.reset(std::f64::consts::FRAC_PI_4, 0.0);
        }
        let sample = imu.read_all_axes().unwrap();
        // One step of drift, then ax ~ sin(pi/4)·1g, az ~ -cos(pi/4)·1g.
        assert!((sample.ax - 11585).abs() < 200);
        assert!((sample.az + 11585).abs() < 200);
    }

    #[test]
    fn test_recording_motor_stop_request() {
        let got_signal = Arc::new(AtomicBool::new(false));
        let mut motor = RecordingMotor::new()
            .with_stop_after(3, got_signal.clone());
        for _ in 0..3 {
            motor.set_speed(0.5).unwrap();
        }
        assert!(got_signal.load(Ordering::Relaxed));
        assert!(!motor.stopped());
        motor.stop().unwrap();
        assert!(motor.stopped());
        assert_eq!(motor.commands().len(), 4);
    }
}  // mod tests.
