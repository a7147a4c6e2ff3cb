use canonical_error::{CanonicalError, internal_error, unavailable_error};
use log::{debug, info};
use rppal::pwm::{Channel, Polarity, Pwm};

// Full-scale duty in parts-per-million.
pub const DUTY_FULL_SCALE: u32 = 1_000_000;

// Commands below this magnitude are treated as zero.
const SPEED_EPSILON: f64 = 1e-6;

// Seam between the control loop and the physical drive. The loop only ever
// sends normalized commands; test doubles record them.
pub trait MotorDrive {
    // `u` in [-1, +1]; magnitudes beyond 1 are clamped.
    fn set_speed(&mut self, u: f64) -> Result<(), CanonicalError>;

    // Drives both channels to zero and releases the outputs.
    fn stop(&mut self) -> Result<(), CanonicalError>;
}

// Dead-zone compensation: any nonzero command starts at `min_pwm` ppm, the
// empirical stall threshold of the friction rollers. Returns duty in ppm.
pub fn map_with_deadzone(u: f64, min_pwm: u32, max_pwm: u32) -> u32 {
    let v = u.abs().min(1.0);
    if v < SPEED_EPSILON {
        return 0;
    }
    (min_pwm as f64 + v * (max_pwm - min_pwm) as f64).round() as u32
}

// Dual-channel hardware PWM drive. Positive commands energize Pwm0 (GPIO18,
// clockwise), negative commands Pwm1 (GPIO19, counter-clockwise); at most
// one channel is nonzero at any time. This channel/direction assignment is
// the wiring convention from the hardware manual.
pub struct DualPwmController {
    pwm_cw: Pwm,
    pwm_ccw: Pwm,
    min_pwm: u32,
    max_pwm: u32,
    duty_cw: u32,
    duty_ccw: u32,
}

impl DualPwmController {
    pub fn new(frequency_hz: f64, min_pwm: u32, max_pwm: u32)
               -> Result<Self, CanonicalError> {
        let pwm_cw = Pwm::with_frequency(
            Channel::Pwm0, frequency_hz, 0.0, Polarity::Normal, true)
            .map_err(|e| unavailable_error(
                &format!("Failed to open PWM channel 0: {:?}", e)))?;
        let pwm_ccw = Pwm::with_frequency(
            Channel::Pwm1, frequency_hz, 0.0, Polarity::Normal, true)
            .map_err(|e| unavailable_error(
                &format!("Failed to open PWM channel 1: {:?}", e)))?;
        info!("Dual PWM drive ready: {} Hz, dead-zone {} ppm", frequency_hz,
              min_pwm);
        Ok(DualPwmController{pwm_cw, pwm_ccw, min_pwm, max_pwm,
                             duty_cw: 0, duty_ccw: 0})
    }

    fn apply(&mut self) -> Result<(), CanonicalError> {
        self.pwm_cw.set_duty_cycle(self.duty_cw as f64 / DUTY_FULL_SCALE as f64)
            .map_err(|e| internal_error(
                &format!("PWM channel 0 update failed: {:?}", e)))?;
        self.pwm_ccw.set_duty_cycle(self.duty_ccw as f64 / DUTY_FULL_SCALE as f64)
            .map_err(|e| internal_error(
                &format!("PWM channel 1 update failed: {:?}", e)))?;
        debug!("PWM duty: cw={} ccw={}", self.duty_cw, self.duty_ccw);
        Ok(())
    }
}

impl MotorDrive for DualPwmController {
    fn set_speed(&mut self, u: f64) -> Result<(), CanonicalError> {
        let duty = map_with_deadzone(u, self.min_pwm, self.max_pwm);
        if u > 0.0 {
            self.duty_cw = duty;
            self.duty_ccw = 0;
        } else if u < 0.0 {
            self.duty_cw = 0;
            self.duty_ccw = duty;
        } else {
            self.duty_cw = 0;
            self.duty_ccw = 0;
        }
        self.apply()
    }

    fn stop(&mut self) -> Result<(), CanonicalError> {
        self.duty_cw = 0;
        self.duty_ccw = 0;
        self.apply()?;
        self.pwm_cw.disable()
            .map_err(|e| internal_error(
                &format!("PWM channel 0 disable failed: {:?}", e)))?;
        self.pwm_ccw.disable()
            .map_err(|e| internal_error(
                &format!("PWM channel 1 disable failed: {:?}", e)))?;
        info!("Motor stopped");
        Ok(())
    }
}

// mod tests.
