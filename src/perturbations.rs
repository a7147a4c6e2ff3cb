// Disturbance torques for simulation runs: impulses, step loads and sine
// excitation, summed into an external torque per integration step.

#[derive(Debug, Clone, Copy)]
struct Impulse {
    t0: f64,
    magnitude: f64,
}

#[derive(Debug, Clone, Copy)]
struct StepDisturbance {
    t0: f64,
    t1: f64,
    magnitude: f64,
}

#[derive(Debug, Clone, Copy)]
struct SineDisturbance {
    amplitude: f64,
    freq_hz: f64,
    phase: f64,
    t_start: f64,
    t_end: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Perturbation {
    impulses: Vec<Impulse>,
    steps: Vec<StepDisturbance>,
    sines: Vec<SineDisturbance>,
}

impl Perturbation {
    pub fn new() -> Self {
        Perturbation::default()
    }

    // A torque applied for exactly one integration step at `t0`.
    pub fn add_impulse(&mut self, t0: f64, magnitude: f64) {
        self.impulses.push(Impulse{t0, magnitude});
    }

    // A constant torque over [t0, t1).
    pub fn add_step(&mut self, t0: f64, t1: f64, magnitude: f64) {
        self.steps.push(StepDisturbance{t0, t1, magnitude});
    }

    pub fn add_sine(&mut self, amplitude: f64, freq_hz: f64, phase: f64,
                    t_start: f64, t_end: f64) {
        self.sines.push(SineDisturbance{amplitude, freq_hz, phase,
                                        t_start, t_end});
    }

    pub fn is_empty(&self) -> bool {
        self.impulses.is_empty() && self.steps.is_empty()
            && self.sines.is_empty()
    }

    // Total external torque for the step covering [t, t + dt).
    pub fn torque_at(&self, t: f64, dt: f64) -> f64 {
        let mut tau = 0.0;
        for impulse in &self.impulses {
            if impulse.t0 >= t && impulse.t0 < t + dt {
                tau += impulse.magnitude;
            }
        }
        for step in &self.steps {
            if t >= step.t0 && t < step.t1 {
                tau += step.magnitude;
            }
        }
        for sine in &self.sines {
            if t >= sine.t_start && t < sine.t_end {
                let arg = 2.0 * std::f64::consts::PI * sine.freq_hz
                    * (t - sine.t_start) + sine.phase;
                tau += sine.amplitude * arg.sin();
            }
        }
        tau
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use super::*;

    #[test]
    fn test_empty_is_quiet() {
        let p = Perturbation::new();
        assert!(p.is_empty());
        assert_eq!(p.torque_at(0.0, 0.002), 0.0);
    }

    #[test]
    fn test_impulse_fires_in_exactly_one_step() {
        let mut p = Perturbation::new();
        p.add_impulse(0.1, 2.0);
        let dt = 0.002;
        let mut fired = 0;
        let mut t = 0.0;
        while t < 0.2 {
            if p.torque_at(t, dt) != 0.0 {
                fired += 1;
            }
            t += dt;
        }
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_step_window() {
        let mut p = Perturbation::new();
        p.add_step(0.1, 0.2, -0.5);
        assert_eq!(p.torque_at(0.05, 0.002), 0.0);
        assert_abs_diff_eq!(p.torque_at(0.15, 0.002), -0.5, epsilon = 1e-12);
        assert_eq!(p.torque_at(0.25, 0.002), 0.0);
    }

    #[test]
    fn test_sine_window_and_phase() {
        let mut p = Perturbation::new();
        p.add_sine(1.0, 1.0, 0.0, 1.0, 2.0);
        assert_eq!(p.torque_at(0.5, 0.002), 0.0);
        // Quarter period into the window: sin(pi/2) = 1.
        assert_abs_diff_eq!(p.torque_at(1.25, 0.002), 1.0, epsilon = 1e-9);
        assert_eq!(p.torque_at(2.5, 0.002), 0.0);
    }

    #[test]
    fn test_disturbances_sum() {
        let mut p = Perturbation::new();
        p.add_step(0.0, 1.0, 0.3);
        p.add_step(0.0, 1.0, 0.2);
        assert_abs_diff_eq!(p.torque_at(0.5, 0.002), 0.5, epsilon = 1e-12);
    }
}  // mod tests.
