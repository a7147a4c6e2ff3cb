use std::collections::{BTreeMap, HashMap};

use canonical_error::{CanonicalError, invalid_argument_error};
use log::{debug, info};

// Piecewise-linear membership function over the normalized input domain.
// Parameters are validated at construction; evaluation cannot fail.
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipFn {
    Triangle { a: f64, b: f64, c: f64 },
    Trapezoid { a: f64, b: f64, c: f64, d: f64 },
}

impl MembershipFn {
    // Builds a membership function from a config tuple: 3 values for a
    // triangle, 4 for a trapezoid. Parameters must be non-decreasing.
    pub fn from_params(set_name: &str, params: &[f64]) -> Result<Self, CanonicalError> {
        let mf = match params {
            [a, b, c] => MembershipFn::Triangle { a: *a, b: *b, c: *c },
            [a, b, c, d] => MembershipFn::Trapezoid { a: *a, b: *b, c: *c, d: *d },
            _ => {
                return Err(invalid_argument_error(&format!(
                    "Membership function '{}' has {} parameters; expected 3 or 4",
                    set_name, params.len())));
            }
        };
        if !params.windows(2).all(|w| w[0] <= w[1]) {
            return Err(invalid_argument_error(&format!(
                "Membership function '{}' parameters {:?} are not non-decreasing",
                set_name, params)));
        }
        Ok(mf)
    }

    // Degree of membership of `x`, in [0, 1]. Inputs at or beyond the outer
    // feet evaluate to zero, including degenerate zero-width edges.
    pub fn degree(&self, x: f64) -> f64 {
        match *self {
            MembershipFn::Triangle { a, b, c } => {
                if x <= a || x >= c {
                    0.0
                } else if x <= b {
                    if b > a { (x - a) / (b - a) } else { 1.0 }
                } else {
                    if c > b { (c - x) / (c - b) } else { 1.0 }
                }
            }
            MembershipFn::Trapezoid { a, b, c, d } => {
                if x <= a || x >= d {
                    0.0
                } else if x <= b {
                    if b > a { (x - a) / (b - a) } else { 1.0 }
                } else if x <= c {
                    1.0
                } else {
                    if d > c { (d - x) / (d - c) } else { 1.0 }
                }
            }
        }
    }
}

// Maps crisp normalized inputs to per-set membership degrees.
pub struct Fuzzifier {
    // Keyed by input variable name ("theta", "omega"), then by set name.
    inputs: BTreeMap<String, BTreeMap<String, MembershipFn>>,
}

impl Fuzzifier {
    pub fn new(theta_sets: BTreeMap<String, MembershipFn>,
               omega_sets: BTreeMap<String, MembershipFn>) -> Self {
        info!("Fuzzifier initialized with {} theta and {} omega functions",
              theta_sets.len(), omega_sets.len());
        let mut inputs = BTreeMap::new();
        inputs.insert("theta".to_string(), theta_sets);
        inputs.insert("omega".to_string(), omega_sets);
        Fuzzifier{inputs}
    }

    // Fuzzifies one crisp value. Only sets with strictly positive degree
    // appear in the result.
    pub fn fuzzify(&self, input_name: &str, crisp_value: f64)
                   -> Result<HashMap<String, f64>, CanonicalError> {
        let sets = self.inputs.get(input_name).ok_or_else(|| {
            invalid_argument_error(&format!(
                "No membership functions defined for input '{}'", input_name))
        })?;
        let mut fuzzified = HashMap::new();
        for (set_name, mf) in sets {
            let degree = mf.degree(crisp_value);
            if degree > 0.0 {
                fuzzified.insert(set_name.clone(), degree);
            }
        }
        debug!("Fuzzified {}={:.3} -> {} active set(s)",
               input_name, crisp_value, fuzzified.len());
        Ok(fuzzified)
    }
}

// mod tests.
