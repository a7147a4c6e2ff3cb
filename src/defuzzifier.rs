use log::{debug, warn};

// Below this total firing strength the weighted average is considered
// undefined and the output is forced to zero.
const MIN_TOTAL_FIRING: f64 = 1e-4;

// Sugeno weighted-average defuzzification.
pub struct Defuzzifier {}

impl Defuzzifier {
    pub fn new() -> Self {
        Defuzzifier{}
    }

    // Computes u = Σ(Wi·Zi) / Σ(Wi) over the active rules, clamped to
    // [-1, +1] as the final step. An empty rule set or vanishing ΣW yields 0.
    pub fn defuzzify(&self, rule_outputs: &[(f64, f64)]) -> f64 {
        if rule_outputs.is_empty() {
            warn!("No active rules to defuzzify; outputting 0");
            return 0.0;
        }
        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for (w, z) in rule_outputs {
            numerator += w * z;
            denominator += w;
        }
        if denominator < MIN_TOTAL_FIRING {
            warn!("Total firing strength {:.2e} too small; outputting 0",
                  denominator);
            return 0.0;
        }
        let output = numerator / denominator;
        let clamped = output.clamp(-1.0, 1.0);
        if output != clamped {
            warn!("Defuzzified output {:.4} outside range, clamped to {:.4}",
                  output, clamped);
        }
        debug!("Defuzzified output {:.4} from {} active rule(s)",
               clamped, rule_outputs.len());
        clamped
    }
}

// mod tests.
