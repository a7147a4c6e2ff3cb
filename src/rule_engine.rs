use std::collections::HashMap;

use log::{debug, info};

// First-order Sugeno consequent: Z = theta_coeff·s_θ·θ + omega_coeff·s_ω·ω + bias.
// Both coefficients are non-positive (checked at config load) so every rule's
// contribution opposes the error.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleConsequent {
    pub theta_coeff: f64,
    pub omega_coeff: f64,
    pub bias: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub theta_set: String,
    pub omega_set: String,
    pub consequent: RuleConsequent,
}

// Evaluates a Sugeno-type fuzzy rule base. Firing strength is the fuzzy OR
// (max) of the antecedent membership degrees; the crisp output is the linear
// consequent on the normalized crisp inputs.
pub struct RuleEngine {
    rules: Vec<Rule>,
    theta_scale: f64,
    omega_scale: f64,
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>, theta_scale: f64, omega_scale: f64) -> Self {
        info!("Rule engine initialized with {} rules", rules.len());
        RuleEngine{rules, theta_scale, omega_scale}
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    // Evaluates every rule against the fuzzified inputs. Returns (W, Z) for
    // each rule with W > 0, in rule-declaration order.
    pub fn evaluate(&self,
                    fuzzified_theta: &HashMap<String, f64>,
                    fuzzified_omega: &HashMap<String, f64>,
                    crisp_theta: f64,
                    crisp_omega: f64) -> Vec<(f64, f64)> {
        let mut active_rules = Vec::with_capacity(self.rules.len());
        for (i, rule) in self.rules.iter().enumerate() {
            let degree_theta =
                fuzzified_theta.get(&rule.theta_set).copied().unwrap_or(0.0);
            let degree_omega =
                fuzzified_omega.get(&rule.omega_set).copied().unwrap_or(0.0);

            let firing_strength = f64::max(degree_theta, degree_omega);
            if firing_strength <= 0.0 {
                continue;
            }
            let z = rule.consequent.theta_coeff * self.theta_scale * crisp_theta
                + rule.consequent.omega_coeff * self.omega_scale * crisp_omega
                + rule.consequent.bias;
            debug!("Rule {} fired: W={:.3} Z={:.3} (theta is {} OR omega is {})",
                   i, firing_strength, z, rule.theta_set, rule.omega_set);
            active_rules.push((firing_strength, z));
        }
        active_rules
    }
}

// mod tests.
