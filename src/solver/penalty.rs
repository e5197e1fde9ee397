use nalgebra::DVector;

/// Relaxed log-barrier penalty for inequality constraints `g >= 0`.
///
/// Behaves like `-mu * ln(g)` while the constraint is comfortably satisfied
/// and switches to a quadratic extension below `delta`, so the penalty (and
/// its derivatives) stay finite for infeasible iterates.
#[derive(Debug, Clone)]
pub struct RelaxedBarrierPenalty {
    mu: f64,
    delta: f64,
}

impl RelaxedBarrierPenalty {
    pub fn new(mu: f64, delta: f64) -> Self {
        assert!(mu > 0.0 && delta > 0.0);
        Self { mu, delta }
    }

    pub fn value(&self, g: f64) -> f64 {
        if g > self.delta {
            -self.mu * g.ln()
        } else {
            let z = (g - 2.0 * self.delta) / self.delta;
            self.mu * (0.5 * (z * z - 1.0) - self.delta.ln())
        }
    }

    pub fn derivative(&self, g: f64) -> f64 {
        if g > self.delta {
            -self.mu / g
        } else {
            self.mu * (g - 2.0 * self.delta) / (self.delta * self.delta)
        }
    }

    pub fn second_derivative(&self, g: f64) -> f64 {
        if g > self.delta {
            self.mu / (g * g)
        } else {
            self.mu / (self.delta * self.delta)
        }
    }

    /// Total penalty of a block of constraint values.
    pub fn total(&self, values: &DVector<f64>) -> f64 {
        values.iter().map(|&g| self.value(g)).sum()
    }

    /// Squared norm of the violation (negative part) of a block.
    pub fn violation_squared_norm(values: &DVector<f64>) -> f64 {
        values
            .iter()
            .map(|&g| {
                let violation = g.min(0.0);
                violation * violation
            })
            .sum()
    }
}
