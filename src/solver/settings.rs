use serde::{Deserialize, Serialize};

use super::error::DdpError;

/// How indefinite cost Hessians are projected to the positive semi-definite
/// cone before the backward pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HessianCorrection {
    /// Symmetric eigendecomposition with eigenvalues clamped from below.
    EigenvalueClip { floor: f64 },
    /// Add a fixed multiple of the identity.
    DiagonalShift { shift: f64 },
}

impl Default for HessianCorrection {
    fn default() -> Self {
        HessianCorrection::EigenvalueClip { floor: 1e-6 }
    }
}

/// Solver configuration. Loadable from JSON; all fields have defaults so a
/// config file only needs to name what it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Size of the worker thread pool used by every parallel phase.
    pub num_threads: usize,
    pub max_iterations: usize,

    /// Largest candidate learning rate tried by the line search.
    pub max_learning_rate: f64,
    /// Candidates below this rate are not evaluated.
    pub min_learning_rate: f64,
    /// Geometric contraction between successive candidates.
    pub contraction_rate: f64,
    /// Slope of the sufficient-decrease acceptance rule
    /// `merit < baseline * (1 - armijo_slope * alpha)`.
    pub armijo_slope: f64,

    /// Convergence: threshold on the cost change between iterations.
    pub min_rel_cost: f64,
    /// Convergence: absolute bound on the state-input equality ISE.
    pub min_abs_constraint_ise: f64,
    /// Convergence: threshold on the equality-ISE change between iterations.
    pub min_rel_constraint_ise: f64,

    /// Maximum integration step of the forward rollout.
    pub time_step: f64,

    pub hessian_correction: HessianCorrection,

    /// Coefficient and geometric base of the state-equality penalty; the
    /// effective penalty is `coeff * base^iteration`.
    pub state_penalty_coeff: f64,
    pub state_penalty_base: f64,

    /// Relaxed-barrier parameters for inequality constraints.
    pub inequality_penalty_mu: f64,
    pub inequality_penalty_delta: f64,

    /// Solve all partitions in parallel already at iteration zero instead of
    /// honoring the cross-partition dependency chain sequentially once.
    pub parallel_riccati_from_start: bool,

    /// Return a feedback controller from `primal_solution` instead of the
    /// feedforward input trajectory.
    pub use_feedback_policy: bool,

    /// Verify cached-tail corrections by re-interpolation (expensive).
    pub debug_caching: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            num_threads: 4,
            max_iterations: 15,
            max_learning_rate: 1.0,
            min_learning_rate: 0.05,
            contraction_rate: 0.5,
            armijo_slope: 1e-3,
            min_rel_cost: 1e-3,
            min_abs_constraint_ise: 1e-3,
            min_rel_constraint_ise: 1e-3,
            time_step: 0.01,
            hessian_correction: HessianCorrection::default(),
            state_penalty_coeff: 100.0,
            state_penalty_base: 1.1,
            inequality_penalty_mu: 0.1,
            inequality_penalty_delta: 1e-3,
            parallel_riccati_from_start: false,
            use_feedback_policy: true,
            debug_caching: false,
        }
    }
}

impl Settings {
    /// Validates the configuration; every violation here is a configuration
    /// fault raised before the solver touches any numerics.
    pub fn validate(&self) -> Result<(), DdpError> {
        if self.num_threads == 0 {
            return Err(DdpError::InvalidSettings(
                "num_threads must be at least 1".to_owned(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(DdpError::InvalidSettings(
                "max_iterations must be at least 1".to_owned(),
            ));
        }
        if !(self.max_learning_rate.is_finite() && self.max_learning_rate > 0.0) {
            return Err(DdpError::InvalidSettings(
                "max_learning_rate must be positive and finite".to_owned(),
            ));
        }
        if self.min_learning_rate <= 0.0 || self.min_learning_rate > self.max_learning_rate {
            return Err(DdpError::InvalidSettings(format!(
                "learning-rate bounds are inverted: min = {}, max = {}",
                self.min_learning_rate, self.max_learning_rate
            )));
        }
        if !(self.contraction_rate > 0.0 && self.contraction_rate < 1.0) {
            return Err(DdpError::InvalidSettings(
                "contraction_rate must lie in (0, 1)".to_owned(),
            ));
        }
        if self.time_step <= 0.0 {
            return Err(DdpError::InvalidSettings(
                "time_step must be positive".to_owned(),
            ));
        }
        if self.state_penalty_coeff < 0.0 || self.state_penalty_base < 1.0 {
            return Err(DdpError::InvalidSettings(
                "state penalty must have coeff >= 0 and base >= 1".to_owned(),
            ));
        }
        if self.inequality_penalty_mu <= 0.0 || self.inequality_penalty_delta <= 0.0 {
            return Err(DdpError::InvalidSettings(
                "relaxed-barrier parameters must be positive".to_owned(),
            ));
        }
        match self.hessian_correction {
            HessianCorrection::EigenvalueClip { floor } if floor < 0.0 => {
                return Err(DdpError::InvalidSettings(
                    "eigenvalue floor must be non-negative".to_owned(),
                ));
            }
            HessianCorrection::DiagonalShift { shift } if shift < 0.0 => {
                return Err(DdpError::InvalidSettings(
                    "diagonal shift must be non-negative".to_owned(),
                ));
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn test_inverted_learning_rates_rejected() {
        let settings = Settings {
            min_learning_rate: 2.0,
            max_learning_rate: 1.0,
            ..Settings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(DdpError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_zero_threads_rejected() {
        let settings = Settings {
            num_threads: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_settings_deserialize_with_partial_fields() {
        let settings: Settings =
            serde_json::from_str(r#"{"num_threads": 2, "max_iterations": 3}"#).unwrap();
        assert_eq!(settings.num_threads, 2);
        assert_eq!(settings.max_iterations, 3);
        assert_eq!(settings.time_step, Settings::default().time_step);
    }
}
