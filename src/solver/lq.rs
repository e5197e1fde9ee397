use nalgebra::{DMatrix, DVector};

use crate::ocp::constraint::Constraints;
use crate::ocp::cost::Cost;
use crate::ocp::dynamics::Dynamics;
use crate::ocp::reference::ReferenceTrajectory;

use super::error::DdpError;
use super::model_data::{EventLqData, ModelData};
use super::penalty::RelaxedBarrierPenalty;
use super::settings::HessianCorrection;

/// Symmetrizes `m` and pushes its eigenvalues up to at least `floor`.
pub fn make_psd(m: &DMatrix<f64>, floor: f64) -> DMatrix<f64> {
    let symmetric = 0.5 * (m + m.transpose());
    let mut eigen = symmetric.clone().symmetric_eigen();
    let mut modified = false;
    for value in eigen.eigenvalues.iter_mut() {
        if *value < floor {
            *value = floor;
            modified = true;
        }
    }
    if !modified {
        return symmetric;
    }
    &eigen.eigenvectors
        * DMatrix::from_diagonal(&eigen.eigenvalues)
        * eigen.eigenvectors.transpose()
}

/// Applies the configured positive-semi-definiteness correction.
pub fn correct_hessian(m: &DMatrix<f64>, correction: HessianCorrection) -> DMatrix<f64> {
    match correction {
        HessianCorrection::EigenvalueClip { floor } => make_psd(m, floor),
        HessianCorrection::DiagonalShift { shift } => {
            let mut corrected = 0.5 * (m + m.transpose());
            for i in 0..corrected.nrows() {
                corrected[(i, i)] += shift;
            }
            corrected
        }
    }
}

/// Builds the per-sample linear-quadratic model: dynamics linearization,
/// cost quadratization (with the inequality penalty and the state-equality
/// penalty folded in), and the active equality-constraint blocks.
///
/// One instance per worker thread; all providers are private clones.
pub struct LqApproximator {
    pub dynamics: Box<dyn Dynamics>,
    pub cost: Box<dyn Cost>,
    pub constraints: Box<dyn Constraints>,
    pub penalty: RelaxedBarrierPenalty,
    pub hessian_correction: HessianCorrection,
}

impl Clone for LqApproximator {
    fn clone(&self) -> Self {
        Self {
            dynamics: self.dynamics.clone(),
            cost: self.cost.clone(),
            constraints: self.constraints.clone(),
            penalty: self.penalty.clone(),
            hessian_correction: self.hessian_correction,
        }
    }
}

impl LqApproximator {
    fn check_constraint_count(
        &self,
        kind: &'static str,
        count: usize,
    ) -> Result<(), DdpError> {
        let input_dim = self.dynamics.input_dim();
        if count > input_dim {
            Err(DdpError::ConstraintDimension {
                kind,
                count,
                input_dim,
            })
        } else {
            Ok(())
        }
    }

    /// Quadratic model at one intermediate sample. `state_penalty` is the
    /// iteration-dependent coefficient multiplying the state-equality
    /// penalty terms.
    pub fn approximate(
        &mut self,
        mode: usize,
        t: f64,
        x: &DVector<f64>,
        u: &DVector<f64>,
        reference: &ReferenceTrajectory,
        state_penalty: f64,
    ) -> Result<ModelData, DdpError> {
        let (a, b) = self.dynamics.flow_jacobians(mode, t, x, u);
        let expansion = self.cost.stage_expansion(t, x, u, reference);

        let mut q = expansion.value;
        let mut qx = expansion.dfdx;
        let mut qu = expansion.dfdu;
        let mut qxx = expansion.dfdxx;
        let mut quu = expansion.dfduu;
        let mut qux = expansion.dfdux;

        // State-input equality constraints are handled by projection in the
        // backward pass; only their block is collected here.
        let num_eq = self.constraints.num_state_input_eq(t);
        self.check_constraint_count("state-input equality", num_eq)?;
        let eq = self.constraints.state_input_eq(t, x, u);

        // State-only equality constraints enter as a quadratic penalty on
        // the cost expansion (Gauss-Newton in the constraint Jacobian).
        let num_state_eq = self.constraints.num_state_eq(t);
        self.check_constraint_count("state equality", num_state_eq)?;
        let state_eq = self.constraints.state_eq(t, x);
        if num_state_eq > 0 && state_penalty > 0.0 {
            q += 0.5 * state_penalty * state_eq.values.norm_squared();
            qx += state_penalty * state_eq.dfdx.transpose() * &state_eq.values;
            qxx += state_penalty * state_eq.dfdx.transpose() * &state_eq.dfdx;
        }

        // Inequality constraints enter through the relaxed barrier; value
        // and derivatives are folded in so the backward pass and the merit
        // see the same landscape.
        let num_ineq = self.constraints.num_inequality(t);
        let ineq = self.constraints.inequality(t, x, u);
        for row in 0..num_ineq {
            let g = ineq.values[row];
            let gx = ineq.dfdx.row(row).transpose();
            let gu = ineq.dfdu.row(row).transpose();
            let first = self.penalty.derivative(g);
            let second = self.penalty.second_derivative(g);
            q += self.penalty.value(g);
            qx += &gx * first;
            qu += &gu * first;
            qxx += &gx * gx.transpose() * second;
            quu += &gu * gu.transpose() * second;
            qux += &gu * gx.transpose() * second;
        }

        qxx = correct_hessian(&qxx, self.hessian_correction);

        Ok(ModelData {
            time: t,
            a,
            b,
            q,
            qx,
            qu,
            qxx,
            quu,
            qux,
            num_eq,
            e: eq.values,
            e_x: eq.dfdx,
            e_u: eq.dfdu,
            num_state_eq,
            h: state_eq.values,
            h_x: state_eq.dfdx,
            num_ineq,
            g: ineq.values,
        })
    }

    /// Quadratic model at an event time: terminal cost of the ending mode
    /// plus the penalized final-state equality constraint.
    pub fn approximate_event(
        &mut self,
        t: f64,
        x: &DVector<f64>,
        reference: &ReferenceTrajectory,
        state_penalty: f64,
    ) -> Result<EventLqData, DdpError> {
        let expansion = self.cost.terminal_expansion(t, x, reference);
        let mut q = expansion.value;
        let mut qx = expansion.dfdx;
        let mut qxx = expansion.dfdxx;

        let num_final_eq = self.constraints.num_final_state_eq(t);
        self.check_constraint_count("final state equality", num_final_eq)?;
        let block = self.constraints.final_state_eq(t, x);
        if num_final_eq > 0 && state_penalty > 0.0 {
            q += 0.5 * state_penalty * block.values.norm_squared();
            qx += state_penalty * block.dfdx.transpose() * &block.values;
            qxx += state_penalty * block.dfdx.transpose() * &block.dfdx;
        }

        qxx = correct_hessian(&qxx, self.hessian_correction);

        Ok(EventLqData {
            time: t,
            q,
            qx,
            qxx,
            num_final_eq,
            h: block.values,
        })
    }
}
