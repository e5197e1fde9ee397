//! Linear-quadratic problem building blocks.
//!
//! These concrete providers cover the textbook regulator problems used by
//! the demo CLI, the integration tests, and the benchmarks; real deployments
//! supply their own `Dynamics`/`Cost` implementations.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use super::cost::{Cost, StageExpansion, StateExpansion};
use super::dynamics::Dynamics;
use super::reference::ReferenceTrajectory;

/// Switched linear system `dx/dt = A_m x + B_m u` with one (A, B) pair per
/// mode and an optional linear jump map `x+ = G_m x` applied when leaving
/// mode `m`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchedLinearDynamics {
    pub flow_matrices: Vec<DMatrix<f64>>,
    pub input_matrices: Vec<DMatrix<f64>>,
    /// One jump matrix per mode; `None` means no state reset anywhere.
    pub jump_matrices: Option<Vec<DMatrix<f64>>>,
}

impl SwitchedLinearDynamics {
    pub fn time_invariant(a: DMatrix<f64>, b: DMatrix<f64>) -> Self {
        Self {
            flow_matrices: vec![a],
            input_matrices: vec![b],
            jump_matrices: None,
        }
    }

    pub fn new(flow_matrices: Vec<DMatrix<f64>>, input_matrices: Vec<DMatrix<f64>>) -> Self {
        assert_eq!(flow_matrices.len(), input_matrices.len());
        assert!(!flow_matrices.is_empty(), "need at least one mode");
        Self {
            flow_matrices,
            input_matrices,
            jump_matrices: None,
        }
    }

    pub fn with_jump_matrices(mut self, jump_matrices: Vec<DMatrix<f64>>) -> Self {
        assert_eq!(jump_matrices.len(), self.flow_matrices.len());
        self.jump_matrices = Some(jump_matrices);
        self
    }

    fn mode_index(&self, mode: usize) -> usize {
        mode.min(self.flow_matrices.len() - 1)
    }
}

impl Dynamics for SwitchedLinearDynamics {
    fn state_dim(&self) -> usize {
        self.flow_matrices[0].nrows()
    }

    fn input_dim(&self) -> usize {
        self.input_matrices[0].ncols()
    }

    fn flow(&mut self, mode: usize, _t: f64, x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
        let m = self.mode_index(mode);
        &self.flow_matrices[m] * x + &self.input_matrices[m] * u
    }

    fn jump(&mut self, mode: usize, _t: f64, x: &DVector<f64>) -> DVector<f64> {
        match &self.jump_matrices {
            Some(jumps) => &jumps[self.mode_index(mode)] * x,
            None => x.clone(),
        }
    }

    fn flow_jacobians(
        &mut self,
        mode: usize,
        _t: f64,
        _x: &DVector<f64>,
        _u: &DVector<f64>,
    ) -> (DMatrix<f64>, DMatrix<f64>) {
        let m = self.mode_index(mode);
        (self.flow_matrices[m].clone(), self.input_matrices[m].clone())
    }

    fn clone_boxed(&self) -> Box<dyn Dynamics> {
        Box::new(self.clone())
    }
}

/// Quadratic tracking cost
/// `0.5 (x - x_d)' Q (x - x_d) + 0.5 (u - u_d)' R (u - u_d)` with terminal
/// term `0.5 (x - x_d)' Qf (x - x_d)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuadraticCost {
    pub q: DMatrix<f64>,
    pub r: DMatrix<f64>,
    pub q_final: DMatrix<f64>,
}

impl QuadraticCost {
    pub fn new(q: DMatrix<f64>, r: DMatrix<f64>, q_final: DMatrix<f64>) -> Self {
        assert_eq!(q.nrows(), q.ncols());
        assert_eq!(r.nrows(), r.ncols());
        assert_eq!(q.nrows(), q_final.nrows());
        Self { q, r, q_final }
    }
}

impl Cost for QuadraticCost {
    fn stage_cost(
        &mut self,
        t: f64,
        x: &DVector<f64>,
        u: &DVector<f64>,
        reference: &ReferenceTrajectory,
    ) -> f64 {
        let dx = x - reference.desired_state(t, x.len());
        let du = u - reference.desired_input(t, u.len());
        0.5 * (dx.dot(&(&self.q * &dx)) + du.dot(&(&self.r * &du)))
    }

    fn stage_expansion(
        &mut self,
        t: f64,
        x: &DVector<f64>,
        u: &DVector<f64>,
        reference: &ReferenceTrajectory,
    ) -> StageExpansion {
        let dx = x - reference.desired_state(t, x.len());
        let du = u - reference.desired_input(t, u.len());
        let qx = &self.q * &dx;
        let ru = &self.r * &du;
        StageExpansion {
            value: 0.5 * (dx.dot(&qx) + du.dot(&ru)),
            dfdx: qx,
            dfdu: ru,
            dfdxx: self.q.clone(),
            dfduu: self.r.clone(),
            dfdux: DMatrix::zeros(u.len(), x.len()),
        }
    }

    fn terminal_cost(&mut self, t: f64, x: &DVector<f64>, reference: &ReferenceTrajectory) -> f64 {
        let dx = x - reference.desired_state(t, x.len());
        0.5 * dx.dot(&(&self.q_final * &dx))
    }

    fn terminal_expansion(
        &mut self,
        t: f64,
        x: &DVector<f64>,
        reference: &ReferenceTrajectory,
    ) -> StateExpansion {
        let dx = x - reference.desired_state(t, x.len());
        let qx = &self.q_final * &dx;
        StateExpansion {
            value: 0.5 * dx.dot(&qx),
            dfdx: qx,
            dfdxx: self.q_final.clone(),
        }
    }

    fn clone_boxed(&self) -> Box<dyn Cost> {
        Box::new(self.clone())
    }
}
