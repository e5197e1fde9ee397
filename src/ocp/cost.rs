use nalgebra::{DMatrix, DVector};

use super::reference::ReferenceTrajectory;

/// Second-order expansion of the stage cost around a (state, input) sample.
#[derive(Debug, Clone)]
pub struct StageExpansion {
    pub value: f64,
    pub dfdx: DVector<f64>,
    pub dfdu: DVector<f64>,
    pub dfdxx: DMatrix<f64>,
    pub dfduu: DMatrix<f64>,
    /// Mixed derivative, laid out input-by-state (`input_dim x state_dim`).
    pub dfdux: DMatrix<f64>,
}

/// Second-order expansion of a state-only cost (terminal or event cost).
#[derive(Debug, Clone)]
pub struct StateExpansion {
    pub value: f64,
    pub dfdx: DVector<f64>,
    pub dfdxx: DMatrix<f64>,
}

/// Cost functional: running cost plus a terminal/event cost, parameterized
/// by a desired reference trajectory.
///
/// Worker threads hold independent clones; implementations are free to keep
/// mutable scratch state.
pub trait Cost: Send + Sync {
    fn stage_cost(
        &mut self,
        t: f64,
        x: &DVector<f64>,
        u: &DVector<f64>,
        reference: &ReferenceTrajectory,
    ) -> f64;

    fn stage_expansion(
        &mut self,
        t: f64,
        x: &DVector<f64>,
        u: &DVector<f64>,
        reference: &ReferenceTrajectory,
    ) -> StageExpansion;

    fn terminal_cost(&mut self, t: f64, x: &DVector<f64>, reference: &ReferenceTrajectory) -> f64;

    fn terminal_expansion(
        &mut self,
        t: f64,
        x: &DVector<f64>,
        reference: &ReferenceTrajectory,
    ) -> StateExpansion;

    fn clone_boxed(&self) -> Box<dyn Cost>;
}

impl Clone for Box<dyn Cost> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}
