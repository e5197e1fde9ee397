use nalgebra::DVector;

use crate::core::interpolation;

/// Desired (time, state, input) trajectory that parameterizes the cost.
///
/// An empty reference means "regulate to the origin"; queries then return
/// zero vectors of the requested dimensions.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTrajectory {
    pub times: Vec<f64>,
    pub states: Vec<DVector<f64>>,
    pub inputs: Vec<DVector<f64>>,
}

impl ReferenceTrajectory {
    pub fn origin() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn desired_state(&self, time: f64, state_dim: usize) -> DVector<f64> {
        if self.is_empty() {
            DVector::zeros(state_dim)
        } else {
            interpolation::interpolate_at(time, &self.times, &self.states)
        }
    }

    pub fn desired_input(&self, time: f64, input_dim: usize) -> DVector<f64> {
        if self.is_empty() || self.inputs.is_empty() {
            DVector::zeros(input_dim)
        } else {
            interpolation::interpolate_at(time, &self.times, &self.inputs)
        }
    }
}
