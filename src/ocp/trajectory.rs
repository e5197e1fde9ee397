use nalgebra::{DMatrix, DVector};
use ordered_float::OrderedFloat;

use crate::core::interpolation;
use crate::solver::error::DdpError;

/// Sampled (time, state, input) trajectory over one time partition.
///
/// Times are strictly increasing except at a post-event index, where the
/// timestamp repeats to store the pre-jump and post-jump states of a mode
/// switch back to back.
#[derive(Debug, Clone, Default)]
pub struct Trajectory {
    pub times: Vec<f64>,
    pub states: Vec<DVector<f64>>,
    pub inputs: Vec<DVector<f64>>,
    /// Indices of samples that immediately follow an event.
    pub post_event_indices: Vec<usize>,
}

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn clear(&mut self) {
        self.times.clear();
        self.states.clear();
        self.inputs.clear();
        self.post_event_indices.clear();
    }

    pub fn push(&mut self, time: f64, state: DVector<f64>, input: DVector<f64>) {
        self.times.push(time);
        self.states.push(state);
        self.inputs.push(input);
    }

    /// Drops the most recent sample. Post-event markers pointing at it are
    /// intentionally kept; see the rollout's event/operating-point handoff.
    pub fn pop(&mut self) -> Option<f64> {
        self.states.pop();
        self.inputs.pop();
        self.times.pop()
    }

    pub fn state_at(&self, time: f64) -> DVector<f64> {
        interpolation::interpolate_at(time, &self.times, &self.states)
    }

    pub fn input_at(&self, time: f64) -> DVector<f64> {
        interpolation::interpolate_at(time, &self.times, &self.inputs)
    }

    /// Appends all samples of `tail`, offsetting its post-event indices by
    /// the current length.
    pub fn extend(&mut self, tail: Trajectory) {
        let offset = self.len();
        self.times.extend(tail.times);
        self.states.extend(tail.states);
        self.inputs.extend(tail.inputs);
        self.post_event_indices
            .extend(tail.post_event_indices.into_iter().map(|idx| idx + offset));
    }

    /// Verifies the container invariants: equal array lengths and times that
    /// strictly increase except at post-event duplicates.
    pub fn validate(&self) -> Result<(), DdpError> {
        if self.states.len() != self.times.len() || self.inputs.len() != self.times.len() {
            return Err(DdpError::TrajectoryMismatch(format!(
                "times/states/inputs have lengths {}/{}/{}",
                self.times.len(),
                self.states.len(),
                self.inputs.len()
            )));
        }
        for k in 1..self.times.len() {
            let is_post_event = self.post_event_indices.contains(&k);
            let dt = self.times[k] - self.times[k - 1];
            let ordered = if is_post_event { dt >= 0.0 } else { dt > 0.0 };
            if !ordered {
                return Err(DdpError::TrajectoryMismatch(format!(
                    "time not increasing at sample {} (t = {})",
                    k, self.times[k]
                )));
            }
        }
        Ok(())
    }
}

/// Time-indexed affine feedback law `u(t, x) = bias + K x`, with a separate
/// feedforward increment that the line search scales by the learning rate.
///
/// An empty controller signals "roll out the operating trajectory instead".
#[derive(Debug, Clone, Default)]
pub struct LinearController {
    pub times: Vec<f64>,
    pub gains: Vec<DMatrix<f64>>,
    pub biases: Vec<DVector<f64>>,
    pub ff_increments: Vec<DVector<f64>>,
}

impl LinearController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn clear(&mut self) {
        self.times.clear();
        self.gains.clear();
        self.biases.clear();
        self.ff_increments.clear();
    }

    pub fn last_time(&self) -> Option<f64> {
        self.times.last().copied()
    }

    /// Evaluates the feedback law at `(time, state)` by interpolating the
    /// gain and bias arrays. The feedforward increment is not included; the
    /// line search folds it into the bias first.
    pub fn compute_input(&self, time: f64, state: &DVector<f64>) -> DVector<f64> {
        let segment = interpolation::time_segment(time, &self.times);
        let gain = interpolation::interpolate(segment, &self.gains);
        let bias = interpolation::interpolate(segment, &self.biases);
        bias + gain * state
    }

    /// Folds `alpha * ff_increment` into the bias array (the candidate
    /// controller of one line-search rollout).
    pub fn apply_ff_increment(&mut self, alpha: f64) {
        for (bias, increment) in self.biases.iter_mut().zip(&self.ff_increments) {
            *bias += increment * alpha;
        }
    }

    pub fn clear_ff_increments(&mut self) {
        self.ff_increments.clear();
    }

    /// Largest feedforward-increment norm, used for iteration diagnostics.
    pub fn max_ff_increment_norm(&self) -> f64 {
        self.ff_increments
            .iter()
            .map(|increment| OrderedFloat(increment.norm()))
            .max()
            .map(|norm| norm.into_inner())
            .unwrap_or(0.0)
    }

    /// Appends the first `length` entries of `other`.
    pub fn concatenate(&mut self, other: &LinearController, length: usize) {
        let length = length.min(other.len());
        self.times.extend_from_slice(&other.times[..length]);
        self.gains.extend_from_slice(&other.gains[..length]);
        self.biases.extend_from_slice(&other.biases[..length]);
        // The feedforward increments are already consumed by the line search
        // for any controller worth concatenating.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn vec2(a: f64, b: f64) -> DVector<f64> {
        DVector::from_vec(vec![a, b])
    }

    fn vec1(a: f64) -> DVector<f64> {
        DVector::from_vec(vec![a])
    }

    #[test]
    fn test_trajectory_validate_accepts_event_duplicate() {
        let mut trajectory = Trajectory::new();
        trajectory.push(0.0, vec1(0.0), vec1(0.0));
        trajectory.push(1.0, vec1(1.0), vec1(0.0));
        trajectory.push(1.0, vec1(2.0), vec1(0.0));
        trajectory.push(2.0, vec1(3.0), vec1(0.0));
        trajectory.post_event_indices.push(2);
        assert!(trajectory.validate().is_ok());
    }

    #[test]
    fn test_trajectory_validate_rejects_unmarked_duplicate() {
        let mut trajectory = Trajectory::new();
        trajectory.push(0.0, vec1(0.0), vec1(0.0));
        trajectory.push(0.0, vec1(1.0), vec1(0.0));
        assert!(trajectory.validate().is_err());
    }

    #[test]
    fn test_trajectory_extend_offsets_event_indices() {
        let mut head = Trajectory::new();
        head.push(0.0, vec1(0.0), vec1(0.0));
        head.push(1.0, vec1(1.0), vec1(0.0));

        let mut tail = Trajectory::new();
        tail.push(1.0, vec1(2.0), vec1(0.0));
        tail.push(2.0, vec1(3.0), vec1(0.0));
        tail.post_event_indices.push(0);

        head.extend(tail);
        assert_eq!(head.len(), 4);
        assert_eq!(head.post_event_indices, vec![2]);
    }

    #[test]
    fn test_controller_compute_input() {
        let mut controller = LinearController::new();
        controller.times = vec![0.0, 1.0];
        controller.gains = vec![
            DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
            DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
        ];
        controller.biases = vec![vec1(0.5), vec1(0.5)];
        controller.ff_increments = vec![vec1(1.0), vec1(2.0)];

        let u = controller.compute_input(0.5, &vec2(2.0, 7.0));
        assert_relative_eq!(u[0], 2.5);

        controller.apply_ff_increment(0.5);
        let u = controller.compute_input(0.5, &vec2(2.0, 7.0));
        assert_relative_eq!(u[0], 2.5 + 0.5 * 1.5);
        assert_relative_eq!(controller.max_ff_increment_norm(), 2.0);
    }
}
