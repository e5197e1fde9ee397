use iter_num_tools::lin_space;
use nalgebra::DVector;
use tracing::debug;

use crate::core::ode::{rk4_step, uniform_step_count, CancellationToken};
use crate::ocp::dynamics::Dynamics;
use crate::ocp::mode_schedule::ModeSchedule;
use crate::ocp::operating_point::OperatingPoint;
use crate::ocp::trajectory::{LinearController, Trajectory};

use super::error::DdpError;

fn all_finite(x: &DVector<f64>) -> bool {
    x.iter().all(|value| value.is_finite())
}

/// Integrates the closed-loop dynamics under a time-varying affine feedback
/// law, splitting the query window at every mode-switch event.
///
/// One engine per worker thread; the dynamics provider is a private clone.
pub struct RolloutEngine {
    dynamics: Box<dyn Dynamics>,
    time_step: f64,
}

impl Clone for RolloutEngine {
    fn clone(&self) -> Self {
        Self {
            dynamics: self.dynamics.clone(),
            time_step: self.time_step,
        }
    }
}

impl RolloutEngine {
    pub fn new(dynamics: Box<dyn Dynamics>, time_step: f64) -> Self {
        assert!(time_step > 0.0);
        Self {
            dynamics,
            time_step,
        }
    }

    /// Rolls out `[t_begin, t_final]` from `x_begin`, appending samples to
    /// `trajectory`. Returns the final state.
    ///
    /// At each event inside the window the pre-jump sample is recorded, the
    /// jump map applied, and the post-jump sample recorded under a repeated
    /// timestamp with its index pushed to `post_event_indices`.
    pub fn run(
        &mut self,
        t_begin: f64,
        x_begin: &DVector<f64>,
        t_final: f64,
        controller: &LinearController,
        schedule: &ModeSchedule,
        trajectory: &mut Trajectory,
        cancel: &CancellationToken,
    ) -> Result<DVector<f64>, DdpError> {
        let mut t = t_begin;
        let mut x = x_begin.clone();
        let events: Vec<f64> = schedule.events_in_closed_end(t_begin, t_final).to_vec();
        let ends_on_event = events.last().map_or(false, |&te| te >= t_final);

        for &event_time in &events {
            x = self.integrate_segment(t, &x, event_time, controller, schedule, trajectory, cancel)?;
            // Pre-jump sample.
            let u = controller.compute_input(event_time, &x);
            trajectory.push(event_time, x.clone(), u);

            // Apply the jump map of the mode being left. The post-jump twin
            // (same timestamp) is the next recorded sample: pushed here when
            // the window ends on this event, or as the start sample of the
            // next integration segment otherwise.
            let leaving_mode = schedule.mode_at(0.5 * (t + event_time));
            x = self.dynamics.jump(leaving_mode, event_time, &x);
            trajectory.post_event_indices.push(trajectory.len());
            if event_time >= t_final {
                let u_post = controller.compute_input(event_time, &x);
                trajectory.push(event_time, x.clone(), u_post);
            }
            t = event_time;
        }

        if !ends_on_event {
            x = self.integrate_segment(t, &x, t_final, controller, schedule, trajectory, cancel)?;
            let u = controller.compute_input(t_final, &x);
            trajectory.push(t_final, x.clone(), u);
        }

        if !all_finite(&x) {
            return Err(DdpError::RolloutDiverged { time: t_final });
        }
        Ok(x)
    }

    /// Event-free integration of `[t_begin, t_final)`; pushes one sample per
    /// step start and returns the state at `t_final` without recording it.
    fn integrate_segment(
        &mut self,
        t_begin: f64,
        x_begin: &DVector<f64>,
        t_final: f64,
        controller: &LinearController,
        schedule: &ModeSchedule,
        trajectory: &mut Trajectory,
        cancel: &CancellationToken,
    ) -> Result<DVector<f64>, DdpError> {
        if t_final <= t_begin {
            return Ok(x_begin.clone());
        }
        // Event times themselves belong to the next mode, so any interior
        // point of the open segment identifies the active mode.
        let mode = schedule.mode_at(0.5 * (t_begin + t_final));
        let n_steps = uniform_step_count(t_begin, t_final, self.time_step);
        let dt = (t_final - t_begin) / (n_steps as f64);

        let mut x = x_begin.clone();
        for t in lin_space(t_begin..t_final, n_steps) {
            if cancel.is_cancelled() {
                return Err(DdpError::RolloutCancelled);
            }
            let u = controller.compute_input(t, &x);
            trajectory.push(t, x.clone(), u);

            let dynamics = &mut self.dynamics;
            x = rk4_step(dt, t, &x, &mut |t_stage, x_stage: &DVector<f64>| {
                let u_stage = controller.compute_input(t_stage, x_stage);
                dynamics.flow(mode, t_stage, x_stage, &u_stage)
            });
        }
        Ok(x)
    }
}

/// Emits the operating-point provider's samples over a query window; used
/// wherever no controller coverage exists. The provider defines the
/// trajectory directly, so nothing is integrated.
pub struct OperatingPointRollout {
    provider: Box<dyn OperatingPoint>,
    time_step: f64,
}

impl Clone for OperatingPointRollout {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
            time_step: self.time_step,
        }
    }
}

impl OperatingPointRollout {
    pub fn new(provider: Box<dyn OperatingPoint>, time_step: f64) -> Self {
        assert!(time_step > 0.0);
        Self {
            provider,
            time_step,
        }
    }

    pub fn run(
        &mut self,
        t_begin: f64,
        t_final: f64,
        schedule: &ModeSchedule,
        trajectory: &mut Trajectory,
        cancel: &CancellationToken,
    ) -> Result<DVector<f64>, DdpError> {
        let mut t = t_begin;
        let events: Vec<f64> = schedule.events_in_closed_end(t_begin, t_final).to_vec();
        let ends_on_event = events.last().map_or(false, |&te| te >= t_final);

        for &event_time in &events {
            self.sample_segment(t, event_time, schedule, trajectory, cancel)?;
            let pre_mode = schedule.mode_at(0.5 * (t + event_time));
            let (x_pre, u_pre) = self.provider.state_input(event_time, pre_mode);
            trajectory.push(event_time, x_pre, u_pre);

            // The post-event twin is the next recorded sample: pushed here
            // when the window ends on this event, or as the start sample of
            // the next segment (queried in the new mode) otherwise.
            trajectory.post_event_indices.push(trajectory.len());
            if event_time >= t_final {
                let post_mode = schedule.mode_at(event_time);
                let (x_post, u_post) = self.provider.state_input(event_time, post_mode);
                trajectory.push(event_time, x_post, u_post);
            }
            t = event_time;
        }

        if !ends_on_event {
            self.sample_segment(t, t_final, schedule, trajectory, cancel)?;
            let mode = schedule.mode_at(t_final);
            let (x_final, u_final) = self.provider.state_input(t_final, mode);
            trajectory.push(t_final, x_final, u_final);
        }

        let x_final = trajectory
            .states
            .last()
            .cloned()
            .unwrap_or_else(|| DVector::zeros(0));
        if !all_finite(&x_final) {
            return Err(DdpError::RolloutDiverged { time: t_final });
        }
        Ok(x_final)
    }

    fn sample_segment(
        &mut self,
        t_begin: f64,
        t_final: f64,
        schedule: &ModeSchedule,
        trajectory: &mut Trajectory,
        cancel: &CancellationToken,
    ) -> Result<(), DdpError> {
        if t_final <= t_begin {
            return Ok(());
        }
        let mode = schedule.mode_at(0.5 * (t_begin + t_final));
        let n_steps = uniform_step_count(t_begin, t_final, self.time_step);
        for t in lin_space(t_begin..t_final, n_steps) {
            if cancel.is_cancelled() {
                return Err(DdpError::RolloutCancelled);
            }
            let (x, u) = self.provider.state_input(t, mode);
            trajectory.push(t, x, u);
        }
        Ok(())
    }
}

/// Rolls out the full horizon across all active partitions, using the
/// controllers where they have coverage and the operating-point provider
/// everywhere else.
///
/// Within each partition the window is split at the controller coverage
/// boundary; a controller-produced sample sitting directly past an event is
/// replaced by the operating-point continuation so the post-jump handoff
/// stays consistent.
pub struct RolloutCoordinator {
    pub engine: RolloutEngine,
    pub operating: OperatingPointRollout,
}

impl Clone for RolloutCoordinator {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            operating: self.operating.clone(),
        }
    }
}

impl RolloutCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn rollout_trajectories(
        &mut self,
        controllers: &[LinearController],
        partition_times: &[f64],
        init_active: usize,
        final_active: usize,
        init_time: f64,
        init_state: &DVector<f64>,
        final_time: f64,
        schedule: &ModeSchedule,
        cancel: &CancellationToken,
    ) -> Result<Vec<Trajectory>, DdpError> {
        let num_partitions = partition_times.len() - 1;
        if controllers.len() != num_partitions {
            return Err(DdpError::ControllerCountMismatch {
                controllers: controllers.len(),
                partitions: num_partitions,
            });
        }

        // Find how far contiguous controller coverage extends; a gap ends it
        // (controllers cannot have holes).
        let mut controller_available_till = init_time;
        let mut partition_of_last_controller = init_active;
        for i in init_active..=final_active {
            if let Some(last) = controllers[i].last_time() {
                controller_available_till = last;
                partition_of_last_controller = i;
            } else {
                break;
            }
        }

        // Use the controller up to its end, extended to the first event past
        // it (or the final time). With no initial coverage at all, use the
        // operating point everywhere.
        let mut use_controller_till = init_time;
        if !controllers[init_active].is_empty() {
            use_controller_till = final_time;
            for &event_time in schedule.event_times() {
                if event_time >= controller_available_till {
                    use_controller_till = event_time.min(final_time);
                    break;
                }
            }
        }
        debug!(
            controller_available_till,
            use_controller_till, "rollout coverage"
        );

        let mut trajectories = vec![Trajectory::new(); num_partitions];
        let mut x_current = init_state.clone();

        for i in init_active..=final_active {
            let t0 = if i == init_active {
                init_time
            } else {
                partition_times[i]
            };
            let tf = if i == final_active {
                final_time
            } else {
                partition_times[i + 1]
            };

            let controller_until = t0.max(use_controller_till.min(tf));
            let trajectory = &mut trajectories[i];

            if t0 < controller_until {
                let controller = &controllers[i.min(partition_of_last_controller)];
                x_current = self.engine.run(
                    t0,
                    &x_current,
                    controller_until,
                    controller,
                    schedule,
                    trajectory,
                    cancel,
                )?;
            }

            if controller_until < tf {
                let mut op_from = controller_until;
                // If the controller segment ended directly past a jump, drop
                // its final sample and restart the operating-point segment at
                // the post-jump timestamp; the event marker stays and will
                // point at the first operating-point sample.
                if trajectory
                    .post_event_indices
                    .last()
                    .map_or(false, |&idx| idx == trajectory.len().wrapping_sub(1))
                {
                    op_from = trajectory.pop().unwrap_or(controller_until);
                }

                let mut tail = Trajectory::new();
                x_current =
                    self.operating
                        .run(op_from, tf, schedule, &mut tail, cancel)?;
                trajectory.extend(tail);
            }
        }

        Ok(trajectories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocp::linear::SwitchedLinearDynamics;
    use crate::ocp::operating_point::FixedOperatingPoint;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    fn constant_dynamics() -> SwitchedLinearDynamics {
        // x' = 0 in every mode, jump doubles the state when leaving mode 0.
        SwitchedLinearDynamics::new(
            vec![DMatrix::zeros(1, 1), DMatrix::zeros(1, 1)],
            vec![DMatrix::zeros(1, 1), DMatrix::zeros(1, 1)],
        )
        .with_jump_matrices(vec![
            DMatrix::from_row_slice(1, 1, &[2.0]),
            DMatrix::identity(1, 1),
        ])
    }

    fn zero_controller() -> LinearController {
        LinearController {
            times: vec![0.0, 10.0],
            gains: vec![DMatrix::zeros(1, 1), DMatrix::zeros(1, 1)],
            biases: vec![DVector::zeros(1), DVector::zeros(1)],
            ff_increments: vec![DVector::zeros(1), DVector::zeros(1)],
        }
    }

    #[test]
    fn test_event_produces_repeated_timestamp_and_jump() {
        let mut engine = RolloutEngine::new(Box::new(constant_dynamics()), 0.1);
        let schedule = ModeSchedule::new(vec![0.5], vec![0, 1]);
        let mut trajectory = Trajectory::new();
        let x_final = engine
            .run(
                0.0,
                &DVector::from_vec(vec![1.0]),
                1.0,
                &zero_controller(),
                &schedule,
                &mut trajectory,
                &CancellationToken::new(),
            )
            .unwrap();

        assert_relative_eq!(x_final[0], 2.0);
        assert_eq!(trajectory.post_event_indices.len(), 1);
        let post = trajectory.post_event_indices[0];
        assert_relative_eq!(trajectory.times[post - 1], 0.5);
        assert_relative_eq!(trajectory.times[post], 0.5);
        assert_relative_eq!(trajectory.states[post - 1][0], 1.0);
        assert_relative_eq!(trajectory.states[post][0], 2.0);
        assert!(trajectory.validate().is_ok());
        assert_relative_eq!(*trajectory.times.last().unwrap(), 1.0);
    }

    #[test]
    fn test_divergence_is_reported() {
        struct BlowUp;
        impl Dynamics for BlowUp {
            fn state_dim(&self) -> usize {
                1
            }
            fn input_dim(&self) -> usize {
                1
            }
            fn flow(
                &mut self,
                _mode: usize,
                _t: f64,
                _x: &DVector<f64>,
                _u: &DVector<f64>,
            ) -> DVector<f64> {
                DVector::from_vec(vec![f64::NAN])
            }
            fn flow_jacobians(
                &mut self,
                _mode: usize,
                _t: f64,
                _x: &DVector<f64>,
                _u: &DVector<f64>,
            ) -> (DMatrix<f64>, DMatrix<f64>) {
                (DMatrix::zeros(1, 1), DMatrix::zeros(1, 1))
            }
            fn clone_boxed(&self) -> Box<dyn Dynamics> {
                Box::new(BlowUp)
            }
        }

        let mut engine = RolloutEngine::new(Box::new(BlowUp), 0.1);
        let schedule = ModeSchedule::single_mode(0);
        let mut trajectory = Trajectory::new();
        let result = engine.run(
            0.0,
            &DVector::from_vec(vec![1.0]),
            1.0,
            &zero_controller(),
            &schedule,
            &mut trajectory,
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(DdpError::RolloutDiverged { .. })));
    }

    #[test]
    fn test_cancellation_aborts_rollout() {
        let mut engine = RolloutEngine::new(Box::new(constant_dynamics()), 0.1);
        let schedule = ModeSchedule::single_mode(0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut trajectory = Trajectory::new();
        let result = engine.run(
            0.0,
            &DVector::from_vec(vec![1.0]),
            1.0,
            &zero_controller(),
            &schedule,
            &mut trajectory,
            &cancel,
        );
        assert!(matches!(result, Err(DdpError::RolloutCancelled)));
    }

    #[test]
    fn test_coordinator_falls_back_to_operating_point() {
        let mut coordinator = RolloutCoordinator {
            engine: RolloutEngine::new(Box::new(constant_dynamics()), 0.1),
            operating: OperatingPointRollout::new(
                Box::new(FixedOperatingPoint::new(
                    DVector::from_vec(vec![7.0]),
                    DVector::zeros(1),
                )),
                0.1,
            ),
        };
        let schedule = ModeSchedule::single_mode(0);
        // Empty controllers: everything comes from the operating point.
        let controllers = vec![LinearController::new(), LinearController::new()];
        let trajectories = coordinator
            .rollout_trajectories(
                &controllers,
                &[0.0, 1.0, 2.0],
                0,
                1,
                0.0,
                &DVector::from_vec(vec![1.0]),
                2.0,
                &schedule,
                &CancellationToken::new(),
            )
            .unwrap();

        assert_eq!(trajectories.len(), 2);
        for trajectory in &trajectories {
            assert!(!trajectory.is_empty());
            for state in &trajectory.states {
                assert_relative_eq!(state[0], 7.0);
            }
        }
        assert_relative_eq!(trajectories[0].times[0], 0.0);
        assert_relative_eq!(*trajectories[1].times.last().unwrap(), 2.0);
    }

    #[test]
    fn test_coordinator_splits_at_controller_coverage() {
        let mut coordinator = RolloutCoordinator {
            engine: RolloutEngine::new(Box::new(constant_dynamics()), 0.1),
            operating: OperatingPointRollout::new(
                Box::new(FixedOperatingPoint::new(
                    DVector::from_vec(vec![5.0]),
                    DVector::zeros(1),
                )),
                0.1,
            ),
        };
        // Event at the partition boundary ends the controller coverage.
        let schedule = ModeSchedule::new(vec![1.0], vec![0, 1]);
        let mut short_controller = zero_controller();
        short_controller.times = vec![0.0, 1.0];
        let controllers = vec![short_controller, LinearController::new()];
        let trajectories = coordinator
            .rollout_trajectories(
                &controllers,
                &[0.0, 1.0, 2.0],
                0,
                1,
                0.0,
                &DVector::from_vec(vec![1.0]),
                2.0,
                &schedule,
                &CancellationToken::new(),
            )
            .unwrap();

        // First partition integrated (state stays 1, doubled by the jump at
        // its end), second supplied by the operating point (state 5).
        assert_relative_eq!(trajectories[0].states[0][0], 1.0);
        let post = *trajectories[0].post_event_indices.last().unwrap();
        assert_eq!(post, trajectories[0].len() - 1);
        assert_relative_eq!(trajectories[0].states[post][0], 2.0);
        for state in &trajectories[1].states {
            assert_relative_eq!(state[0], 5.0);
        }
    }

    #[test]
    fn test_controller_count_mismatch_is_fatal() {
        let mut coordinator = RolloutCoordinator {
            engine: RolloutEngine::new(Box::new(constant_dynamics()), 0.1),
            operating: OperatingPointRollout::new(
                Box::new(FixedOperatingPoint::new(
                    DVector::zeros(1),
                    DVector::zeros(1),
                )),
                0.1,
            ),
        };
        let schedule = ModeSchedule::single_mode(0);
        let result = coordinator.rollout_trajectories(
            &[LinearController::new()],
            &[0.0, 1.0, 2.0],
            0,
            1,
            0.0,
            &DVector::zeros(1),
            2.0,
            &schedule,
            &CancellationToken::new(),
        );
        assert!(matches!(
            result,
            Err(DdpError::ControllerCountMismatch { .. })
        ));
    }
}
