//! DDP outer loop: rollout, LQ approximation, backward Riccati pass,
//! controller synthesis, and line search, iterated to convergence, with the
//! trajectory caching and rewind bookkeeping needed by a receding-horizon
//! MPC driver.

use nalgebra::DVector;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::Serialize;
use tracing::{debug, info};

use crate::core::lookup;
use crate::core::ode::CancellationToken;
use crate::core::timing::BenchmarkTimers;
use crate::ocp::constraint::Constraints;
use crate::ocp::cost::{Cost, StateExpansion};
use crate::ocp::dynamics::Dynamics;
use crate::ocp::mode_schedule::ModeSchedule;
use crate::ocp::operating_point::OperatingPoint;
use crate::ocp::reference::ReferenceTrajectory;
use crate::ocp::trajectory::{LinearController, Trajectory};

use super::cache;
use super::error::DdpError;
use super::line_search::{self, LineSearchSchedule};
use super::lq::{correct_hessian, LqApproximator};
use super::model_data::{EventLqData, ModelData};
use super::penalty::RelaxedBarrierPenalty;
use super::riccati::{
    compute_gains, distribute_partitions, solve_partition, TerminalCondition, ValueFunctionData,
};
use super::rollout::{OperatingPointRollout, RolloutCoordinator, RolloutEngine};
use super::settings::Settings;

/// Cost and constraint measures of one rollout.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceIndex {
    /// Integrated cost including event and terminal terms.
    pub cost: f64,
    /// Cost plus all constraint penalties; the line-search ranking measure.
    pub merit: f64,
    pub state_input_eq_ise: f64,
    pub state_eq_ise: f64,
    pub final_eq_ise: f64,
    pub inequality_ise: f64,
    pub inequality_penalty: f64,
}

/// Per-iteration diagnostics, kept for the whole solve.
#[derive(Debug, Clone, Serialize)]
pub struct IterationLog {
    pub iteration: usize,
    pub cost: f64,
    pub merit: f64,
    pub state_input_eq_ise: f64,
    pub state_eq_ise: f64,
    pub learning_rate: f64,
}

/// Concatenated solution of the last solve.
#[derive(Debug, Clone)]
pub struct PrimalSolution {
    pub trajectory: Trajectory,
    pub controller: SolutionController,
}

/// Either the time-varying feedback law or just its feedforward inputs.
#[derive(Debug, Clone)]
pub enum SolutionController {
    Feedback(LinearController),
    Feedforward {
        times: Vec<f64>,
        inputs: Vec<DVector<f64>>,
    },
}

/// Per-worker merit evaluation scratch: private provider clones, no locks.
struct MeritEvaluator {
    cost: Box<dyn Cost>,
    heuristics: Box<dyn Cost>,
    constraints: Box<dyn Constraints>,
    penalty: RelaxedBarrierPenalty,
}

impl Clone for MeritEvaluator {
    fn clone(&self) -> Self {
        Self {
            cost: self.cost.clone(),
            heuristics: self.heuristics.clone(),
            constraints: self.constraints.clone(),
            penalty: self.penalty.clone(),
        }
    }
}

impl MeritEvaluator {
    /// Trapezoidal cost and constraint-ISE integrals over all partitions,
    /// with event terms at post-event markers and the heuristics value at
    /// the final sample.
    fn evaluate(
        &mut self,
        trajectories: &[Trajectory],
        reference: &ReferenceTrajectory,
        final_active: usize,
        state_penalty: f64,
    ) -> Result<PerformanceIndex, DdpError> {
        let mut index = PerformanceIndex::default();

        for trajectory in trajectories {
            let n = trajectory.len();
            if n == 0 {
                continue;
            }
            let mut prev_cost = 0.0;
            let mut prev_eq = 0.0;
            let mut prev_state_eq = 0.0;
            let mut prev_ineq_pen = 0.0;
            let mut prev_ineq_violation = 0.0;

            for k in 0..n {
                let t = trajectory.times[k];
                let x = &trajectory.states[k];
                let u = &trajectory.inputs[k];

                let stage_cost = self.cost.stage_cost(t, x, u, reference);

                let num_eq = self.constraints.num_state_input_eq(t);
                let eq_sq = if num_eq > 0 {
                    self.constraints.state_input_eq(t, x, u).values.norm_squared()
                } else {
                    0.0
                };
                let num_state_eq = self.constraints.num_state_eq(t);
                let state_eq_sq = if num_state_eq > 0 {
                    self.constraints.state_eq(t, x).values.norm_squared()
                } else {
                    0.0
                };
                let (ineq_pen, ineq_violation) = if self.constraints.num_inequality(t) > 0 {
                    let block = self.constraints.inequality(t, x, u);
                    (
                        self.penalty.total(&block.values),
                        RelaxedBarrierPenalty::violation_squared_norm(&block.values),
                    )
                } else {
                    (0.0, 0.0)
                };

                if k > 0 {
                    let dt = t - trajectory.times[k - 1];
                    index.cost += 0.5 * (prev_cost + stage_cost) * dt;
                    index.state_input_eq_ise += 0.5 * (prev_eq + eq_sq) * dt;
                    index.state_eq_ise += 0.5 * (prev_state_eq + state_eq_sq) * dt;
                    index.inequality_penalty += 0.5 * (prev_ineq_pen + ineq_pen) * dt;
                    index.inequality_ise += 0.5 * (prev_ineq_violation + ineq_violation) * dt;
                }
                prev_cost = stage_cost;
                prev_eq = eq_sq;
                prev_state_eq = state_eq_sq;
                prev_ineq_pen = ineq_pen;
                prev_ineq_violation = ineq_violation;

                // Event terms are attached to the pre-jump sample.
                if trajectory.post_event_indices.contains(&(k + 1)) {
                    index.cost += self.cost.terminal_cost(t, x, reference);
                    if self.constraints.num_final_state_eq(t) > 0 {
                        index.final_eq_ise +=
                            self.constraints.final_state_eq(t, x).values.norm_squared();
                    }
                }
            }
        }

        // Heuristics (terminal) value at the end of the horizon.
        let last = &trajectories[final_active];
        if let (Some(&t), Some(x)) = (last.times.last(), last.states.last()) {
            index.cost += self.heuristics.terminal_cost(t, x, reference);
        }

        index.merit = index.cost
            + 0.5 * state_penalty * (index.state_eq_ise + index.final_eq_ise)
            + index.inequality_penalty;
        Ok(index)
    }
}

/// Payload carried by one accepted line-search candidate.
struct CandidateSolution {
    controllers: Vec<LinearController>,
    trajectories: Vec<Trajectory>,
    performance: PerformanceIndex,
}

/// DDP trajectory optimizer for hybrid optimal control problems.
pub struct DdpSolver {
    settings: Settings,
    pool: rayon::ThreadPool,

    dynamics: Box<dyn Dynamics>,
    cost: Box<dyn Cost>,
    constraints: Box<dyn Constraints>,
    operating_point: Box<dyn OperatingPoint>,
    heuristics: Box<dyn Cost>,
    mode_schedule: ModeSchedule,
    reference: ReferenceTrajectory,

    partition_times: Vec<f64>,
    init_active: usize,
    final_active: usize,
    init_time: f64,
    final_time: f64,
    init_state: DVector<f64>,

    nominal_controllers: Vec<LinearController>,
    nominal: Vec<Trajectory>,
    cached: Vec<Trajectory>,
    model_data: Vec<Vec<ModelData>>,
    event_data: Vec<Vec<EventLqData>>,
    value_fns: Vec<ValueFunctionData>,
    /// Boundary condition at the *end* of each partition, reused as the
    /// stale estimate that unlocks the fully parallel backward pass.
    terminal_conditions: Vec<TerminalCondition>,
    heuristics_expansion: Option<StateExpansion>,

    iteration: usize,
    rewind_count: usize,
    last_learning_rate: f64,
    performance: PerformanceIndex,
    logs: Vec<IterationLog>,
    timers: BenchmarkTimers,
}

impl DdpSolver {
    pub fn new(
        settings: Settings,
        dynamics: Box<dyn Dynamics>,
        cost: Box<dyn Cost>,
        constraints: Box<dyn Constraints>,
        operating_point: Box<dyn OperatingPoint>,
    ) -> Result<Self, DdpError> {
        settings.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.num_threads)
            .build()
            .map_err(|e| DdpError::InvalidSettings(format!("thread pool: {}", e)))?;
        let heuristics = cost.clone();
        Ok(Self {
            settings,
            pool,
            dynamics,
            cost,
            constraints,
            operating_point,
            heuristics,
            mode_schedule: ModeSchedule::single_mode(0),
            reference: ReferenceTrajectory::origin(),
            partition_times: Vec::new(),
            init_active: 0,
            final_active: 0,
            init_time: 0.0,
            final_time: 0.0,
            init_state: DVector::zeros(0),
            nominal_controllers: Vec::new(),
            nominal: Vec::new(),
            cached: Vec::new(),
            model_data: Vec::new(),
            event_data: Vec::new(),
            value_fns: Vec::new(),
            terminal_conditions: Vec::new(),
            heuristics_expansion: None,
            iteration: 0,
            rewind_count: 0,
            last_learning_rate: 0.0,
            performance: PerformanceIndex::default(),
            logs: Vec::new(),
            timers: BenchmarkTimers::default(),
        })
    }

    /// Replaces the terminal-cost heuristics (defaults to the cost provider
    /// itself).
    pub fn with_heuristics(mut self, heuristics: Box<dyn Cost>) -> Self {
        self.heuristics = heuristics;
        self
    }

    pub fn set_mode_schedule(&mut self, schedule: ModeSchedule) {
        self.mode_schedule = schedule;
    }

    pub fn set_reference(&mut self, reference: ReferenceTrajectory) {
        self.reference = reference;
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn performance(&self) -> &PerformanceIndex {
        &self.performance
    }

    pub fn iteration_log(&self) -> &[IterationLog] {
        &self.logs
    }

    pub fn num_iterations(&self) -> usize {
        self.iteration
    }

    pub fn rewind_count(&self) -> usize {
        self.rewind_count
    }

    pub fn benchmark_summary(&self) -> String {
        self.timers.summary()
    }

    /// Clears every per-solve artifact; the next `run` starts cold.
    pub fn reset(&mut self) {
        for controller in &mut self.nominal_controllers {
            controller.clear();
        }
        for trajectory in self.nominal.iter_mut().chain(self.cached.iter_mut()) {
            trajectory.clear();
        }
        for data in &mut self.model_data {
            data.clear();
        }
        for data in &mut self.event_data {
            data.clear();
        }
        for value in &mut self.value_fns {
            value.clear();
        }
        let state_dim = self.init_state.len();
        for condition in &mut self.terminal_conditions {
            *condition = TerminalCondition::zero(state_dim);
        }
        self.heuristics_expansion = None;
        self.iteration = 0;
        self.rewind_count = 0;
        self.last_learning_rate = 0.0;
        self.performance = PerformanceIndex::default();
        self.logs.clear();
        self.timers.reset();
    }

    /// Solves the horizon `[init_time, final_time]`, warm-starting from the
    /// internal (possibly rewound) controllers.
    pub fn run(
        &mut self,
        init_time: f64,
        init_state: DVector<f64>,
        final_time: f64,
        partition_times: &[f64],
    ) -> Result<(), DdpError> {
        self.run_impl(init_time, init_state, final_time, partition_times, None)
    }

    /// Solves the horizon starting from an externally supplied controller
    /// set (one controller per partition).
    pub fn run_with_controllers(
        &mut self,
        init_time: f64,
        init_state: DVector<f64>,
        final_time: f64,
        partition_times: &[f64],
        controllers: Vec<LinearController>,
    ) -> Result<(), DdpError> {
        self.run_impl(
            init_time,
            init_state,
            final_time,
            partition_times,
            Some(controllers),
        )
    }

    fn run_impl(
        &mut self,
        init_time: f64,
        init_state: DVector<f64>,
        final_time: f64,
        partition_times: &[f64],
        initial_controllers: Option<Vec<LinearController>>,
    ) -> Result<(), DdpError> {
        if partition_times.len() < 2
            || partition_times.windows(2).any(|pair| pair[1] <= pair[0])
        {
            return Err(DdpError::InvalidPartitionGrid);
        }
        if !init_state.iter().all(|value| value.is_finite()) {
            return Err(DdpError::NonFiniteInitialState { time: init_time });
        }
        let num_partitions = partition_times.len() - 1;
        if self.nominal.len() != num_partitions {
            self.setup(num_partitions, init_state.len());
        }

        self.partition_times = partition_times.to_vec();
        self.init_active = lookup::bounded_active_interval(partition_times, init_time);
        self.final_active = lookup::bounded_active_interval(partition_times, final_time);
        self.init_time = init_time;
        self.final_time = final_time;
        self.init_state = init_state;

        if let Some(controllers) = initial_controllers {
            if controllers.len() != num_partitions {
                return Err(DdpError::ControllerCountMismatch {
                    controllers: controllers.len(),
                    partitions: num_partitions,
                });
            }
            self.nominal_controllers = controllers;
        }

        self.iteration = 0;
        self.last_learning_rate = 0.0;
        self.logs.clear();
        let mut initial_controller_empty = self
            .nominal_controllers
            .iter()
            .any(LinearController::is_empty);

        info!(
            init_time,
            final_time,
            partitions = num_partitions,
            rewinds = self.rewind_count,
            "DDP solve started"
        );

        self.run_init()?;
        self.push_log();

        let mut converged = false;
        while self.iteration + 1 < self.settings.max_iterations && !converged {
            self.iteration += 1;
            let previous_merit = self.performance.merit;
            let previous_eq_ise = self.performance.state_input_eq_ise;

            let (max_ff, max_deviation) = self.controller_update_norms();
            debug!(
                iteration = self.iteration,
                max_ff_update = max_ff,
                max_input_deviation = max_deviation,
                "controller update norms"
            );

            cache::swap_nominal_to_cache(&mut self.nominal, &mut self.cached);
            self.run_iteration()?;
            self.push_log();

            let cost_change = (self.performance.merit - previous_merit).abs();
            let eq_ise_change = (self.performance.state_input_eq_ise - previous_eq_ise).abs();
            let constraints_satisfied = self.performance.state_input_eq_ise
                <= self.settings.min_abs_constraint_ise
                || eq_ise_change <= self.settings.min_rel_constraint_ise;
            let step_vanished = self.last_learning_rate == 0.0 && !initial_controller_empty;
            let cost_converged = cost_change <= self.settings.min_rel_cost || step_vanished;
            converged = cost_converged && constraints_satisfied;
            initial_controller_empty = false;

            info!(
                iteration = self.iteration,
                cost = self.performance.cost,
                merit = self.performance.merit,
                eq_ise = self.performance.state_input_eq_ise,
                learning_rate = self.last_learning_rate,
                "iteration finished"
            );
        }

        // One last line search so the returned trajectories are consistent
        // with the final controller.
        cache::swap_nominal_to_cache(&mut self.nominal, &mut self.cached);
        self.timers.line_search.start();
        self.line_search()?;
        self.timers.line_search.stop();

        info!(
            iterations = self.iteration + 1,
            converged,
            cost = self.performance.cost,
            merit = self.performance.merit,
            "DDP solve finished"
        );
        debug!("benchmark timers:\n{}", self.timers.summary());
        Ok(())
    }

    fn setup(&mut self, num_partitions: usize, state_dim: usize) {
        self.nominal_controllers = vec![LinearController::new(); num_partitions];
        self.nominal = vec![Trajectory::new(); num_partitions];
        self.cached = vec![Trajectory::new(); num_partitions];
        self.model_data = vec![Vec::new(); num_partitions];
        self.event_data = vec![Vec::new(); num_partitions];
        self.value_fns = vec![ValueFunctionData::default(); num_partitions];
        self.terminal_conditions = vec![TerminalCondition::zero(state_dim); num_partitions];
    }

    /// Iteration zero: unconditional rollout (fatal on divergence), cache
    /// correction, LQ approximation, backward pass, controller synthesis.
    fn run_init(&mut self) -> Result<(), DdpError> {
        cache::swap_nominal_to_cache(&mut self.nominal, &mut self.cached);

        self.timers.forward_pass.start();
        let mut coordinator = self.make_rollout_coordinator();
        let trajectories = coordinator.rollout_trajectories(
            &self.nominal_controllers,
            &self.partition_times,
            self.init_active,
            self.final_active,
            self.init_time,
            &self.init_state,
            self.final_time,
            &self.mode_schedule,
            &CancellationToken::new(),
        )?;
        self.nominal = trajectories;
        self.validate_nominal()?;
        self.timers.forward_pass.stop();

        // Needed for the moving-horizon case and for the very first solve
        // where there are no previous nominal trajectories at all.
        for i in self.init_active..=self.final_active {
            cache::correct_cached_tail(
                &self.nominal[i],
                &mut self.cached[i],
                self.settings.debug_caching,
            )?;
        }

        self.timers.lq_approximation.start();
        self.approximate_problem()?;
        let mut evaluator = self.make_merit_evaluator();
        self.performance = evaluator.evaluate(
            &self.nominal,
            &self.reference,
            self.final_active,
            self.state_penalty(),
        )?;
        self.timers.lq_approximation.stop();

        self.timers.backward_pass.start();
        self.solve_riccati()?;
        self.timers.backward_pass.stop();

        self.timers.controller.start();
        self.synthesize_controllers()?;
        self.timers.controller.stop();
        Ok(())
    }

    /// One full DDP iteration after init: line search with the previous
    /// controller, then re-approximate and re-solve.
    fn run_iteration(&mut self) -> Result<(), DdpError> {
        self.timers.line_search.start();
        self.line_search()?;
        self.timers.line_search.stop();

        self.timers.lq_approximation.start();
        self.approximate_problem()?;
        self.timers.lq_approximation.stop();

        self.timers.backward_pass.start();
        self.solve_riccati()?;
        self.timers.backward_pass.stop();

        self.timers.controller.start();
        self.synthesize_controllers()?;
        self.timers.controller.stop();
        Ok(())
    }

    /// Geometric continuation penalty on state-equality constraints.
    fn state_penalty(&self) -> f64 {
        self.settings.state_penalty_coeff
            * self.settings.state_penalty_base.powi(self.iteration as i32)
    }

    fn make_rollout_coordinator(&self) -> RolloutCoordinator {
        RolloutCoordinator {
            engine: RolloutEngine::new(self.dynamics.clone(), self.settings.time_step),
            operating: OperatingPointRollout::new(
                self.operating_point.clone(),
                self.settings.time_step,
            ),
        }
    }

    fn make_merit_evaluator(&self) -> MeritEvaluator {
        MeritEvaluator {
            cost: self.cost.clone(),
            heuristics: self.heuristics.clone(),
            constraints: self.constraints.clone(),
            penalty: RelaxedBarrierPenalty::new(
                self.settings.inequality_penalty_mu,
                self.settings.inequality_penalty_delta,
            ),
        }
    }

    fn make_lq_approximator(&self) -> LqApproximator {
        LqApproximator {
            dynamics: self.dynamics.clone(),
            cost: self.cost.clone(),
            constraints: self.constraints.clone(),
            penalty: RelaxedBarrierPenalty::new(
                self.settings.inequality_penalty_mu,
                self.settings.inequality_penalty_delta,
            ),
            hessian_correction: self.settings.hessian_correction,
        }
    }

    fn validate_nominal(&self) -> Result<(), DdpError> {
        for i in self.init_active..=self.final_active {
            self.nominal[i].validate()?;
        }
        Ok(())
    }

    /// Active mode of every sample of a partition's trajectory; the switch
    /// happens exactly at the post-event sample.
    fn sample_modes(&self, trajectory: &Trajectory) -> Vec<usize> {
        let mut modes = Vec::with_capacity(trajectory.len());
        if trajectory.is_empty() {
            return modes;
        }
        let mut mode = self.mode_schedule.mode_at(trajectory.times[0]);
        for k in 0..trajectory.len() {
            if trajectory.post_event_indices.contains(&k) {
                mode = self.mode_schedule.mode_at(trajectory.times[k]);
            }
            modes.push(mode);
        }
        modes
    }

    /// Linearizes/quadratizes the problem along the nominal trajectories,
    /// one parallel task per sample, and prepares the event-time and
    /// terminal (heuristics) expansions.
    fn approximate_problem(&mut self) -> Result<(), DdpError> {
        let state_penalty = self.state_penalty();
        let prototype = self.make_lq_approximator();

        for i in self.init_active..=self.final_active {
            let trajectory = &self.nominal[i];
            let modes = self.sample_modes(trajectory);
            let reference = &self.reference;

            let model_data: Result<Vec<ModelData>, DdpError> = self.pool.install(|| {
                (0..trajectory.len())
                    .into_par_iter()
                    .map_init(
                        || prototype.clone(),
                        |lq, k| {
                            lq.approximate(
                                modes[k],
                                trajectory.times[k],
                                &trajectory.states[k],
                                &trajectory.inputs[k],
                                reference,
                                state_penalty,
                            )
                        },
                    )
                    .collect()
            });
            self.model_data[i] = model_data?;

            // Event-time approximations at the pre-jump samples.
            let mut event_data = Vec::with_capacity(trajectory.post_event_indices.len());
            let mut lq = prototype.clone();
            for &post_index in &trajectory.post_event_indices {
                let pre = post_index - 1;
                event_data.push(lq.approximate_event(
                    trajectory.times[pre],
                    &trajectory.states[pre],
                    reference,
                    state_penalty,
                )?);
            }
            self.event_data[i] = event_data;
        }

        // Heuristics expansion at the end of the horizon seeds the backward
        // pass of the final partition.
        let last = &self.nominal[self.final_active];
        let (&t, x) = match (last.times.last(), last.states.last()) {
            (Some(t), Some(x)) => (t, x),
            _ => return Err(DdpError::MissingPrerequisite("empty final partition")),
        };
        let mut expansion = self.heuristics.terminal_expansion(t, x, &self.reference);
        expansion.dfdxx = correct_hessian(&expansion.dfdxx, self.settings.hessian_correction);
        self.heuristics_expansion = Some(expansion);
        Ok(())
    }

    /// Backward Riccati pass over all active partitions. The very first
    /// iteration honors the cross-partition dependency chain sequentially;
    /// afterwards the blocks run fully in parallel against the previous
    /// iteration's boundary estimates.
    fn solve_riccati(&mut self) -> Result<(), DdpError> {
        let expansion = self
            .heuristics_expansion
            .as_ref()
            .ok_or(DdpError::MissingPrerequisite("heuristics expansion"))?;
        let state_dim = self.init_state.len();
        self.terminal_conditions[self.final_active] = TerminalCondition {
            sm: expansion.dfdxx.clone(),
            sv: expansion.dfdx.clone(),
            sve: DVector::zeros(state_dim),
            s: expansion.value,
        };

        for value in self.value_fns.iter_mut().take(self.init_active) {
            value.clear();
        }
        for value in self.value_fns.iter_mut().skip(self.final_active + 1) {
            value.clear();
        }

        let run_sequential = self.iteration == 0 && !self.settings.parallel_riccati_from_start;
        let active: Vec<usize> = (self.init_active..=self.final_active).collect();

        if run_sequential {
            for &i in active.iter().rev() {
                let (value, boundary) = solve_partition(
                    &self.nominal[i].times,
                    &self.nominal[i].post_event_indices,
                    &self.model_data[i],
                    &self.event_data[i],
                    &self.terminal_conditions[i],
                )?;
                self.value_fns[i] = value;
                if i > self.init_active {
                    self.terminal_conditions[i - 1] = boundary;
                }
            }
            return Ok(());
        }

        let sample_counts: Vec<usize> = active.iter().map(|&i| self.nominal[i].len()).collect();
        let blocks = distribute_partitions(&sample_counts, self.settings.num_threads);
        debug!(?blocks, "backward-pass work distribution");

        let nominal = &self.nominal;
        let model_data = &self.model_data;
        let event_data = &self.event_data;
        let terminal_conditions = &self.terminal_conditions;
        let init_active = self.init_active;

        type BlockResult = Vec<(usize, ValueFunctionData, TerminalCondition)>;
        let results: Result<Vec<BlockResult>, DdpError> = self.pool.install(|| {
            blocks
                .into_par_iter()
                .map(|range| {
                    let mut solved = Vec::with_capacity(range.len());
                    // Chain boundaries inside the block; the block's own end
                    // condition is the stock estimate (fresh for the final
                    // block, previous-iteration for the others).
                    let mut boundary: Option<TerminalCondition> = None;
                    for offset in range.clone().rev() {
                        let i = init_active + offset;
                        let terminal = boundary
                            .clone()
                            .unwrap_or_else(|| terminal_conditions[i].clone());
                        let (value, start) = solve_partition(
                            &nominal[i].times,
                            &nominal[i].post_event_indices,
                            &model_data[i],
                            &event_data[i],
                            &terminal,
                        )?;
                        boundary = Some(start.clone());
                        solved.push((i, value, start));
                    }
                    Ok(solved)
                })
                .collect()
        });

        for (i, value, start) in results?.into_iter().flatten() {
            self.value_fns[i] = value;
            if i > self.init_active {
                self.terminal_conditions[i - 1] = start;
            }
        }
        Ok(())
    }

    /// Builds the affine feedback law from the value-function coefficients
    /// and the local LQ models, one parallel task per sample.
    fn synthesize_controllers(&mut self) -> Result<(), DdpError> {
        for i in 0..self.nominal.len() {
            if i < self.init_active || i > self.final_active {
                self.nominal_controllers[i].clear();
                continue;
            }
            let trajectory = &self.nominal[i];
            let value = &self.value_fns[i];
            let model_data = &self.model_data[i];
            let n = value.len();

            let samples: Result<Vec<_>, DdpError> = self.pool.install(|| {
                (0..n)
                    .into_par_iter()
                    .map(|k| {
                        let gains = compute_gains(
                            &model_data[k],
                            &value.sm[k],
                            &value.sv[k],
                            &value.sve[k],
                        )?;
                        let x_nominal = &trajectory.states[k];
                        let u_nominal = &trajectory.inputs[k];
                        let bias = u_nominal + &gains.l_c - &gains.k * x_nominal;
                        Ok((gains.k, bias, gains.l_u))
                    })
                    .collect()
            });

            let mut controller = LinearController::new();
            controller.times = value.times.clone();
            for (gain, bias, ff_increment) in samples? {
                controller.gains.push(gain);
                controller.biases.push(bias);
                controller.ff_increments.push(ff_increment);
            }
            self.nominal_controllers[i] = controller;
        }
        Ok(())
    }

    /// Zero-step baseline rollout followed by the parallel candidate search;
    /// adopts the best accepted candidate (or keeps the baseline).
    fn line_search(&mut self) -> Result<(), DdpError> {
        // Baseline: current controller, feedforward increments not applied.
        // A fault here is fatal, there is no smaller step to fall back to.
        let mut coordinator = self.make_rollout_coordinator();
        let trajectories = coordinator.rollout_trajectories(
            &self.nominal_controllers,
            &self.partition_times,
            self.init_active,
            self.final_active,
            self.init_time,
            &self.init_state,
            self.final_time,
            &self.mode_schedule,
            &CancellationToken::new(),
        )?;
        let mut evaluator = self.make_merit_evaluator();
        let baseline = evaluator.evaluate(
            &trajectories,
            &self.reference,
            self.final_active,
            self.state_penalty(),
        )?;
        debug!(merit = baseline.merit, "baseline rollout");
        self.nominal = trajectories;
        self.validate_nominal()?;
        self.performance = baseline.clone();
        self.last_learning_rate = 0.0;

        let schedule = LineSearchSchedule {
            max_alpha: self.settings.max_learning_rate,
            min_alpha: self.settings.min_learning_rate,
            contraction: self.settings.contraction_rate,
        };
        let init_controllers = self.nominal_controllers.clone();
        let state_penalty = self.state_penalty();
        let (partition_times, init_active, final_active) = (
            &self.partition_times,
            self.init_active,
            self.final_active,
        );
        let (init_time, final_time) = (self.init_time, self.final_time);
        let (init_state, mode_schedule, reference) =
            (&self.init_state, &self.mode_schedule, &self.reference);
        let coordinator_prototype = self.make_rollout_coordinator();
        let evaluator_prototype = self.make_merit_evaluator();

        let best = line_search::search(
            &self.pool,
            &schedule,
            baseline.merit,
            self.settings.armijo_slope,
            |_worker| (coordinator_prototype.clone(), evaluator_prototype.clone()),
            |(coordinator, evaluator), alpha, cancel| {
                let mut controllers = init_controllers.clone();
                for controller in &mut controllers {
                    controller.apply_ff_increment(alpha);
                }
                let trajectories = coordinator.rollout_trajectories(
                    &controllers,
                    partition_times,
                    init_active,
                    final_active,
                    init_time,
                    init_state,
                    final_time,
                    mode_schedule,
                    cancel,
                )?;
                let performance =
                    evaluator.evaluate(&trajectories, reference, final_active, state_penalty)?;
                debug!(alpha, merit = performance.merit, "line-search candidate");
                Ok((
                    performance.merit,
                    CandidateSolution {
                        controllers,
                        trajectories,
                        performance,
                    },
                ))
            },
        )?;

        if let Some(step) = best {
            self.last_learning_rate = step.alpha;
            self.nominal_controllers = step.payload.controllers;
            self.nominal = step.payload.trajectories;
            self.performance = step.payload.performance;
        }
        for controller in &mut self.nominal_controllers {
            controller.clear_ff_increments();
        }
        debug!(
            learning_rate = self.last_learning_rate,
            merit = self.performance.merit,
            "line search selected step"
        );
        Ok(())
    }

    /// Largest feedforward update and largest deviation of the feedback law
    /// from the nominal inputs; iteration diagnostics.
    fn controller_update_norms(&self) -> (f64, f64) {
        use ordered_float::OrderedFloat;
        let mut max_ff = 0.0_f64;
        let mut max_deviation = OrderedFloat(0.0_f64);
        for i in self.init_active..=self.final_active {
            let controller = &self.nominal_controllers[i];
            max_ff = max_ff.max(controller.max_ff_increment_norm());
            let trajectory = &self.nominal[i];
            if trajectory.is_empty() {
                continue;
            }
            for (k, &t) in controller.times.iter().enumerate() {
                let x_nominal = trajectory.state_at(t);
                let u_nominal = trajectory.input_at(t);
                let deviation =
                    (&u_nominal - &controller.gains[k] * &x_nominal - &controller.biases[k]).norm();
                max_deviation = max_deviation.max(OrderedFloat(deviation));
            }
        }
        (max_ff, max_deviation.into_inner())
    }

    fn push_log(&mut self) {
        self.logs.push(IterationLog {
            iteration: self.iteration,
            cost: self.performance.cost,
            merit: self.performance.merit,
            state_input_eq_ise: self.performance.state_input_eq_ise,
            state_eq_ise: self.performance.state_eq_ise,
            learning_rate: self.last_learning_rate,
        });
    }

    /// Concatenated trajectory and controller of the last solve, truncated
    /// at `upto_time`.
    pub fn primal_solution(&self, upto_time: f64) -> Result<PrimalSolution, DdpError> {
        if self.partition_times.len() < 2 {
            return Err(DdpError::MissingPrerequisite("solver has not run yet"));
        }
        let mut trajectory = Trajectory::new();
        for i in self.init_active..=self.final_active {
            let partition = &self.nominal[i];
            if partition.is_empty() {
                return Err(DdpError::MissingPrerequisite("no solved trajectory"));
            }
            if partition.times[0] > upto_time {
                break;
            }
            let length = lookup::upper_bound(&partition.times, upto_time);
            let mut piece = Trajectory::new();
            piece.times = partition.times[..length].to_vec();
            piece.states = partition.states[..length].to_vec();
            piece.inputs = partition.inputs[..length].to_vec();
            piece.post_event_indices = partition
                .post_event_indices
                .iter()
                .copied()
                .filter(|&idx| idx < length)
                .collect();
            // The partition boundary sample is shared with the previous
            // partition; keep only one copy.
            if let (Some(&previous_end), Some(&piece_start)) =
                (trajectory.times.last(), piece.times.first())
            {
                if piece_start <= previous_end {
                    piece.times.remove(0);
                    piece.states.remove(0);
                    piece.inputs.remove(0);
                    for index in &mut piece.post_event_indices {
                        *index -= 1;
                    }
                }
            }
            trajectory.extend(piece);
        }

        let controller = if self.settings.use_feedback_policy {
            let mut combined = LinearController::new();
            for i in self.init_active..=self.final_active {
                let partition = &self.nominal_controllers[i];
                if partition.is_empty() || partition.times[0] > upto_time {
                    break;
                }
                let length = lookup::upper_bound(&partition.times, upto_time);
                combined.concatenate(partition, length);
            }
            SolutionController::Feedback(combined)
        } else {
            SolutionController::Feedforward {
                times: trajectory.times.clone(),
                inputs: trajectory.inputs.clone(),
            }
        };

        Ok(PrimalSolution {
            trajectory,
            controller,
        })
    }

    /// Quadratic value-function estimate at `(time, state)`.
    pub fn value_function(&self, time: f64, state: &DVector<f64>) -> Result<f64, DdpError> {
        let (value, trajectory) = self.value_partition(time)?;
        let segment = crate::core::interpolation::time_segment(time, &value.times);
        let sm = crate::core::interpolation::interpolate(segment, &value.sm);
        let sv = crate::core::interpolation::interpolate(segment, &value.sv);
        let sve = crate::core::interpolation::interpolate(segment, &value.sve);
        let s = crate::core::interpolation::interpolate(segment, &value.s);
        let dx = state - trajectory.state_at(time);
        Ok(s + dx.dot(&(sv + sve)) + 0.5 * dx.dot(&(&sm * &dx)))
    }

    /// State gradient of the value function at `(time, state)`.
    pub fn value_function_state_derivative(
        &self,
        time: f64,
        state: &DVector<f64>,
    ) -> Result<DVector<f64>, DdpError> {
        let (value, trajectory) = self.value_partition(time)?;
        let segment = crate::core::interpolation::time_segment(time, &value.times);
        let sm = crate::core::interpolation::interpolate(segment, &value.sm);
        let sv = crate::core::interpolation::interpolate(segment, &value.sv);
        let sve = crate::core::interpolation::interpolate(segment, &value.sve);
        let dx = state - trajectory.state_at(time);
        Ok(&sm * dx + sv + sve)
    }

    fn value_partition(&self, time: f64) -> Result<(&ValueFunctionData, &Trajectory), DdpError> {
        if self.partition_times.len() < 2 {
            return Err(DdpError::MissingPrerequisite("solver has not run yet"));
        }
        let partition = lookup::bounded_active_interval(&self.partition_times, time)
            .clamp(self.init_active, self.final_active);
        let value = &self.value_fns[partition];
        if value.is_empty() {
            return Err(DdpError::MissingPrerequisite("no value function stored"));
        }
        Ok((value, &self.nominal[partition]))
    }

    /// Receding-horizon bookkeeping: drops `count` retired partitions from
    /// the front, shifting controllers and boundary conditions left and
    /// clearing the newly appended tail slots.
    pub fn rewind(&mut self, count: usize) -> Result<(), DdpError> {
        if count == 0 {
            return Ok(());
        }
        let num_partitions = self.nominal.len();
        if count > num_partitions {
            return Err(DdpError::RewindOutOfRange {
                count,
                partitions: num_partitions,
            });
        }
        self.rewind_count += count;

        let state_dim = self.init_state.len();
        for i in 0..num_partitions {
            if i + count < num_partitions {
                self.nominal_controllers.swap(i, i + count);
                self.terminal_conditions.swap(i, i + count);
            } else {
                self.nominal_controllers[i].clear();
                self.terminal_conditions[i] = TerminalCondition::zero(state_dim);
            }
        }
        Ok(())
    }
}
