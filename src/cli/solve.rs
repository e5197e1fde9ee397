use std::error::Error;
use std::io::Write;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::info;

use hybrid_ddp::ocp::constraint::NoConstraints;
use hybrid_ddp::ocp::linear::{QuadraticCost, SwitchedLinearDynamics};
use hybrid_ddp::ocp::operating_point::FixedOperatingPoint;
use hybrid_ddp::{DdpSolver, ModeSchedule, Settings};

use super::output::FilePrefix;

/// One hybrid mode of the demo problem: `dx/dt = A x + B u`, with an
/// optional jump matrix applied when the mode is left.
#[derive(Debug, Deserialize)]
pub struct ModeDefinition {
    pub a: Vec<Vec<f64>>,
    pub b: Vec<Vec<f64>>,
    pub jump: Option<Vec<Vec<f64>>>,
}

/// Parameter-file schema of the `solve` subcommand: a switched linear
/// system with a quadratic regulation cost.
#[derive(Debug, Deserialize)]
pub struct ProblemDefinition {
    #[serde(default)]
    pub settings: Settings,
    pub modes: Vec<ModeDefinition>,
    pub q: Vec<Vec<f64>>,
    pub r: Vec<Vec<f64>>,
    pub q_final: Vec<Vec<f64>>,
    pub initial_state: Vec<f64>,
    pub init_time: f64,
    pub final_time: f64,
    pub partition_times: Vec<f64>,
    #[serde(default)]
    pub event_times: Vec<f64>,
    #[serde(default)]
    pub mode_sequence: Vec<usize>,
}

#[derive(Debug, Serialize)]
struct SolutionOutput {
    times: Vec<f64>,
    states: Vec<Vec<f64>>,
    inputs: Vec<Vec<f64>>,
}

fn to_matrix(rows: &[Vec<f64>]) -> DMatrix<f64> {
    let nrows = rows.len();
    let ncols = rows.first().map_or(0, Vec::len);
    DMatrix::from_fn(nrows, ncols, |i, j| rows[i][j])
}

pub fn solve_problem(
    definition: &ProblemDefinition,
    file_prefix: FilePrefix,
) -> Result<(), Box<dyn Error>> {
    let state_dim = definition.initial_state.len();

    let mut flow_matrices = Vec::new();
    let mut input_matrices = Vec::new();
    let mut jump_matrices = Vec::new();
    let mut has_jumps = false;
    for mode in &definition.modes {
        flow_matrices.push(to_matrix(&mode.a));
        input_matrices.push(to_matrix(&mode.b));
        match &mode.jump {
            Some(jump) => {
                has_jumps = true;
                jump_matrices.push(to_matrix(jump));
            }
            None => jump_matrices.push(DMatrix::identity(state_dim, state_dim)),
        }
    }
    let input_dim = input_matrices.first().map_or(0, |b| b.ncols());
    let mut dynamics = SwitchedLinearDynamics::new(flow_matrices, input_matrices);
    if has_jumps {
        dynamics = dynamics.with_jump_matrices(jump_matrices);
    }

    let cost = QuadraticCost::new(
        to_matrix(&definition.q),
        to_matrix(&definition.r),
        to_matrix(&definition.q_final),
    );

    let mut solver = DdpSolver::new(
        definition.settings.clone(),
        Box::new(dynamics),
        Box::new(cost),
        Box::new(NoConstraints::new(state_dim, input_dim)),
        Box::new(FixedOperatingPoint::new(
            DVector::from_vec(definition.initial_state.clone()),
            DVector::zeros(input_dim),
        )),
    )?;

    if !definition.event_times.is_empty() {
        solver.set_mode_schedule(ModeSchedule::new(
            definition.event_times.clone(),
            definition.mode_sequence.clone(),
        ));
    }

    solver.run(
        definition.init_time,
        DVector::from_vec(definition.initial_state.clone()),
        definition.final_time,
        &definition.partition_times,
    )?;

    let performance = solver.performance();
    info!(
        cost = performance.cost,
        merit = performance.merit,
        iterations = solver.num_iterations() + 1,
        "solve complete"
    );

    // Iteration-by-iteration log.
    let mut log_file = file_prefix.create_file_with_suffix("_solve_log.json")?;
    serde_json::to_writer_pretty(&mut log_file, solver.iteration_log())?;
    log_file.flush()?;

    // Concatenated primal solution.
    let primal = solver.primal_solution(definition.final_time)?;
    let output = SolutionOutput {
        times: primal.trajectory.times.clone(),
        states: primal
            .trajectory
            .states
            .iter()
            .map(|x| x.iter().copied().collect())
            .collect(),
        inputs: primal
            .trajectory
            .inputs
            .iter()
            .map(|u| u.iter().copied().collect())
            .collect(),
    };
    let mut solution_file = file_prefix.create_file_with_suffix("_solution.json")?;
    serde_json::to_writer_pretty(&mut solution_file, &output)?;
    solution_file.flush()?;

    println!("{}", solver.benchmark_summary());
    Ok(())
}
