//! End-to-end properties on hybrid (switched) problems: event handling in
//! the returned solution, constraint satisfaction, and receding-horizon
//! bookkeeping.

use approx::assert_relative_eq;
use nalgebra::{DMatrix, DVector};

use hybrid_ddp::ocp::constraint::{
    ConstraintBlock, Constraints, NoConstraints, StateConstraintBlock,
};
use hybrid_ddp::ocp::linear::{QuadraticCost, SwitchedLinearDynamics};
use hybrid_ddp::ocp::operating_point::FixedOperatingPoint;
use hybrid_ddp::{DdpSolver, ModeSchedule, Settings};

fn quadratic_cost() -> QuadraticCost {
    QuadraticCost::new(
        DMatrix::identity(2, 2),
        DMatrix::identity(1, 1),
        DMatrix::identity(2, 2),
    )
}

fn switched_dynamics() -> SwitchedLinearDynamics {
    SwitchedLinearDynamics::new(
        vec![
            DMatrix::from_row_slice(2, 2, &[0.0, 1.0, -1.0, -0.5]),
            DMatrix::from_row_slice(2, 2, &[0.0, 1.0, -2.0, -0.5]),
        ],
        vec![
            DMatrix::from_row_slice(2, 1, &[0.0, 1.0]),
            DMatrix::from_row_slice(2, 1, &[0.0, 1.0]),
        ],
    )
    .with_jump_matrices(vec![
        DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, 0.5])),
        DMatrix::identity(2, 2),
    ])
}

fn settings() -> Settings {
    Settings {
        num_threads: 4,
        max_iterations: 12,
        time_step: 0.01,
        ..Settings::default()
    }
}

#[test]
fn solution_marks_event_with_repeated_timestamp() {
    let mut solver = DdpSolver::new(
        settings(),
        Box::new(switched_dynamics()),
        Box::new(quadratic_cost()),
        Box::new(NoConstraints::new(2, 1)),
        Box::new(FixedOperatingPoint::new(
            DVector::from_vec(vec![1.0, 0.0]),
            DVector::zeros(1),
        )),
    )
    .unwrap();
    solver.set_mode_schedule(ModeSchedule::new(vec![1.0], vec![0, 1]));

    solver
        .run(
            0.0,
            DVector::from_vec(vec![1.0, 0.0]),
            3.0,
            &[0.0, 1.5, 3.0],
        )
        .unwrap();

    let solution = solver.primal_solution(3.0).unwrap();
    let trajectory = &solution.trajectory;
    assert_relative_eq!(*trajectory.times.first().unwrap(), 0.0);
    assert_relative_eq!(*trajectory.times.last().unwrap(), 3.0);

    // Exactly one event: a repeated timestamp at t = 1, marked post-event,
    // with the jump map halving the velocity across it.
    assert_eq!(trajectory.post_event_indices.len(), 1);
    let post = trajectory.post_event_indices[0];
    assert_relative_eq!(trajectory.times[post], 1.0);
    assert_relative_eq!(trajectory.times[post - 1], 1.0);
    assert_relative_eq!(
        trajectory.states[post][1],
        0.5 * trajectory.states[post - 1][1],
        epsilon = 1e-9
    );

    // Times strictly increase everywhere else.
    for (k, pair) in trajectory.times.windows(2).enumerate() {
        if k + 1 != post {
            assert!(pair[1] > pair[0], "time not increasing at index {}", k);
        }
    }
}

/// One state-input equality constraint `u + v = 0` (velocity damping).
#[derive(Clone)]
struct VelocityDampingConstraint;

impl Constraints for VelocityDampingConstraint {
    fn num_state_input_eq(&mut self, _t: f64) -> usize {
        1
    }
    fn state_input_eq(&mut self, _t: f64, x: &DVector<f64>, u: &DVector<f64>) -> ConstraintBlock {
        ConstraintBlock {
            values: DVector::from_vec(vec![u[0] + x[1]]),
            dfdx: DMatrix::from_row_slice(1, 2, &[0.0, 1.0]),
            dfdu: DMatrix::from_row_slice(1, 1, &[1.0]),
        }
    }
    fn num_state_eq(&mut self, _t: f64) -> usize {
        0
    }
    fn state_eq(&mut self, _t: f64, _x: &DVector<f64>) -> StateConstraintBlock {
        StateConstraintBlock {
            values: DVector::zeros(0),
            dfdx: DMatrix::zeros(0, 2),
        }
    }
    fn num_inequality(&mut self, _t: f64) -> usize {
        0
    }
    fn inequality(&mut self, _t: f64, _x: &DVector<f64>, _u: &DVector<f64>) -> ConstraintBlock {
        ConstraintBlock {
            values: DVector::zeros(0),
            dfdx: DMatrix::zeros(0, 2),
            dfdu: DMatrix::zeros(0, 1),
        }
    }
    fn num_final_state_eq(&mut self, _t: f64) -> usize {
        0
    }
    fn final_state_eq(&mut self, _t: f64, _x: &DVector<f64>) -> StateConstraintBlock {
        StateConstraintBlock {
            values: DVector::zeros(0),
            dfdx: DMatrix::zeros(0, 2),
        }
    }
    fn clone_boxed(&self) -> Box<dyn Constraints> {
        Box::new(self.clone())
    }
}

#[test]
fn equality_constraint_ise_is_driven_below_tolerance() {
    let dynamics = SwitchedLinearDynamics::time_invariant(
        DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 0.0, 0.0]),
        DMatrix::from_row_slice(2, 1, &[0.0, 1.0]),
    );
    let mut solver = DdpSolver::new(
        settings(),
        Box::new(dynamics),
        Box::new(quadratic_cost()),
        Box::new(VelocityDampingConstraint),
        Box::new(FixedOperatingPoint::new(
            DVector::from_vec(vec![1.0, 0.0]),
            DVector::zeros(1),
        )),
    )
    .unwrap();

    solver
        .run(0.0, DVector::from_vec(vec![1.0, 0.0]), 5.0, &[0.0, 2.5, 5.0])
        .unwrap();

    let performance = solver.performance();
    assert!(
        performance.state_input_eq_ise <= solver.settings().min_abs_constraint_ise,
        "equality ISE {} above tolerance",
        performance.state_input_eq_ise
    );
    // The budget must not have been the stopping reason.
    assert!(solver.num_iterations() + 1 < solver.settings().max_iterations);
}

#[test]
fn rewind_shifts_partitions_and_allows_resolve() {
    let mut solver = DdpSolver::new(
        settings(),
        Box::new(switched_dynamics()),
        Box::new(quadratic_cost()),
        Box::new(NoConstraints::new(2, 1)),
        Box::new(FixedOperatingPoint::new(
            DVector::from_vec(vec![1.0, 0.0]),
            DVector::zeros(1),
        )),
    )
    .unwrap();
    solver.set_mode_schedule(ModeSchedule::new(vec![1.0], vec![0, 1]));

    solver
        .run(
            0.0,
            DVector::from_vec(vec![1.0, 0.0]),
            4.0,
            &[0.0, 1.0, 2.0, 3.0, 4.0],
        )
        .unwrap();

    solver.rewind(1).unwrap();
    assert_eq!(solver.rewind_count(), 1);

    // The horizon slides forward by one partition; the rewound controllers
    // warm-start the new solve.
    solver
        .run(
            1.0,
            DVector::from_vec(vec![0.8, -0.1]),
            5.0,
            &[1.0, 2.0, 3.0, 4.0, 5.0],
        )
        .unwrap();
    assert!(solver.performance().merit.is_finite());

    let solution = solver.primal_solution(5.0).unwrap();
    assert_relative_eq!(*solution.trajectory.times.first().unwrap(), 1.0);
    assert_relative_eq!(*solution.trajectory.times.last().unwrap(), 5.0);
}

#[test]
fn rewind_beyond_partition_count_is_rejected() {
    let mut solver = DdpSolver::new(
        settings(),
        Box::new(switched_dynamics()),
        Box::new(quadratic_cost()),
        Box::new(NoConstraints::new(2, 1)),
        Box::new(FixedOperatingPoint::new(
            DVector::zeros(2),
            DVector::zeros(1),
        )),
    )
    .unwrap();
    solver
        .run(0.0, DVector::zeros(2), 2.0, &[0.0, 1.0, 2.0])
        .unwrap();
    assert!(solver.rewind(3).is_err());
}

#[test]
fn invalid_run_inputs_are_rejected_before_solving() {
    let mut solver = DdpSolver::new(
        settings(),
        Box::new(switched_dynamics()),
        Box::new(quadratic_cost()),
        Box::new(NoConstraints::new(2, 1)),
        Box::new(FixedOperatingPoint::new(
            DVector::zeros(2),
            DVector::zeros(1),
        )),
    )
    .unwrap();

    // Non-increasing partition grid.
    assert!(solver
        .run(0.0, DVector::zeros(2), 2.0, &[0.0, 2.0, 1.0])
        .is_err());
    // Single boundary is not a partition.
    assert!(solver.run(0.0, DVector::zeros(2), 2.0, &[0.0]).is_err());
    // Non-finite initial state.
    assert!(solver
        .run(
            0.0,
            DVector::from_vec(vec![f64::NAN, 0.0]),
            2.0,
            &[0.0, 1.0, 2.0]
        )
        .is_err());
}
