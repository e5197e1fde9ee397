//! Golden regression: on an unconstrained linear-quadratic problem the DDP
//! iteration must recover the textbook LQR solution.

use approx::assert_relative_eq;
use nalgebra::{DMatrix, DVector};

use hybrid_ddp::ocp::constraint::NoConstraints;
use hybrid_ddp::ocp::linear::{QuadraticCost, SwitchedLinearDynamics};
use hybrid_ddp::ocp::operating_point::FixedOperatingPoint;
use hybrid_ddp::{DdpSolver, Settings};

/// Double integrator with `Q = I`, `R = 1`. The stationary Riccati solution
/// is `P = [[sqrt(3), 1], [1, sqrt(3)]]`, so over a long horizon the optimal
/// cost from `x0` approaches `0.5 * x0' P x0`.
fn build_solver(num_threads: usize) -> DdpSolver {
    let dynamics = SwitchedLinearDynamics::time_invariant(
        DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 0.0, 0.0]),
        DMatrix::from_row_slice(2, 1, &[0.0, 1.0]),
    );
    let cost = QuadraticCost::new(
        DMatrix::identity(2, 2),
        DMatrix::identity(1, 1),
        DMatrix::identity(2, 2),
    );
    let settings = Settings {
        num_threads,
        max_iterations: 10,
        time_step: 0.01,
        min_rel_cost: 1e-6,
        ..Settings::default()
    };
    DdpSolver::new(
        settings,
        Box::new(dynamics),
        Box::new(cost),
        Box::new(NoConstraints::new(2, 1)),
        Box::new(FixedOperatingPoint::new(
            DVector::from_vec(vec![1.0, 0.0]),
            DVector::zeros(1),
        )),
    )
    .unwrap()
}

fn closed_form_cost(x0: &DVector<f64>) -> f64 {
    let sqrt3 = 3.0_f64.sqrt();
    let p = DMatrix::from_row_slice(2, 2, &[sqrt3, 1.0, 1.0, sqrt3]);
    0.5 * x0.dot(&(&p * x0))
}

#[test]
fn converges_to_known_lqr_cost() {
    let mut solver = build_solver(4);
    let x0 = DVector::from_vec(vec![1.0, 0.0]);
    solver
        .run(0.0, x0.clone(), 20.0, &[0.0, 5.0, 10.0, 15.0, 20.0])
        .unwrap();

    let cost = solver.performance().cost;
    assert_relative_eq!(cost, closed_form_cost(&x0), max_relative = 2e-2);

    // A linear-quadratic problem is solved by the first full Newton step;
    // the iteration budget must not be exhausted.
    assert!(solver.num_iterations() + 1 < solver.settings().max_iterations);
}

#[test]
fn value_function_matches_algebraic_riccati_solution() {
    let mut solver = build_solver(2);
    let x0 = DVector::from_vec(vec![1.0, 0.0]);
    solver
        .run(0.0, x0.clone(), 20.0, &[0.0, 10.0, 20.0])
        .unwrap();

    // Far from the horizon end the value function is stationary; probe a
    // perturbed state and compare against the closed-form quadratic.
    let probe = DVector::from_vec(vec![0.3, -0.4]);
    let value = solver.value_function(0.0, &probe).unwrap();
    assert_relative_eq!(value, closed_form_cost(&probe), max_relative = 5e-2);
}

#[test]
fn value_function_queries_are_idempotent() {
    let mut solver = build_solver(4);
    let x0 = DVector::from_vec(vec![1.0, 0.5]);
    solver.run(0.0, x0, 10.0, &[0.0, 5.0, 10.0]).unwrap();

    let probe = DVector::from_vec(vec![0.7, -0.1]);
    let first = solver.value_function(3.3, &probe).unwrap();
    let second = solver.value_function(3.3, &probe).unwrap();
    // Bit-identical, not merely approximately equal.
    assert_eq!(first.to_bits(), second.to_bits());

    let grad_first = solver.value_function_state_derivative(3.3, &probe).unwrap();
    let grad_second = solver.value_function_state_derivative(3.3, &probe).unwrap();
    assert_eq!(grad_first, grad_second);
}

#[test]
fn primal_solution_spans_horizon_with_increasing_times() {
    let mut solver = build_solver(4);
    let x0 = DVector::from_vec(vec![1.0, 0.0]);
    solver.run(0.0, x0, 8.0, &[0.0, 2.0, 4.0, 6.0, 8.0]).unwrap();

    let solution = solver.primal_solution(8.0).unwrap();
    let times = &solution.trajectory.times;
    assert_relative_eq!(*times.first().unwrap(), 0.0);
    assert_relative_eq!(*times.last().unwrap(), 8.0);
    for (k, pair) in times.windows(2).enumerate() {
        let is_post_event = solution.trajectory.post_event_indices.contains(&(k + 1));
        if is_post_event {
            assert!(pair[1] >= pair[0]);
        } else {
            assert!(pair[1] > pair[0], "time not increasing at index {}", k);
        }
    }
}

#[test]
fn warm_started_resolve_converges_quickly() {
    let mut solver = build_solver(4);
    let x0 = DVector::from_vec(vec![1.0, 0.0]);
    let partitions = [0.0, 5.0, 10.0, 15.0, 20.0];
    solver.run(0.0, x0.clone(), 20.0, &partitions).unwrap();
    let first_iterations = solver.num_iterations();

    // Re-solving the same problem from the cached controllers must not take
    // more iterations than the cold solve.
    solver.run(0.0, x0, 20.0, &partitions).unwrap();
    assert!(solver.num_iterations() <= first_iterations.max(1));
}
