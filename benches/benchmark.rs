//! Benchmark of a full DDP solve on the double-integrator regulator; this
//! exercises the rollout, LQ approximation, backward pass, and line search
//! together.
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nalgebra::{DMatrix, DVector};

use hybrid_ddp::ocp::constraint::NoConstraints;
use hybrid_ddp::ocp::linear::{QuadraticCost, SwitchedLinearDynamics};
use hybrid_ddp::ocp::operating_point::FixedOperatingPoint;
use hybrid_ddp::{DdpSolver, Settings};

fn solve_double_integrator() {
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
        num_threads: 4,
        max_iterations: 5,
        time_step: 0.02,
        ..Settings::default()
    };
    let mut solver = DdpSolver::new(
        settings,
        Box::new(dynamics),
        Box::new(cost),
        Box::new(NoConstraints::new(2, 1)),
        Box::new(FixedOperatingPoint::new(
            DVector::from_vec(vec![1.0, 0.0]),
            DVector::zeros(1),
        )),
    )
    .unwrap();

    solver
        .run(
            0.0,
            DVector::from_vec(vec![1.0, 0.0]),
            10.0,
            &[0.0, 2.5, 5.0, 7.5, 10.0],
        )
        .unwrap();
    black_box(solver.performance().cost);
}

fn benchmark(c: &mut Criterion) {
    c.bench_function("solve_double_integrator", |b| {
        b.iter(|| solve_double_integrator());
    });
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
