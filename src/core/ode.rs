//! Explicit fixed-step integration of vector-valued ODEs.
//!
//! The forward rollout integrates system states (`DVector`) and the backward
//! pass integrates Riccati coefficient bundles; both go through the same
//! generic RK4 step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nalgebra::DVector;

/// State types that the RK4 stepper can advance: anything that supports the
/// axpy-style update `self + scale * other`.
pub trait OdeState: Clone {
    fn add_scaled(&self, other: &Self, scale: f64) -> Self;
}

impl OdeState for DVector<f64> {
    fn add_scaled(&self, other: &Self, scale: f64) -> Self {
        self + other * scale
    }
}

/// Classical 4th-order Runge-Kutta step.
pub fn rk4_step<S, F>(dt: f64, t: f64, x: &S, dynamics: &mut F) -> S
where
    S: OdeState,
    F: FnMut(f64, &S) -> S,
{
    let t_mid = t + 0.5 * dt;
    let t_next = t + dt;
    let k1 = dynamics(t, x);
    let k2 = dynamics(t_mid, &x.add_scaled(&k1, 0.5 * dt));
    let k3 = dynamics(t_mid, &x.add_scaled(&k2, 0.5 * dt));
    let k4 = dynamics(t_next, &x.add_scaled(&k3, dt));
    const ONE_BY_SIX: f64 = 1.0 / 6.0;
    x.add_scaled(&k1, ONE_BY_SIX * dt)
        .add_scaled(&k2, 2.0 * ONE_BY_SIX * dt)
        .add_scaled(&k3, 2.0 * ONE_BY_SIX * dt)
        .add_scaled(&k4, ONE_BY_SIX * dt)
}

/// Number of uniform steps covering `[t_begin, t_final]` without exceeding
/// `dt_max` per step. Always at least one step, even for degenerate windows.
pub fn uniform_step_count(t_begin: f64, t_final: f64, dt_max: f64) -> usize {
    assert!(dt_max > 0.0, "maximum time step must be positive");
    let span = (t_final - t_begin).max(0.0);
    ((span / dt_max).ceil() as usize).max(1)
}

/// Cooperative cancellation flag shared between the line-search coordinator
/// and in-flight rollouts. Integration loops poll it once per step; there is
/// no preemption.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}
