use nalgebra::{DMatrix, DVector};

/// Hybrid system dynamics: a flow map per discrete mode, a jump map applied
/// at mode switches, and the flow Jacobians used by the LQ approximation.
///
/// Providers may carry internal caches, hence `&mut self`; every worker
/// thread operates on its own clone (`clone_boxed`), so implementations
/// never need interior locking.
pub trait Dynamics: Send + Sync {
    fn state_dim(&self) -> usize;

    fn input_dim(&self) -> usize;

    /// Continuous vector field `dx/dt = f(t, x, u)` in the given mode.
    fn flow(&mut self, mode: usize, t: f64, x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64>;

    /// Discrete state reset applied when switching out of `mode`. Defaults
    /// to the identity (no state jump).
    fn jump(&mut self, mode: usize, t: f64, x: &DVector<f64>) -> DVector<f64> {
        let _ = (mode, t);
        x.clone()
    }

    /// Jacobians `(df/dx, df/du)` of the flow map.
    fn flow_jacobians(
        &mut self,
        mode: usize,
        t: f64,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> (DMatrix<f64>, DMatrix<f64>);

    fn clone_boxed(&self) -> Box<dyn Dynamics>;
}

impl Clone for Box<dyn Dynamics> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}
