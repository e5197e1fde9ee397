use nalgebra::DVector;

/// Fallback (state, input) source used wherever no controller coverage
/// exists: before the first solve, and past the end of a warm-started
/// controller. The rollout samples the provider directly on its time grid
/// instead of integrating the dynamics.
pub trait OperatingPoint: Send + Sync {
    fn state_input(&mut self, t: f64, mode: usize) -> (DVector<f64>, DVector<f64>);

    fn clone_boxed(&self) -> Box<dyn OperatingPoint>;
}

impl Clone for Box<dyn OperatingPoint> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}

/// Constant operating point, the common choice for regulation problems.
#[derive(Debug, Clone)]
pub struct FixedOperatingPoint {
    pub state: DVector<f64>,
    pub input: DVector<f64>,
}

impl FixedOperatingPoint {
    pub fn new(state: DVector<f64>, input: DVector<f64>) -> Self {
        Self { state, input }
    }
}

impl OperatingPoint for FixedOperatingPoint {
    fn state_input(&mut self, _t: f64, _mode: usize) -> (DVector<f64>, DVector<f64>) {
        (self.state.clone(), self.input.clone())
    }

    fn clone_boxed(&self) -> Box<dyn OperatingPoint> {
        Box::new(self.clone())
    }
}
