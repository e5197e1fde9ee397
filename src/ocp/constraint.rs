use nalgebra::{DMatrix, DVector};

/// Values and Jacobians of a block of active state-input constraints; rows
/// correspond to the active constraints at the query time.
#[derive(Debug, Clone)]
pub struct ConstraintBlock {
    pub values: DVector<f64>,
    pub dfdx: DMatrix<f64>,
    pub dfdu: DMatrix<f64>,
}

/// Values and Jacobian of a block of active state-only constraints.
#[derive(Debug, Clone)]
pub struct StateConstraintBlock {
    pub values: DVector<f64>,
    pub dfdx: DMatrix<f64>,
}

/// Constraint provider for the optimal control problem.
///
/// Active counts may vary with time but must never exceed the input
/// dimension; the solver treats a violation as a provider contract fault,
/// not a numerical condition. Inequalities use the `g(t, x, u) >= 0`
/// convention. Each worker thread owns an independent clone.
pub trait Constraints: Send + Sync {
    /// Active state-input equality constraints `e(t, x, u) = 0`.
    fn num_state_input_eq(&mut self, t: f64) -> usize;

    fn state_input_eq(&mut self, t: f64, x: &DVector<f64>, u: &DVector<f64>) -> ConstraintBlock;

    /// Active state-only equality constraints `h(t, x) = 0`.
    fn num_state_eq(&mut self, t: f64) -> usize;

    fn state_eq(&mut self, t: f64, x: &DVector<f64>) -> StateConstraintBlock;

    /// Active inequality constraints `g(t, x, u) >= 0`.
    fn num_inequality(&mut self, t: f64) -> usize;

    fn inequality(&mut self, t: f64, x: &DVector<f64>, u: &DVector<f64>) -> ConstraintBlock;

    /// Active final-state equality constraints at an event time.
    fn num_final_state_eq(&mut self, t: f64) -> usize;

    fn final_state_eq(&mut self, t: f64, x: &DVector<f64>) -> StateConstraintBlock;

    fn clone_boxed(&self) -> Box<dyn Constraints>;
}

impl Clone for Box<dyn Constraints> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}

/// Unconstrained problem: every block is empty.
#[derive(Debug, Clone, Default)]
pub struct NoConstraints {
    pub state_dim: usize,
    pub input_dim: usize,
}

impl NoConstraints {
    pub fn new(state_dim: usize, input_dim: usize) -> Self {
        Self {
            state_dim,
            input_dim,
        }
    }

    fn empty_block(&self) -> ConstraintBlock {
        ConstraintBlock {
            values: DVector::zeros(0),
            dfdx: DMatrix::zeros(0, self.state_dim),
            dfdu: DMatrix::zeros(0, self.input_dim),
        }
    }

    fn empty_state_block(&self) -> StateConstraintBlock {
        StateConstraintBlock {
            values: DVector::zeros(0),
            dfdx: DMatrix::zeros(0, self.state_dim),
        }
    }
}

impl Constraints for NoConstraints {
    fn num_state_input_eq(&mut self, _t: f64) -> usize {
        0
    }

    fn state_input_eq(&mut self, _t: f64, _x: &DVector<f64>, _u: &DVector<f64>) -> ConstraintBlock {
        self.empty_block()
    }

    fn num_state_eq(&mut self, _t: f64) -> usize {
        0
    }

    fn state_eq(&mut self, _t: f64, _x: &DVector<f64>) -> StateConstraintBlock {
        self.empty_state_block()
    }

    fn num_inequality(&mut self, _t: f64) -> usize {
        0
    }

    fn inequality(&mut self, _t: f64, _x: &DVector<f64>, _u: &DVector<f64>) -> ConstraintBlock {
        self.empty_block()
    }

    fn num_final_state_eq(&mut self, _t: f64) -> usize {
        0
    }

    fn final_state_eq(&mut self, _t: f64, _x: &DVector<f64>) -> StateConstraintBlock {
        self.empty_state_block()
    }

    fn clone_boxed(&self) -> Box<dyn Constraints> {
        Box::new(self.clone())
    }
}
