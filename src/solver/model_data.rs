use nalgebra::{DMatrix, DVector};

/// Linear-quadratic model of the problem at one trajectory sample:
/// linearized dynamics, quadratized cost (inequality penalty folded in),
/// and the active equality-constraint blocks.
///
/// Recomputed from scratch every iteration; never persisted.
#[derive(Debug, Clone)]
pub struct ModelData {
    pub time: f64,

    /// Dynamics Jacobians of the flow map.
    pub a: DMatrix<f64>,
    pub b: DMatrix<f64>,

    /// Cost expansion around the nominal sample.
    pub q: f64,
    pub qx: DVector<f64>,
    pub qu: DVector<f64>,
    pub qxx: DMatrix<f64>,
    pub quu: DMatrix<f64>,
    pub qux: DMatrix<f64>,

    /// State-input equality constraints (`num_eq` active rows).
    pub num_eq: usize,
    pub e: DVector<f64>,
    pub e_x: DMatrix<f64>,
    pub e_u: DMatrix<f64>,

    /// State-only equality constraints (`num_state_eq` active rows).
    pub num_state_eq: usize,
    pub h: DVector<f64>,
    pub h_x: DMatrix<f64>,

    /// Inequality constraint values, kept for merit bookkeeping.
    pub num_ineq: usize,
    pub g: DVector<f64>,
}

/// Quadratic approximation attached to an event (mode switch) time: the
/// final cost of the ending mode plus the penalized final-state equality
/// constraint, folded into the value function at the pre-event sample.
#[derive(Debug, Clone)]
pub struct EventLqData {
    pub time: f64,
    pub q: f64,
    pub qx: DVector<f64>,
    pub qxx: DMatrix<f64>,
    /// Raw final-state constraint, kept for the final-constraint ISE.
    pub num_final_eq: usize,
    pub h: DVector<f64>,
}
