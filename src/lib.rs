//! hybrid-ddp: a differential dynamic programming trajectory optimizer for
//! continuous-time hybrid (switched) optimal control problems, built as the
//! optimization core of a receding-horizon MPC stack.
//!
//! The problem (dynamics, cost, constraints, operating point) is supplied
//! through the traits in [`ocp`]; the solver lives in [`solver::ddp`].

pub mod core;
pub mod ocp;
pub mod solver;

pub use crate::ocp::mode_schedule::ModeSchedule;
pub use crate::ocp::reference::ReferenceTrajectory;
pub use crate::ocp::trajectory::{LinearController, Trajectory};
pub use crate::solver::ddp::{DdpSolver, PrimalSolution, SolutionController};
pub use crate::solver::error::DdpError;
pub use crate::solver::settings::Settings;
