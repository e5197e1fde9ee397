use thiserror::Error;

/// Solver fault taxonomy.
///
/// Configuration faults are raised before any numerical work. Divergence and
/// cancellation are recoverable inside a single line-search candidate (the
/// candidate gets a worst-case merit) but fatal anywhere else. Contract
/// violations by the problem providers are always fatal.
#[derive(Debug, Error)]
pub enum DdpError {
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("partition grid must contain at least two strictly increasing times")]
    InvalidPartitionGrid,

    #[error("controller count {controllers} does not match partition count {partitions}")]
    ControllerCountMismatch {
        controllers: usize,
        partitions: usize,
    },

    #[error("initial state is not finite (t = {time} [s])")]
    NonFiniteInitialState { time: f64 },

    #[error("rollout diverged: non-finite state near t = {time} [s]")]
    RolloutDiverged { time: f64 },

    #[error("rollout cancelled by the line-search coordinator")]
    RolloutCancelled,

    #[error("{kind} constraint count {count} exceeds the input dimension {input_dim}")]
    ConstraintDimension {
        kind: &'static str,
        count: usize,
        input_dim: usize,
    },

    #[error("trajectory arrays are inconsistent: {0}")]
    TrajectoryMismatch(String),

    #[error("backward pass hit an ill-conditioned matrix: {what}")]
    IllConditioned { what: &'static str },

    #[error("cached trajectory is inconsistent with the nominal one: {0}")]
    CacheInconsistency(String),

    #[error("rewind count {count} exceeds the partition count {partitions}")]
    RewindOutOfRange { count: usize, partitions: usize },

    #[error("solver state is missing a prerequisite: {0}")]
    MissingPrerequisite(&'static str),
}

impl DdpError {
    /// Whether a line-search candidate may absorb this fault as an
    /// infeasible step instead of aborting the solve.
    pub fn is_recoverable_in_line_search(&self) -> bool {
        matches!(
            self,
            DdpError::RolloutDiverged { .. } | DdpError::RolloutCancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(DdpError::RolloutDiverged { time: 1.0 }.is_recoverable_in_line_search());
        assert!(DdpError::RolloutCancelled.is_recoverable_in_line_search());
        assert!(!DdpError::InvalidPartitionGrid.is_recoverable_in_line_search());
        assert!(!DdpError::ConstraintDimension {
            kind: "state-input equality",
            count: 3,
            input_dim: 2
        }
        .is_recoverable_in_line_search());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            DdpError::ControllerCountMismatch {
                controllers: 2,
                partitions: 3
            }
            .to_string(),
            "controller count 2 does not match partition count 3"
        );
        assert!(DdpError::RolloutDiverged { time: 0.5 }
            .to_string()
            .contains("non-finite"));
    }
}
