use thiserror::Error;

/// Configuration errors detected while setting up an optimization.
///
/// These are raised eagerly, before any iteration runs, and are returned
/// wrapped in an [`anyhow::Error`]. Use `err.downcast_ref::<NlpError>()`
/// to tell them apart from failures reported by the problem itself.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NlpError {
    #[error("{what}: expected length {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("constraint Jacobian is {rows}x{cols}, expected {num_cons}x{num_vars}")]
    JacobianShape {
        rows: usize,
        cols: usize,
        num_cons: usize,
        num_vars: usize,
    },

    #[error("constraint Jacobian row {row} has {len} entries, expected {num_vars}")]
    RaggedJacobian {
        row: usize,
        len: usize,
        num_vars: usize,
    },

    #[error("problem must have at least one variable")]
    NoVariables,

    #[error("invalid option {name} ({value}): {reason}")]
    InvalidOption {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },

    #[error("{0} is only available in elastic mode")]
    NotElastic(&'static str),
}
