use thiserror::Error;

/// Errors raised by the multilateration core.
///
/// None of these are fatal to the process: per-message errors are counted
/// and dropped, per-pair errors reset the pair, and sustained per-receiver
/// errors drop the receiver.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// Unwrapped hardware tick moved backward past the wrap threshold.
    #[error("tick went backward by {delta} on receiver {receiver}")]
    BadTick { receiver: usize, delta: u64 },

    /// Payload is not a Mode S frame we understand (length, CRC, format).
    #[error("undecodable Mode S message")]
    BadMessage,

    /// No synchronized path between the two receivers in the clock graph.
    #[error("no sync path from receiver {from} to receiver {to}")]
    NoSyncPath { from: usize, to: usize },

    /// Receiver geometry is too degenerate to solve (collinear, high DOP).
    #[error("receiver geometry unusable (condition {cond:.3e})")]
    PoorGeometry { cond: f64 },

    /// Solver ran out of iterations or wall budget before converging.
    #[error("solver did not converge after {iterations} iterations")]
    NotConverged { iterations: usize },

    /// Converged fix rejected on goodness of fit.
    #[error("residual too high: chi2/dof = {chi2_dof:.1}")]
    HighResidual { chi2_dof: f64 },

    /// Converged fix rejected on altitude or covariance bounds.
    #[error("solution out of bounds: {what}")]
    OutOfBounds { what: &'static str },

    /// A bounded queue or rate limit shed the work.
    #[error("resource exhausted: {what}")]
    ResourceExhausted { what: &'static str },
}

pub type Result<T> = std::result::Result<T, CoreError>;
