use crate::timeseries::Time;
use thiserror::Error;

/// Error type for pool model construction and evaluation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Integration failed at t={time}: {reason}")]
    IntegrationFailure { time: Time, reason: String },
    #[error("System matrix is singular: {0}")]
    SingularSystemMatrix(String),
    /// `pool` is `None` for whole-system and respired-flux aggregates.
    #[error("Isotope ratio is undefined at t={time} (pool {pool:?}): mass is zero")]
    UndefinedRatio { pool: Option<usize>, time: Time },
    #[error("Extrapolation is not allowed. Target={target}, {side} interpolation range={bound}")]
    ExtrapolationNotAllowed {
        target: Time,
        side: String,
        bound: Time,
    },
    #[error("Cancelled during {0}")]
    Cancelled(String),
}

/// Convenience type for `Result<T, PoolError>`.
pub type PoolResult<T> = Result<T, PoolError>;
