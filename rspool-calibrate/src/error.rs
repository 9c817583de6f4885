use rspool_core::errors::PoolError;
use thiserror::Error;

/// Error type for calibration.
#[derive(Error, Debug)]
pub enum Error {
    /// The model could not be built or evaluated.
    #[error(transparent)]
    Model(#[from] PoolError),

    #[error("Fit did not converge after {iterations} iterations (cost {cost})")]
    FitDidNotConverge { iterations: usize, cost: f64 },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Sampling error: {0}")]
    SamplingError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Convenience type for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
