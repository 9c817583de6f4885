//! Calibration of pool models against observations.
//!
//! A [`ModelRunner`] turns a parameter vector into model output, a
//! [`CostFunction`] compares that output with a [`Target`], and the cost is
//! minimised with [`LevenbergMarquardt`] or explored with the
//! [`MetropolisSampler`]. Every model evaluation is independent, so
//! candidate vectors are evaluated in parallel with `rayon`.

mod error;
pub mod model_runner;
pub mod objective;
pub mod optimizer;
pub mod parameter_set;
pub mod sampler;
pub mod target;

pub use error::{Error, Result};
pub use model_runner::{ModelOutput, ModelRunner, PoolModelRunner};
pub use objective::{CostFunction, Objective};
pub use optimizer::{FitResult, FitStatus, LevenbergMarquardt};
pub use parameter_set::{Parameter, ParameterSet};
pub use sampler::{
    BoundsPolicy, Chain, MetropolisSampler, ParameterSummary, PosteriorSummary, ProgressInfo,
    ProposalCovariance, SamplerSettings, SamplingResult,
};
pub use target::{Observable, Observation, ObservedSeries, Target};
