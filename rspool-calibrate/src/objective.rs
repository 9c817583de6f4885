//! Weighted least-squares cost of a model against a [`Target`].

use crate::model_runner::{ModelOutput, ModelRunner};
use crate::target::Target;
use crate::{Error, Result};

/// A residual vector over parameter vectors.
///
/// The cost is the sum of squared residuals. Implementations must be pure so
/// candidates can be evaluated concurrently.
pub trait Objective: Sync {
    fn param_names(&self) -> &[String];

    fn residuals(&self, params: &[f64]) -> Result<Vec<f64>>;

    fn cost(&self, params: &[f64]) -> Result<f64> {
        Ok(self.residuals(params)?.iter().map(|r| r * r).sum())
    }
}

/// Residuals `(model - observed) / sigma` for every observation in a target.
///
/// Each series is scaled by its own sigma so that mass and signature
/// observations contribute on comparable scales.
pub struct CostFunction<R: ModelRunner> {
    runner: R,
    target: Target,
}

impl<R: ModelRunner> CostFunction<R> {
    pub fn new(runner: R, target: Target) -> Result<Self> {
        target.validate()?;
        Ok(Self { runner, target })
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn n_observations(&self) -> usize {
        self.target.n_observations()
    }

    /// Residuals of an already computed model output.
    pub fn residuals_of(&self, output: &ModelOutput) -> Result<Vec<f64>> {
        let mut residuals = Vec::with_capacity(self.target.n_observations());
        for series in self.target.series() {
            let observable = series.observable();
            let sigma = series.sigma();
            if output.get(&observable).is_none() {
                return Err(Error::InvalidTarget(format!(
                    "model output does not include {}",
                    observable
                )));
            }
            for obs in series.observations() {
                let modelled = output.value_at(&observable, obs.time).ok_or_else(|| {
                    Error::InvalidTarget(format!(
                        "{} is undefined in the model output at t={}",
                        observable, obs.time
                    ))
                })?;
                residuals.push((modelled - obs.value) / sigma);
            }
        }
        Ok(residuals)
    }
}

impl<R: ModelRunner> Objective for CostFunction<R> {
    fn param_names(&self) -> &[String] {
        self.runner.param_names()
    }

    fn residuals(&self, params: &[f64]) -> Result<Vec<f64>> {
        let output = self.runner.run(params)?;
        self.residuals_of(&output)
    }
}
