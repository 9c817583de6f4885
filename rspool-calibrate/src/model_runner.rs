//! Evaluation of a model for a candidate parameter vector.
//!
//! Runners are pure: one parameter vector in, one [`ModelOutput`] out, with
//! no shared mutable state. That lets optimisers and samplers evaluate many
//! candidates at once with [`ModelRunner::run_batch`].

use crate::target::{Observable, Target};
use crate::{Error, Result};
use indexmap::IndexMap;
use rayon::prelude::*;
use rspool_core::cancel::CancellationToken;
use rspool_core::derived::signatures;
use rspool_core::errors::PoolResult;
use rspool_core::isotope::{simulate_isotopes, IsotopeSettings};
use rspool_core::ivp::SolverOptions;
use rspool_core::model::PoolModel;
use rspool_core::source_curve::SourceCurve;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Model values of each observable on a shared time grid.
///
/// Undefined values (for example the signature of an empty pool) are `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOutput {
    pub times: Vec<f64>,
    pub series: IndexMap<Observable, Vec<Option<f64>>>,
}

impl ModelOutput {
    pub fn new(times: Vec<f64>) -> Self {
        Self {
            times,
            series: IndexMap::new(),
        }
    }

    pub fn insert(&mut self, observable: Observable, values: Vec<Option<f64>>) -> Result<()> {
        if values.len() != self.times.len() {
            return Err(Error::InvalidTarget(format!(
                "{} has {} values for {} output times",
                observable,
                values.len(),
                self.times.len()
            )));
        }
        self.series.insert(observable, values);
        Ok(())
    }

    pub fn get(&self, observable: &Observable) -> Option<&[Option<f64>]> {
        self.series.get(observable).map(|v| v.as_slice())
    }

    /// Index of `time` in the output grid.
    pub fn time_index(&self, time: f64) -> Option<usize> {
        let tolerance = 1e-9 * time.abs().max(1.0);
        self.times.iter().position(|t| (t - time).abs() <= tolerance)
    }

    /// Value of `observable` at `time`, or `None` when it is missing or undefined.
    pub fn value_at(&self, observable: &Observable, time: f64) -> Option<f64> {
        let index = self.time_index(time)?;
        self.series.get(observable)?.get(index).copied().flatten()
    }
}

/// Turns parameter vectors into model output.
pub trait ModelRunner: Sync {
    fn param_names(&self) -> &[String];

    fn run(&self, params: &[f64]) -> Result<ModelOutput>;

    /// Run each parameter vector in parallel.
    fn run_batch(&self, param_sets: &[Vec<f64>]) -> Vec<Result<ModelOutput>> {
        param_sets.par_iter().map(|p| self.run(p)).collect()
    }
}

/// Runs a [`PoolModel`] built from the parameters by a caller-supplied closure.
///
/// Mass and isotope mass are integrated together from `start_time` (or the
/// first output time) and every [`Observable`] is reported at the output
/// times. The source curve is shared read-only between concurrent runs.
pub struct PoolModelRunner<F>
where
    F: Fn(&[f64]) -> PoolResult<PoolModel> + Send + Sync,
{
    param_names: Vec<String>,
    build: F,
    source: Arc<SourceCurve>,
    settings: IsotopeSettings,
    solver: SolverOptions,
    start_time: Option<f64>,
    output_times: Vec<f64>,
    cancel: Option<CancellationToken>,
}

impl<F> PoolModelRunner<F>
where
    F: Fn(&[f64]) -> PoolResult<PoolModel> + Send + Sync,
{
    pub fn new(param_names: Vec<String>, source: Arc<SourceCurve>, build: F) -> Self {
        Self {
            param_names,
            build,
            source,
            settings: IsotopeSettings::default(),
            solver: SolverOptions::default(),
            start_time: None,
            output_times: vec![],
            cancel: None,
        }
    }

    pub fn with_isotope_settings(mut self, settings: IsotopeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_solver_options(mut self, solver: SolverOptions) -> Self {
        self.solver = solver;
        self
    }

    /// Time at which the model's initial state applies.
    pub fn with_start_time(mut self, start_time: f64) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn with_output_times(mut self, times: Vec<f64>) -> Self {
        self.output_times = times;
        self
    }

    /// Report output at every observation time of `target`.
    pub fn for_target(self, target: &Target) -> Self {
        self.with_output_times(target.times())
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn output_times(&self) -> &[f64] {
        &self.output_times
    }

    /// Build the model for `params` without running it.
    pub fn build_model(&self, params: &[f64]) -> Result<PoolModel> {
        if params.len() != self.param_names.len() {
            return Err(Error::InvalidParameter(format!(
                "expected {} parameter values, got {}",
                self.param_names.len(),
                params.len()
            )));
        }
        Ok((self.build)(params)?)
    }
}

impl<F> ModelRunner for PoolModelRunner<F>
where
    F: Fn(&[f64]) -> PoolResult<PoolModel> + Send + Sync,
{
    fn param_names(&self) -> &[String] {
        &self.param_names
    }

    fn run(&self, params: &[f64]) -> Result<ModelOutput> {
        if self.output_times.is_empty() {
            return Err(Error::InvalidTarget(
                "runner has no output times".to_string(),
            ));
        }
        let model = self.build_model(params)?;

        let mut grid = self.output_times.clone();
        let offset = match self.start_time {
            Some(start) if start < grid[0] => {
                grid.insert(0, start);
                1
            }
            Some(start) if start > grid[0] => {
                return Err(Error::InvalidTarget(format!(
                    "start time {} is after the first output time {}",
                    start, grid[0]
                )))
            }
            _ => 0,
        };

        let trajectory = simulate_isotopes(
            &model,
            &self.source,
            &self.settings,
            &grid,
            &self.solver,
            self.cancel.as_ref(),
        )?;
        let derived = signatures(&model, &trajectory)?;

        let n = model.n_pools();
        let rows = offset..grid.len();
        let mut output = ModelOutput::new(grid[offset..].to_vec());

        output.insert(
            Observable::TotalMass,
            rows.clone()
                .map(|i| Some(trajectory.mass.row(i).sum()))
                .collect(),
        )?;
        for j in 0..n {
            output.insert(
                Observable::PoolMass(j),
                rows.clone().map(|i| Some(trajectory.mass[[i, j]])).collect(),
            )?;
        }
        output.insert(
            Observable::SystemSignature,
            derived.system[offset..].to_vec(),
        )?;
        output.insert(
            Observable::RespiredSignature,
            derived.respired[offset..].to_vec(),
        )?;
        for j in 0..n {
            output.insert(
                Observable::PoolSignature(j),
                rows.clone().map(|i| derived.pools[[i, j]]).collect(),
            )?;
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rspool_core::model::{InputFlux, PoolModelBuilder};

    fn one_pool_runner() -> PoolModelRunner<impl Fn(&[f64]) -> PoolResult<PoolModel> + Send + Sync>
    {
        PoolModelRunner::new(
            vec!["k".to_string()],
            Arc::new(SourceCurve::constant(0.0).unwrap()),
            |p: &[f64]| {
                PoolModelBuilder::new(vec![p[0]])
                    .with_input(InputFlux::into_pool(1.0, 0, 1)?)
                    .build()
            },
        )
        .with_isotope_settings(IsotopeSettings::stable())
    }

    #[test]
    fn test_runs_from_start_time() {
        let runner = one_pool_runner()
            .with_start_time(0.0)
            .with_output_times(vec![10.0, 20.0]);
        let output = runner.run(&[0.1]).unwrap();

        assert_eq!(output.times, vec![10.0, 20.0]);
        let mass = output.value_at(&Observable::TotalMass, 10.0).unwrap();
        assert_relative_eq!(mass, 10.0 * (1.0 - (-1.0_f64).exp()), max_relative = 1e-4);
        assert_relative_eq!(
            output.value_at(&Observable::PoolMass(0), 20.0).unwrap(),
            output.value_at(&Observable::TotalMass, 20.0).unwrap()
        );
        assert_relative_eq!(
            output.value_at(&Observable::SystemSignature, 20.0).unwrap(),
            0.0,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_undefined_signature_is_none() {
        // Starts empty, so the signature at the first output time is undefined
        let runner = one_pool_runner().with_output_times(vec![0.0, 5.0]);
        let output = runner.run(&[0.1]).unwrap();
        assert_eq!(output.value_at(&Observable::SystemSignature, 0.0), None);
        assert!(output.value_at(&Observable::SystemSignature, 5.0).is_some());
        assert_eq!(output.value_at(&Observable::TotalMass, 7.0), None);
    }

    #[test]
    fn test_invalid_parameters_propagate() {
        let runner = one_pool_runner().with_output_times(vec![0.0, 5.0]);
        assert!(matches!(runner.run(&[-1.0]), Err(Error::Model(_))));
        assert!(matches!(
            runner.run(&[0.1, 0.2]),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_run_batch_matches_run() {
        let runner = one_pool_runner()
            .with_start_time(0.0)
            .with_output_times(vec![5.0]);
        let params = vec![vec![0.1], vec![0.2], vec![0.5]];
        let batch = runner.run_batch(&params);
        for (p, out) in params.iter().zip(batch) {
            assert_eq!(out.unwrap(), runner.run(p).unwrap());
        }
    }
}
