//! Random-walk Metropolis sampling of the parameter posterior.
//!
//! The log posterior is `log_prior - cost / 2`, with a uniform prior on the
//! parameter box and `cost` the weighted sum of squared residuals of an
//! [`Objective`]. Each chain proposes `x' = x + L z` with `z ~ N(0, I)` and
//! `L` the Cholesky factor of the proposal covariance, and accepts with
//! probability `min(1, exp(lp' - lp))`. A rejected proposal repeats the
//! current sample, so every chain has one sample per iteration.
//!
//! Every chain proposes in each iteration and the proposals are evaluated in
//! parallel. Each chain draws from its own seeded stream, so results do not
//! depend on thread scheduling.

use crate::objective::Objective;
use crate::optimizer::FitResult;
use crate::parameter_set::ParameterSet;
use crate::{Error, Result};
use indexmap::IndexMap;
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use rspool_core::cancel::CancellationToken;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Passed to the progress callback after every iteration.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// 0-indexed
    pub iteration: usize,
    pub total: usize,
    /// Fraction of proposals accepted so far, over all chains
    pub acceptance_rate: f64,
    pub mean_log_prob: f64,
}

/// Gaussian proposal distribution, stored as its lower Cholesky factor.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalCovariance {
    lower: DMatrix<f64>,
}

impl ProposalCovariance {
    /// Factor a proposal covariance matrix.
    ///
    /// The matrix is symmetrised first.
    ///
    /// # Errors
    /// [`Error::InvalidParameter`] when it is not square or not positive
    /// definite.
    pub fn new(covariance: &Array2<f64>) -> Result<Self> {
        let (rows, cols) = covariance.dim();
        if rows != cols || rows == 0 {
            return Err(Error::InvalidParameter(format!(
                "proposal covariance must be square and non-empty, got {}x{}",
                rows, cols
            )));
        }
        let matrix = DMatrix::from_fn(rows, cols, |i, j| {
            0.5 * (covariance[[i, j]] + covariance[[j, i]])
        });
        let cholesky = matrix.cholesky().ok_or_else(|| {
            Error::InvalidParameter("proposal covariance is not positive definite".to_string())
        })?;
        Ok(Self {
            lower: cholesky.l(),
        })
    }

    /// Independent proposals with the given standard deviations.
    pub fn diagonal(std_devs: &[f64]) -> Result<Self> {
        if std_devs.is_empty() || std_devs.iter().any(|s| !(*s > 0.0) || !s.is_finite()) {
            return Err(Error::InvalidParameter(format!(
                "proposal standard deviations must be positive, got {:?}",
                std_devs
            )));
        }
        Ok(Self {
            lower: DMatrix::from_diagonal(&DVector::from_column_slice(std_devs)),
        })
    }

    /// Fit covariance scaled by `2.38² / p`.
    pub fn from_fit(fit: &FitResult) -> Result<Self> {
        let covariance = fit.covariance.as_ref().ok_or_else(|| {
            Error::SamplingError("fit has no covariance estimate".to_string())
        })?;
        let scale = 2.38_f64.powi(2) / fit.params.len() as f64;
        Self::new(&(covariance * scale))
    }

    /// Number of parameters the proposal moves.
    pub fn dim(&self) -> usize {
        self.lower.nrows()
    }

    fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> DVector<f64> {
        let z = DVector::from_iterator(
            self.dim(),
            (0..self.dim()).map(|_| rng.sample::<f64, _>(StandardNormal)),
        );
        &self.lower * z
    }
}

/// What happens to proposals outside the parameter box.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundsPolicy {
    /// Count as rejected without evaluating the model.
    #[default]
    Reject,
    /// Mirror back into the box at the bounds.
    Reflect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerSettings {
    pub n_iterations: usize,
    /// Leading iterations left out of the posterior summary.
    pub burn_in: usize,
    pub n_chains: usize,
    pub seed: u64,
    pub bounds_policy: BoundsPolicy,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            n_iterations: 5000,
            burn_in: 1000,
            n_chains: 4,
            seed: 0,
            bounds_policy: BoundsPolicy::default(),
        }
    }
}

/// Samples from every chain at every iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    /// One `[chain, param]` array per iteration
    samples: Vec<Array2<f64>>,
    /// One `[chain]` array per iteration
    log_probs: Vec<Array1<f64>>,
    param_names: Vec<String>,
    n_accepted: Vec<usize>,
    n_proposed: Vec<usize>,
}

impl Chain {
    /// Empty storage for `n_chains` chains over `param_names`.
    pub fn new(param_names: Vec<String>, n_chains: usize) -> Self {
        Self {
            samples: Vec::new(),
            log_probs: Vec::new(),
            param_names,
            n_accepted: vec![0; n_chains],
            n_proposed: vec![0; n_chains],
        }
    }

    /// Record one iteration. `accepted[c]` says whether chain `c` moved.
    pub fn push(&mut self, positions: Array2<f64>, log_probs: Array1<f64>, accepted: &[bool]) {
        for (c, moved) in accepted.iter().enumerate() {
            self.n_proposed[c] += 1;
            if *moved {
                self.n_accepted[c] += 1;
            }
        }
        self.samples.push(positions);
        self.log_probs.push(log_probs);
    }

    /// Number of stored iterations.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// `true` before the first iteration is recorded.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of independent chains run side by side.
    pub fn n_chains(&self) -> usize {
        self.n_accepted.len()
    }

    /// Parameter names, in column order of every sample.
    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    /// Samples of iteration `i`, `[chain, param]`.
    pub fn iteration(&self, i: usize) -> Option<&Array2<f64>> {
        self.samples.get(i)
    }

    /// Fraction of proposals each chain accepted.
    pub fn acceptance_fraction(&self) -> Array1<f64> {
        self.n_accepted
            .iter()
            .zip(self.n_proposed.iter())
            .map(|(a, p)| if *p > 0 { *a as f64 / *p as f64 } else { 0.0 })
            .collect()
    }

    /// Acceptance fraction averaged over chains.
    pub fn mean_acceptance_rate(&self) -> f64 {
        let proposed: usize = self.n_proposed.iter().sum();
        if proposed == 0 {
            return 0.0;
        }
        self.n_accepted.iter().sum::<usize>() as f64 / proposed as f64
    }

    /// All chains after `discard` iterations, `[(len - discard) * n_chains, param]`.
    pub fn flat_samples(&self, discard: usize) -> Array2<f64> {
        if discard >= self.len() {
            return Array2::zeros((0, self.param_names.len()));
        }
        let n_chains = self.n_chains();
        let mut flat = Array2::zeros(((self.len() - discard) * n_chains, self.param_names.len()));
        for (i, sample) in self.samples[discard..].iter().enumerate() {
            for (c, row) in sample.outer_iter().enumerate() {
                flat.row_mut(i * n_chains + c).assign(&row);
            }
        }
        flat
    }

    /// Log posteriors matching the rows of [`Chain::flat_samples`].
    pub fn flat_log_probs(&self, discard: usize) -> Array1<f64> {
        if discard >= self.len() {
            return Array1::zeros(0);
        }
        self.log_probs[discard..]
            .iter()
            .flat_map(|lp| lp.iter().cloned())
            .collect()
    }

    /// Flattened samples keyed by parameter name.
    ///
    /// # Arguments
    ///
    /// * `discard` - Number of leading iterations to drop as burn-in
    pub fn to_param_map(&self, discard: usize) -> IndexMap<String, Array1<f64>> {
        let flat = self.flat_samples(discard);
        self.param_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), flat.column(i).to_owned()))
            .collect()
    }

    /// Write the chain to `path` in bincode format.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Read a chain written by [`Chain::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        Ok(bincode::deserialize_from(&mut reader)?)
    }

    /// Append a later segment of the same chains.
    pub fn merge(&mut self, other: &Chain) -> Result<()> {
        if self.param_names != other.param_names {
            return Err(Error::SamplingError(format!(
                "chain segments calibrate different parameters ({:?} then {:?})",
                self.param_names, other.param_names
            )));
        }
        if self.n_chains() != other.n_chains() {
            return Err(Error::SamplingError(format!(
                "chain segments hold {} and {} parallel chains",
                self.n_chains(),
                other.n_chains()
            )));
        }
        self.samples.extend(other.samples.iter().cloned());
        self.log_probs.extend(other.log_probs.iter().cloned());
        for c in 0..self.n_chains() {
            self.n_accepted[c] += other.n_accepted[c];
            self.n_proposed[c] += other.n_proposed[c];
        }
        Ok(())
    }

    /// Trace of one parameter in each chain after `discard` iterations.
    fn traces(&self, param: usize, discard: usize) -> Vec<Vec<f64>> {
        (0..self.n_chains())
            .map(|c| {
                self.samples[discard..]
                    .iter()
                    .map(|s| s[[c, param]])
                    .collect()
            })
            .collect()
    }

    /// Split-half Gelman–Rubin statistic per parameter.
    ///
    /// Each chain is split in two and the within- and between-chain
    /// variances of the halves are compared; values near 1 indicate the
    /// chains sample the same distribution. Empty with fewer than four
    /// iterations after `discard`.
    pub fn r_hat(&self, discard: usize) -> IndexMap<String, f64> {
        let mut result = IndexMap::new();
        if discard >= self.len() || self.len() - discard < 4 {
            return result;
        }
        let half = (self.len() - discard) / 2;

        for (p, name) in self.param_names.iter().enumerate() {
            let traces = self.traces(p, discard);
            let halves: Vec<&[f64]> = traces
                .iter()
                .flat_map(|t| [&t[..half], &t[half..2 * half]])
                .collect();
            result.insert(name.clone(), split_r_hat(&halves));
        }
        result
    }

    /// `true` when every R-hat is finite and below `threshold`.
    pub fn is_converged(&self, discard: usize, threshold: f64) -> bool {
        let r_hat = self.r_hat(discard);
        !r_hat.is_empty() && r_hat.values().all(|v| v.is_finite() && *v < threshold)
    }

    /// Effective sample size per parameter, pooled over chains.
    ///
    /// `N / (1 + 2 Σ ρ_k)` with the chain-averaged autocorrelation summed
    /// until it first turns non-positive. Empty with fewer than ten
    /// iterations after `discard`.
    pub fn ess(&self, discard: usize) -> IndexMap<String, f64> {
        let mut result = IndexMap::new();
        if discard >= self.len() || self.len() - discard < 10 {
            return result;
        }
        let n_keep = self.len() - discard;
        let max_lag = (n_keep / 2).min(100);

        for (p, name) in self.param_names.iter().enumerate() {
            let traces = self.traces(p, discard);
            let mut mean_rho = vec![0.0; max_lag];
            for trace in &traces {
                for (k, rho) in autocorrelation(trace, max_lag).iter().enumerate() {
                    mean_rho[k] += rho / traces.len() as f64;
                }
            }
            let tau = 1.0
                + 2.0
                    * mean_rho
                        .iter()
                        .take_while(|rho| **rho > 0.0)
                        .sum::<f64>();
            result.insert(name.clone(), (n_keep * traces.len()) as f64 / tau);
        }
        result
    }
}

fn split_r_hat(halves: &[&[f64]]) -> f64 {
    let n = halves[0].len() as f64;
    let m = halves.len() as f64;
    let means: Vec<f64> = halves.iter().map(|h| h.iter().sum::<f64>() / n).collect();
    let within = halves
        .iter()
        .zip(means.iter())
        .map(|(h, mean)| h.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0))
        .sum::<f64>()
        / m;
    let grand_mean = means.iter().sum::<f64>() / m;
    let between = n * means.iter().map(|x| (x - grand_mean).powi(2)).sum::<f64>() / (m - 1.0);

    if within == 0.0 {
        return if between == 0.0 { 1.0 } else { f64::INFINITY };
    }
    let pooled = ((n - 1.0) * within + between) / n;
    (pooled / within).sqrt()
}

/// Autocorrelation at lags `1..=max_lag`.
fn autocorrelation(trace: &[f64], max_lag: usize) -> Vec<f64> {
    let n = trace.len();
    let mean = trace.iter().sum::<f64>() / n as f64;
    let variance = trace.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
    if variance == 0.0 {
        return vec![0.0; max_lag];
    }
    (1..=max_lag)
        .map(|lag| {
            if lag >= n {
                return 0.0;
            }
            let covariance = trace[..n - lag]
                .iter()
                .zip(trace[lag..].iter())
                .map(|(a, b)| (a - mean) * (b - mean))
                .sum::<f64>()
                / (n - lag) as f64;
            covariance / variance
        })
        .collect()
}

/// Linear interpolation between order statistics of sorted `values`.
fn quantile(sorted: &[f64], p: f64) -> f64 {
    let position = p * (sorted.len() - 1) as f64;
    let below = position.floor() as usize;
    let above = position.ceil() as usize;
    let fraction = position - below as f64;
    sorted[below] + fraction * (sorted[above] - sorted[below])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSummary {
    pub mean: f64,
    pub sd: f64,
    /// 2.5% quantile
    pub lower: f64,
    pub median: f64,
    /// 97.5% quantile
    pub upper: f64,
}

/// Posterior statistics of the post-burn-in samples of all chains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorSummary {
    pub parameters: IndexMap<String, ParameterSummary>,
    pub n_samples: usize,
    pub acceptance_rate: f64,
    pub r_hat: IndexMap<String, f64>,
    pub ess: IndexMap<String, f64>,
}

impl PosteriorSummary {
    /// Summarise every parameter after dropping `burn_in` iterations.
    ///
    /// # Errors
    /// [`Error::SamplingError`] when fewer than two samples remain after burn-in.
    pub fn from_chain(chain: &Chain, burn_in: usize) -> Result<Self> {
        let samples = chain.to_param_map(burn_in);
        let n_samples = samples.values().next().map_or(0, |s| s.len());
        if n_samples < 2 {
            return Err(Error::SamplingError(format!(
                "{} samples remain after discarding {} iterations",
                n_samples, burn_in
            )));
        }

        let parameters = samples
            .into_iter()
            .map(|(name, values)| {
                let mean = values.sum() / n_samples as f64;
                let sd = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                    / (n_samples - 1) as f64)
                    .sqrt();
                let mut sorted = values.to_vec();
                sorted.sort_by(|a, b| a.total_cmp(b));
                let summary = ParameterSummary {
                    mean,
                    sd,
                    lower: quantile(&sorted, 0.025),
                    median: quantile(&sorted, 0.5),
                    upper: quantile(&sorted, 0.975),
                };
                (name, summary)
            })
            .collect();

        Ok(Self {
            parameters,
            n_samples,
            acceptance_rate: chain.mean_acceptance_rate(),
            r_hat: chain.r_hat(burn_in),
            ess: chain.ess(burn_in),
        })
    }

    /// Summary of the parameter called `name`.
    pub fn get(&self, name: &str) -> Option<&ParameterSummary> {
        self.parameters.get(name)
    }

    /// Posterior means in parameter order.
    pub fn means(&self) -> Vec<f64> {
        self.parameters.values().map(|p| p.mean).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingResult {
    /// Every iteration of every chain, burn-in included
    pub chain: Chain,
    pub burn_in: usize,
    pub summary: PosteriorSummary,
}

/// Metropolis sampler over an [`Objective`] within a parameter box.
pub struct MetropolisSampler<O: Objective> {
    objective: O,
    params: ParameterSet,
    proposal: ProposalCovariance,
    settings: SamplerSettings,
    cancel: Option<CancellationToken>,
}

impl<O: Objective> MetropolisSampler<O> {
    /// Create a sampler with default [`SamplerSettings`].
    ///
    /// # Arguments
    ///
    /// * `objective` - Cost whose half gives the negative log likelihood
    /// * `params` - Box bounds, which also define the uniform prior
    /// * `proposal` - Random-walk proposal; its dimension must match `params`
    pub fn new(objective: O, params: ParameterSet, proposal: ProposalCovariance) -> Result<Self> {
        let n = params.len();
        if objective.param_names().len() != n || proposal.dim() != n {
            return Err(Error::InvalidParameter(format!(
                "objective has {} parameters, bounds {} and proposal {}",
                objective.param_names().len(),
                n,
                proposal.dim()
            )));
        }
        Ok(Self {
            objective,
            params,
            proposal,
            settings: SamplerSettings::default(),
            cancel: None,
        })
    }

    /// Replace the iteration counts, chain count, seed and bounds policy.
    pub fn with_settings(mut self, settings: SamplerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Checked once per iteration.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Current settings.
    pub fn settings(&self) -> &SamplerSettings {
        &self.settings
    }

    /// Objective being sampled.
    pub fn objective(&self) -> &O {
        &self.objective
    }

    /// `-cost / 2` inside the box; `-inf` outside it or when the model fails.
    fn log_posterior(&self, x: &[f64]) -> f64 {
        match self.params.log_prior(x) {
            Ok(prior) if prior.is_finite() => match self.objective.cost(x) {
                Ok(cost) if cost.is_finite() => prior - 0.5 * cost,
                Ok(_) => f64::NEG_INFINITY,
                Err(e) => {
                    log::debug!("Proposal {:?} could not be evaluated: {}", x, e);
                    f64::NEG_INFINITY
                }
            },
            _ => f64::NEG_INFINITY,
        }
    }

    /// Run every chain from `start` without progress reporting.
    ///
    /// # Errors
    /// [`Error::InvalidParameter`] when `start` lies outside the box or the
    /// settings leave no chains or no post-burn-in iterations, and any model
    /// error at `start`.
    pub fn run(&self, start: &[f64]) -> Result<SamplingResult> {
        self.run_with_progress(start, |_| {})
    }

    /// Run every chain from `start`, calling `progress` after each iteration.
    pub fn run_with_progress<F>(&self, start: &[f64], mut progress: F) -> Result<SamplingResult>
    where
        F: FnMut(&ProgressInfo),
    {
        let settings = &self.settings;
        if settings.n_chains == 0 {
            return Err(Error::InvalidParameter("at least one chain is needed".to_string()));
        }
        if settings.burn_in >= settings.n_iterations {
            return Err(Error::InvalidParameter(format!(
                "burn-in of {} leaves no samples from {} iterations",
                settings.burn_in, settings.n_iterations
            )));
        }
        self.params.validate(start)?;
        if !self.params.contains(start) {
            return Err(Error::InvalidParameter(format!(
                "start {:?} lies outside the parameter bounds",
                start
            )));
        }
        let start_cost = self.objective.cost(start)?;
        if !start_cost.is_finite() {
            return Err(Error::SamplingError(format!(
                "cost at the start point is {}",
                start_cost
            )));
        }

        let n_chains = settings.n_chains;
        let n_params = start.len();
        let mut positions =
            Array2::from_shape_fn((n_chains, n_params), |(_, j)| start[j]);
        let mut log_probs = Array1::from_elem(n_chains, -0.5 * start_cost);
        let mut rngs: Vec<ChaCha8Rng> = (0..n_chains)
            .map(|c| {
                let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
                rng.set_stream(c as u64);
                rng
            })
            .collect();
        let mut chain = Chain::new(self.params.param_names(), n_chains);

        for iteration in 0..settings.n_iterations {
            if let Some(cancel) = &self.cancel {
                cancel.check("Metropolis sampling")?;
            }

            let proposals: Vec<Option<Vec<f64>>> = rngs
                .iter_mut()
                .enumerate()
                .map(|(c, rng)| {
                    let step = self.proposal.draw(rng);
                    let candidate: Vec<f64> = positions
                        .row(c)
                        .iter()
                        .zip(step.iter())
                        .map(|(x, d)| x + d)
                        .collect();
                    let candidate = match settings.bounds_policy {
                        BoundsPolicy::Reject => candidate,
                        BoundsPolicy::Reflect => self.params.reflect(&candidate),
                    };
                    Some(candidate).filter(|x| self.params.contains(x))
                })
                .collect();

            let proposal_log_probs: Vec<f64> = proposals
                .par_iter()
                .map(|p| p.as_ref().map_or(f64::NEG_INFINITY, |x| self.log_posterior(x)))
                .collect();

            let mut accepted = vec![false; n_chains];
            for c in 0..n_chains {
                let u: f64 = rngs[c].gen();
                if let Some(candidate) = &proposals[c] {
                    if u.ln() < proposal_log_probs[c] - log_probs[c] {
                        positions
                            .row_mut(c)
                            .assign(&Array1::from_vec(candidate.clone()));
                        log_probs[c] = proposal_log_probs[c];
                        accepted[c] = true;
                    }
                }
            }
            chain.push(positions.clone(), log_probs.clone(), &accepted);

            progress(&ProgressInfo {
                iteration,
                total: settings.n_iterations,
                acceptance_rate: chain.mean_acceptance_rate(),
                mean_log_prob: log_probs.mean().unwrap_or(f64::NEG_INFINITY),
            });
        }

        let summary = PosteriorSummary::from_chain(&chain, settings.burn_in)?;
        log::info!(
            "Sampled {} chains for {} iterations, acceptance rate {:.3}",
            n_chains,
            settings.n_iterations,
            summary.acceptance_rate
        );
        if let Some((name, r)) = summary
            .r_hat
            .iter()
            .find(|(_, r)| !r.is_finite() || **r > 1.1)
        {
            log::warn!("Chains have not mixed for {} (R-hat {:.3})", name, r);
        }

        Ok(SamplingResult {
            chain,
            burn_in: settings.burn_in,
            summary,
        })
    }
}
