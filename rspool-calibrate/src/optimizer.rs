//! Bounded nonlinear least squares (Levenberg–Marquardt).
//!
//! Each iteration linearises the residuals with a finite-difference Jacobian
//! `J` and solves
//!
//! $$ (J^T J + \mu D) \delta = -J^T r $$
//!
//! where `D` is the diagonal of `JᵀJ` (Marquardt scaling). Trial points are
//! projected onto the parameter box before they are evaluated, and the
//! Jacobian perturbs towards whichever bound has room, so the objective is
//! never evaluated outside the box.

use crate::objective::Objective;
use crate::parameter_set::ParameterSet;
use crate::{Error, Result};
use indexmap::IndexMap;
use nalgebra::{DMatrix, DVector};
use ndarray::Array2;
use rayon::prelude::*;
use rspool_core::cancel::CancellationToken;
use rspool_core::errors::PoolError;
use serde::{Deserialize, Serialize};

/// Why the fit stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStatus {
    /// Relative cost reduction fell below `ftol`.
    CostConverged,
    /// Relative step fell below `xtol`.
    StepConverged,
    /// No downhill step exists at any damping up to `max_damping`; the point
    /// is a local minimum to numerical precision.
    Stalled,
    MaxIterations,
    /// The model failed on both sides of a parameter while linearising, so
    /// no further step could be computed from the current point.
    EvaluationFailed,
}

impl FitStatus {
    /// Whether the fit stopped at a minimum rather than being cut short.
    pub fn is_converged(&self) -> bool {
        !matches!(self, FitStatus::MaxIterations | FitStatus::EvaluationFailed)
    }
}

/// Result of a least-squares fit. Always holds the best point found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub params: Vec<f64>,
    pub param_names: Vec<String>,
    pub cost: f64,
    pub residuals: Vec<f64>,
    /// `s²(JᵀJ)⁻¹` with `s² = cost / (n_observations - n_params)`. `None`
    /// when there are no degrees of freedom or `JᵀJ` is singular.
    pub covariance: Option<Array2<f64>>,
    pub status: FitStatus,
    pub iterations: usize,
    pub n_evaluations: usize,
}

impl FitResult {
    pub fn is_converged(&self) -> bool {
        self.status.is_converged()
    }

    /// Turn a fit that ran out of iterations into [`Error::FitDidNotConverge`].
    pub fn ensure_converged(self) -> Result<Self> {
        if self.is_converged() {
            Ok(self)
        } else {
            Err(Error::FitDidNotConverge {
                iterations: self.iterations,
                cost: self.cost,
            })
        }
    }

    pub fn to_map(&self) -> IndexMap<String, f64> {
        self.param_names
            .iter()
            .cloned()
            .zip(self.params.iter().cloned())
            .collect()
    }

    /// Square roots of the covariance diagonal.
    pub fn std_errors(&self) -> Option<Vec<f64>> {
        self.covariance
            .as_ref()
            .map(|c| c.diag().iter().map(|v| v.max(0.0).sqrt()).collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevenbergMarquardt {
    pub max_iterations: usize,
    pub ftol: f64,
    pub xtol: f64,
    /// Relative finite-difference step (absolute when the parameter is zero).
    pub fd_step: f64,
    pub initial_damping: f64,
    pub max_damping: f64,
    #[serde(skip)]
    cancel: Option<CancellationToken>,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            ftol: 1e-10,
            xtol: 1e-10,
            fd_step: 1e-4,
            initial_damping: 1e-3,
            max_damping: 1e16,
            cancel: None,
        }
    }
}

impl LevenbergMarquardt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_tolerances(mut self, ftol: f64, xtol: f64) -> Self {
        self.ftol = ftol;
        self.xtol = xtol;
        self
    }

    /// Checked once per iteration.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Minimise the cost of `objective` within the bounds of `params`,
    /// starting from `initial` (clamped onto the box).
    ///
    /// Running out of iterations is reported through [`FitResult::status`]
    /// rather than as an error, so the best point found is never lost.
    pub fn fit<O: Objective>(
        &self,
        objective: &O,
        params: &ParameterSet,
        initial: &[f64],
    ) -> Result<FitResult> {
        params.validate(initial)?;
        if objective.param_names().len() != params.len() {
            return Err(Error::InvalidParameter(format!(
                "objective takes {} parameters but {} are bounded",
                objective.param_names().len(),
                params.len()
            )));
        }

        let mut x = params.project(initial);
        if x.as_slice() != initial {
            log::warn!("Initial parameters {:?} clamped to {:?}", initial, x);
        }
        let mut residuals = objective.residuals(&x)?;
        if residuals.is_empty() {
            return Err(Error::InvalidParameter(
                "objective has no residuals".to_string(),
            ));
        }
        let mut cost = sum_of_squares(&residuals);
        let mut n_evaluations = 1;
        let mut damping = self.initial_damping;
        let mut status = FitStatus::MaxIterations;
        let mut iterations = 0;

        while iterations < self.max_iterations {
            if let Some(cancel) = &self.cancel {
                cancel.check("least-squares fit")?;
            }
            iterations += 1;

            if cost == 0.0 {
                status = FitStatus::CostConverged;
                break;
            }

            let jacobian = match self.jacobian(objective, params, &x, &residuals) {
                Ok(jacobian) => jacobian,
                Err(e) if is_cancellation(&e) => return Err(e),
                Err(e) => {
                    log::warn!("Cannot linearise the model at {:?}: {}", x, e);
                    status = FitStatus::EvaluationFailed;
                    break;
                }
            };
            n_evaluations += x.len();
            let r = DVector::from_column_slice(&residuals);
            let jtj = jacobian.transpose() * &jacobian;
            let gradient = jacobian.transpose() * &r;
            let scale = DVector::from_iterator(
                x.len(),
                jtj.diagonal().iter().map(|d| if *d > 0.0 { *d } else { 1.0 }),
            );

            let mut accepted = false;
            while !accepted {
                let mut lhs = jtj.clone();
                for i in 0..x.len() {
                    lhs[(i, i)] += damping * scale[i];
                }
                let step = match solve_normal_equations(lhs, -&gradient) {
                    Some(step) => step,
                    None => {
                        damping *= 10.0;
                        if damping > self.max_damping {
                            break;
                        }
                        continue;
                    }
                };

                let trial: Vec<f64> = params.project(
                    &x.iter()
                        .zip(step.iter())
                        .map(|(xi, di)| xi + di)
                        .collect::<Vec<_>>(),
                );
                let step_norm = norm(trial.iter().zip(x.iter()).map(|(a, b)| a - b));
                let x_norm = norm(x.iter().cloned());
                if step_norm <= self.xtol * (x_norm + self.xtol) {
                    status = FitStatus::StepConverged;
                    break;
                }

                n_evaluations += 1;
                let (trial_residuals, trial_cost) = match objective.residuals(&trial) {
                    Ok(r) => {
                        let c = sum_of_squares(&r);
                        (r, c)
                    }
                    Err(e) => {
                        log::debug!("Trial point {:?} failed: {}", trial, e);
                        (vec![], f64::INFINITY)
                    }
                };

                if trial_cost.is_finite() && trial_cost < cost {
                    let reduction = (cost - trial_cost) / cost;
                    log::debug!(
                        "LM iteration {}: cost {:.6e} -> {:.6e} (damping {:.1e})",
                        iterations,
                        cost,
                        trial_cost,
                        damping
                    );
                    x = trial;
                    residuals = trial_residuals;
                    cost = trial_cost;
                    damping = (damping / 10.0).max(1e-15);
                    accepted = true;

                    if reduction < self.ftol {
                        status = FitStatus::CostConverged;
                    } else if step_norm <= self.xtol * (x_norm + self.xtol) {
                        status = FitStatus::StepConverged;
                    }
                } else {
                    damping *= 10.0;
                    if damping > self.max_damping {
                        break;
                    }
                }
            }

            if status != FitStatus::MaxIterations {
                break;
            }
            if !accepted {
                status = FitStatus::Stalled;
                break;
            }
        }

        let covariance = if status == FitStatus::EvaluationFailed {
            None
        } else {
            n_evaluations += x.len();
            match self.covariance(objective, params, &x, &residuals, cost) {
                Ok(covariance) => covariance,
                Err(e) if is_cancellation(&e) => return Err(e),
                Err(e) => {
                    log::warn!("No covariance estimate at {:?}: {}", x, e);
                    None
                }
            }
        };

        match status {
            FitStatus::MaxIterations | FitStatus::EvaluationFailed => log::warn!(
                "Least-squares fit stopped after {} iterations without converging ({:?}, cost {:.6e})",
                iterations,
                status,
                cost
            ),
            _ => log::info!(
                "Least-squares fit finished after {} iterations ({:?}), cost {:.6e}",
                iterations,
                status,
                cost
            ),
        }

        Ok(FitResult {
            params: x,
            param_names: objective.param_names().to_vec(),
            cost,
            residuals,
            covariance,
            status,
            iterations,
            n_evaluations,
        })
    }

    /// Finite-difference Jacobian, one column per parameter, evaluated in parallel.
    ///
    /// Steps forward unless that would leave the box, then backward; when
    /// neither full step fits, steps towards the bound with more room. A
    /// column whose model run fails is retried on the other side of `x`.
    fn jacobian<O: Objective>(
        &self,
        objective: &O,
        params: &ParameterSet,
        x: &[f64],
        residuals: &[f64],
    ) -> Result<DMatrix<f64>> {
        let lower = params.lower();
        let upper = params.upper();
        let columns: Vec<Vec<f64>> = (0..x.len())
            .into_par_iter()
            .map(|j| {
                let nominal = if x[j] != 0.0 {
                    self.fd_step * x[j].abs()
                } else {
                    self.fd_step
                };
                let room_up = upper[j] - x[j];
                let room_down = x[j] - lower[j];
                let h = if room_up >= nominal {
                    nominal
                } else if room_down >= nominal {
                    -nominal
                } else if room_up >= room_down {
                    room_up
                } else {
                    -room_down
                };

                let mut perturbed = x.to_vec();
                perturbed[j] += h;
                let (h, shifted) = match objective.residuals(&perturbed) {
                    Ok(shifted) => (h, shifted),
                    Err(e) if is_cancellation(&e) => return Err(e),
                    Err(e) => {
                        let room = if h > 0.0 { room_down } else { room_up };
                        if room <= 0.0 {
                            return Err(e);
                        }
                        let flipped = -h.signum() * nominal.min(room);
                        log::debug!(
                            "Model failed at {:?} ({}); differencing {} the other way",
                            perturbed,
                            e,
                            objective.param_names()[j]
                        );
                        perturbed[j] = x[j] + flipped;
                        (flipped, objective.residuals(&perturbed)?)
                    }
                };
                if shifted.len() != residuals.len() {
                    return Err(Error::SamplingError(format!(
                        "residual count changed from {} to {}",
                        residuals.len(),
                        shifted.len()
                    )));
                }
                Ok(shifted
                    .iter()
                    .zip(residuals.iter())
                    .map(|(s, r)| (s - r) / h)
                    .collect())
            })
            .collect::<Result<_>>()?;

        Ok(DMatrix::from_fn(residuals.len(), x.len(), |i, j| {
            columns[j][i]
        }))
    }

    fn covariance<O: Objective>(
        &self,
        objective: &O,
        params: &ParameterSet,
        x: &[f64],
        residuals: &[f64],
        cost: f64,
    ) -> Result<Option<Array2<f64>>> {
        let (m, p) = (residuals.len(), x.len());
        if m <= p {
            return Ok(None);
        }
        let jacobian = self.jacobian(objective, params, x, residuals)?;
        let jtj = jacobian.transpose() * &jacobian;
        let s2 = cost / (m - p) as f64;
        Ok(jtj
            .try_inverse()
            .map(|inv| Array2::from_shape_fn((p, p), |(i, j)| s2 * inv[(i, j)])))
    }
}

fn solve_normal_equations(lhs: DMatrix<f64>, rhs: DVector<f64>) -> Option<DVector<f64>> {
    match lhs.clone().cholesky() {
        Some(chol) => Some(chol.solve(&rhs)),
        None => lhs.lu().solve(&rhs),
    }
}

fn is_cancellation(error: &Error) -> bool {
    matches!(error, Error::Model(PoolError::Cancelled(_)))
}

fn sum_of_squares(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum()
}

fn norm(values: impl Iterator<Item = f64>) -> f64 {
    values.map(|v| v * v).sum::<f64>().sqrt()
}
