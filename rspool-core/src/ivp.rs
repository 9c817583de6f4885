//! Initial value problems for linear pool systems.
//!
//! Every pool model reduces to
//!
//! $$ \frac{dy}{dt} = A(t) \, y + u(t) $$
//!
//! which is integrated from an initial state over an output time grid.
//! Decay rates across pools routinely span several orders of magnitude, so
//! the default method is an A-stable implicit trapezoidal rule with
//! step-doubling error control. The explicit Dormand–Prince method from
//! `ode_solvers` is available for non-stiff systems.

use crate::cancel::CancellationToken;
use crate::diagnostics::{self, Degeneracy};
use crate::errors::{PoolError, PoolResult};
use crate::model::PoolModel;
use crate::timeseries::{FloatValue, Time};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2};
use ode_solvers::{Dopri5, System};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};

/// A linear, possibly time-varying, system `dy/dt = A(t) y + u(t)`.
pub trait LinearSystem {
    fn dimension(&self) -> usize;
    fn matrix_at(&self, t: Time) -> PoolResult<DMatrix<FloatValue>>;
    fn input_at(&self, t: Time) -> PoolResult<DVector<FloatValue>>;

    /// Time derivative of `y` at `t`.
    fn derivative(&self, t: Time, y: &DVector<FloatValue>) -> PoolResult<DVector<FloatValue>> {
        Ok(self.matrix_at(t)? * y + self.input_at(t)?)
    }
}

impl LinearSystem for PoolModel {
    fn dimension(&self) -> usize {
        self.n_pools()
    }

    fn matrix_at(&self, t: Time) -> PoolResult<DMatrix<FloatValue>> {
        PoolModel::matrix_at(self, t)
    }

    fn input_at(&self, t: Time) -> PoolResult<DVector<FloatValue>> {
        PoolModel::input_at(self, t)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverMethod {
    /// Adaptive trapezoidal rule (A-stable, suitable for stiff systems).
    #[default]
    Implicit,
    /// Adaptive explicit Dormand–Prince 5(4).
    Dopri5,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub method: SolverMethod,
    pub rtol: FloatValue,
    pub atol: FloatValue,
    /// Budget of attempted steps over the whole grid.
    pub max_steps: usize,
    /// First trial step. Defaults to a hundredth of the first grid interval.
    pub initial_step: Option<FloatValue>,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            method: SolverMethod::default(),
            rtol: 1e-6,
            atol: 1e-9,
            max_steps: 100_000,
            initial_step: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverStats {
    pub accepted_steps: usize,
    pub rejected_steps: usize,
}

/// States on the requested output grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub times: Vec<Time>,
    /// One row per output time, one column per state component.
    pub states: Array2<FloatValue>,
    pub stats: SolverStats,
    pub warnings: Vec<Degeneracy>,
}

impl Trajectory {
    pub fn state_at(&self, index: usize) -> DVector<FloatValue> {
        DVector::from_iterator(self.states.ncols(), self.states.row(index).iter().cloned())
    }

    /// Time series of a single state component.
    pub fn component(&self, index: usize) -> Array1<FloatValue> {
        self.states.column(index).to_owned()
    }

    pub fn final_state(&self) -> DVector<FloatValue> {
        self.state_at(self.times.len() - 1)
    }
}

/// Integrate a linear system over `times`, starting from `y0` at `times[0]`.
///
/// # Errors
/// * [`PoolError::InvalidConfiguration`] for an empty or non-increasing grid
///   or an initial state of the wrong length.
/// * [`PoolError::IntegrationFailure`] when the step size underflows, the step
///   budget is exhausted or the solver detects stiffness it cannot handle.
///   No partial trajectory is returned.
/// * [`PoolError::Cancelled`] when `cancel` fires between steps.
pub fn integrate<S: LinearSystem>(
    system: &S,
    y0: &DVector<FloatValue>,
    times: &[Time],
    options: &SolverOptions,
    cancel: Option<&CancellationToken>,
) -> PoolResult<Trajectory> {
    validate_grid(times)?;
    if y0.len() != system.dimension() {
        return Err(PoolError::InvalidConfiguration(format!(
            "initial state has {} entries but the system has dimension {}",
            y0.len(),
            system.dimension()
        )));
    }
    if !(options.rtol > 0.0 && options.atol > 0.0) {
        return Err(PoolError::InvalidConfiguration(format!(
            "solver tolerances must be positive (rtol={}, atol={})",
            options.rtol, options.atol
        )));
    }

    let mut states = Array2::zeros((times.len(), y0.len()));
    states.row_mut(0).assign(&Array1::from_iter(y0.iter().cloned()));

    let stats = match options.method {
        SolverMethod::Implicit => {
            TrapezoidStepper::new(system, options, cancel).run(y0, times, &mut states)?
        }
        SolverMethod::Dopri5 => run_dopri5(system, y0, times, options, cancel, &mut states)?,
    };

    log::debug!(
        "Integrated {} states over [{}, {}] with {:?}: {} accepted, {} rejected steps",
        y0.len(),
        times[0],
        times[times.len() - 1],
        options.method,
        stats.accepted_steps,
        stats.rejected_steps
    );

    Ok(Trajectory {
        times: times.to_vec(),
        states,
        stats,
        warnings: vec![],
    })
}

/// Simulate pool masses from the model's initial mass.
///
/// Negative masses (beyond the absolute tolerance) are flagged as
/// [`Degeneracy::NegativeMass`] on the returned trajectory.
pub fn simulate(
    model: &PoolModel,
    times: &[Time],
    options: &SolverOptions,
    cancel: Option<&CancellationToken>,
) -> PoolResult<Trajectory> {
    let mut trajectory = integrate(model, model.initial_mass(), times, options, cancel)?;
    let mut warnings = vec![];
    for ((i, pool), value) in trajectory.states.indexed_iter() {
        if *value < -options.atol {
            diagnostics::flag(
                &mut warnings,
                Degeneracy::NegativeMass {
                    pool,
                    time: times[i],
                    value: *value,
                },
            );
        }
    }
    trajectory.warnings = warnings;
    Ok(trajectory)
}

pub(crate) fn validate_grid(times: &[Time]) -> PoolResult<()> {
    if times.is_empty() {
        return Err(PoolError::InvalidConfiguration(
            "time grid must contain at least one point".to_string(),
        ));
    }
    if times.iter().any(|t| !t.is_finite()) || times.windows(2).any(|w| w[1] <= w[0]) {
        return Err(PoolError::InvalidConfiguration(
            "time grid must be finite and strictly increasing".to_string(),
        ));
    }
    Ok(())
}

fn failure(time: Time, reason: impl Into<String>) -> PoolError {
    PoolError::IntegrationFailure {
        time,
        reason: reason.into(),
    }
}

/// Adaptive trapezoidal rule.
///
/// One step of size `h` solves
/// `(I - h/2 A(t+h)) y₁ = (I + h/2 A(t)) y₀ + h/2 (u(t) + u(t+h))`.
/// The local error is estimated by comparing one full step with two half
/// steps; the half-step result is kept.
struct TrapezoidStepper<'a, S> {
    system: &'a S,
    options: &'a SolverOptions,
    cancel: Option<&'a CancellationToken>,
    stats: SolverStats,
}

impl<'a, S: LinearSystem> TrapezoidStepper<'a, S> {
    const SAFETY: FloatValue = 0.9;
    const MIN_FACTOR: FloatValue = 0.2;
    const MAX_FACTOR: FloatValue = 5.0;

    fn new(
        system: &'a S,
        options: &'a SolverOptions,
        cancel: Option<&'a CancellationToken>,
    ) -> Self {
        Self {
            system,
            options,
            cancel,
            stats: SolverStats::default(),
        }
    }

    fn run(
        mut self,
        y0: &DVector<FloatValue>,
        times: &[Time],
        states: &mut Array2<FloatValue>,
    ) -> PoolResult<SolverStats> {
        let mut y = y0.clone();
        let mut h = match (self.options.initial_step, times.len()) {
            (Some(h), _) => h,
            (None, 1) => return Ok(self.stats),
            (None, _) => (times[1] - times[0]) / 100.0,
        };
        if !(h > 0.0 && h.is_finite()) {
            return Err(PoolError::InvalidConfiguration(format!(
                "initial step must be positive, got {}",
                h
            )));
        }

        for (k, window) in times.windows(2).enumerate() {
            let (t_start, t_end) = (window[0], window[1]);
            let mut t = t_start;
            while t < t_end {
                if let Some(cancel) = self.cancel {
                    cancel.check("implicit integration")?;
                }
                if self.stats.accepted_steps + self.stats.rejected_steps >= self.options.max_steps {
                    return Err(failure(
                        t,
                        format!("step budget of {} exhausted", self.options.max_steps),
                    ));
                }

                let remaining = t_end - t;
                let min_step = 1e-12 * t.abs().max(1.0);
                // Absorb a leftover too small to be stepped on its own
                let last = h >= remaining - 100.0 * min_step;
                let step = if last { remaining } else { h };
                if step < min_step {
                    return Err(failure(t, format!("step size underflow (h={:e})", step)));
                }

                let (candidate, err) = self.attempt(t, step, &y)?;
                let factor = if err == 0.0 {
                    Self::MAX_FACTOR
                } else {
                    (Self::SAFETY * err.powf(-1.0 / 3.0)).clamp(Self::MIN_FACTOR, Self::MAX_FACTOR)
                };

                if err <= 1.0 {
                    self.stats.accepted_steps += 1;
                    y = candidate;
                    t = if last { t_end } else { t + step };
                    // Grid-clamped steps should not shrink the next proposal
                    if !last || step >= h {
                        h = step * factor;
                    }
                } else {
                    self.stats.rejected_steps += 1;
                    h = step * factor;
                }
            }
            states
                .row_mut(k + 1)
                .assign(&Array1::from_iter(y.iter().cloned()));
        }
        Ok(self.stats)
    }

    /// Returns the two-half-step solution and the scaled error norm.
    fn attempt(
        &self,
        t: Time,
        h: FloatValue,
        y: &DVector<FloatValue>,
    ) -> PoolResult<(DVector<FloatValue>, FloatValue)> {
        let full = self.step(t, h, y)?;
        let mid = self.step(t, h / 2.0, y)?;
        let half = self.step(t + h / 2.0, h / 2.0, &mid)?;

        let mut err: FloatValue = 0.0;
        for i in 0..y.len() {
            let scale = self.options.atol + self.options.rtol * y[i].abs().max(half[i].abs());
            err = err.max((half[i] - full[i]).abs() / 3.0 / scale);
        }
        if !err.is_finite() {
            return Err(failure(t, "non-finite state"));
        }
        Ok((half, err))
    }

    fn step(
        &self,
        t: Time,
        h: FloatValue,
        y: &DVector<FloatValue>,
    ) -> PoolResult<DVector<FloatValue>> {
        let n = y.len();
        let a0 = self.system.matrix_at(t)?;
        let a1 = self.system.matrix_at(t + h)?;
        let u = self.system.input_at(t)? + self.system.input_at(t + h)?;

        let identity = DMatrix::<FloatValue>::identity(n, n);
        let lhs = &identity - &a1 * (h / 2.0);
        let rhs = (&identity + &a0 * (h / 2.0)) * y + u * (h / 2.0);

        lhs.lu()
            .solve(&rhs)
            .ok_or_else(|| failure(t, "implicit step matrix is singular"))
    }
}

/// Adapter exposing a [`LinearSystem`] to `ode_solvers`.
///
/// `ode_solvers` cannot propagate errors from the right-hand side, so the
/// first error is parked here and integration is stopped at the next step.
struct DopriAdapter<'a, S> {
    system: &'a S,
    error: &'a RefCell<Option<PoolError>>,
    steps: &'a Cell<usize>,
    max_steps: usize,
    cancel: Option<&'a CancellationToken>,
}

impl<'a, S: LinearSystem> System<f64, DVector<f64>> for DopriAdapter<'a, S> {
    fn system(&self, t: f64, y: &DVector<f64>, dy: &mut DVector<f64>) {
        match self.system.derivative(t, y) {
            Ok(d) => dy.copy_from(&d),
            Err(e) => {
                dy.fill(0.0);
                self.error.borrow_mut().get_or_insert(e);
            }
        }
    }

    fn solout(&mut self, t: f64, _y: &DVector<f64>, _dy: &DVector<f64>) -> bool {
        self.steps.set(self.steps.get() + 1);
        if self.error.borrow().is_some() {
            return true;
        }
        if let Some(Err(e)) = self.cancel.map(|c| c.check("explicit integration")) {
            self.error.borrow_mut().get_or_insert(e);
            return true;
        }
        if self.steps.get() > self.max_steps {
            self.error.borrow_mut().get_or_insert(failure(
                t,
                format!("step budget of {} exhausted", self.max_steps),
            ));
            return true;
        }
        false
    }
}

fn run_dopri5<S: LinearSystem>(
    system: &S,
    y0: &DVector<FloatValue>,
    times: &[Time],
    options: &SolverOptions,
    cancel: Option<&CancellationToken>,
    states: &mut Array2<FloatValue>,
) -> PoolResult<SolverStats> {
    let error = RefCell::new(None);
    let steps = Cell::new(0);
    let mut stats = SolverStats::default();
    let mut y = y0.clone();

    for (k, window) in times.windows(2).enumerate() {
        let (t_start, t_end) = (window[0], window[1]);
        let adapter = DopriAdapter {
            system,
            error: &error,
            steps: &steps,
            max_steps: options.max_steps,
            cancel,
        };
        // dx = 0 records the state after every accepted step
        let mut stepper = Dopri5::new(adapter, t_start, t_end, 0.0, y.clone(), options.rtol, options.atol);
        let result = stepper.integrate();

        if let Some(e) = error.borrow_mut().take() {
            return Err(e);
        }
        let segment = result.map_err(|e| failure(t_start, format!("{:?}", e)))?;
        stats.accepted_steps += segment.accepted_steps as usize;
        stats.rejected_steps += segment.rejected_steps as usize;

        let reached = stepper.x_out().last().cloned().unwrap_or(t_start);
        if (reached - t_end).abs() > 1e-9 * t_end.abs().max(1.0) {
            return Err(failure(reached, format!("stopped before reaching t={}", t_end)));
        }
        y = match stepper.y_out().last() {
            Some(last) => last.clone(),
            None => return Err(failure(t_start, "solver produced no output")),
        };
        states
            .row_mut(k + 1)
            .assign(&Array1::from_iter(y.iter().cloned()));
    }
    Ok(stats)
}
