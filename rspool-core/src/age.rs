//! Age and transit-time distributions of a linear pool system.
//!
//! For a system `dx/dt = Ax + u` at steady state `x* = -A⁻¹u`, mass that
//! entered `a` years ago and is still in the system is distributed over
//! the pools as `e^{aA} u`. This gives
//!
//! * the system age density `1ᵀ e^{aA} u / 1ᵀ x*`,
//! * the age density of pool `i`, `(e^{aA} u)_i / x*_i`,
//! * the transit-time density `zᵀ e^{aA} u / 1ᵀ u`, where `zᵀ = -1ᵀA` are
//!   the release rates.
//!
//! Time-varying systems are linearised at a reference time first.

use crate::cancel::CancellationToken;
use crate::constants::MIN_COVERED_PROBABILITY;
use crate::diagnostics::{self, Degeneracy};
use crate::errors::{PoolError, PoolResult};
use crate::model::PoolModel;
use crate::timeseries::{FloatValue, Time};
use crate::utils::linear_algebra;
use crate::utils::quadrature::{crossing, cumulative_trapezoid, trapezoid, uniform_step};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// A finite, strictly increasing sequence of non-negative ages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<FloatValue>", into = "Vec<FloatValue>")]
pub struct AgeAxis(Vec<FloatValue>);

impl AgeAxis {
    pub fn new(ages: Vec<FloatValue>) -> PoolResult<Self> {
        if ages.is_empty() {
            return Err(PoolError::InvalidConfiguration(
                "age axis must contain at least one age".to_string(),
            ));
        }
        if ages.iter().any(|a| !a.is_finite() || *a < 0.0) {
            return Err(PoolError::InvalidConfiguration(
                "ages must be finite and non-negative".to_string(),
            ));
        }
        if ages.windows(2).any(|w| w[1] <= w[0]) {
            return Err(PoolError::InvalidConfiguration(
                "ages must be strictly increasing".to_string(),
            ));
        }
        Ok(Self(ages))
    }

    /// `n` evenly spaced ages from `start` to `end` inclusive.
    pub fn linspace(start: FloatValue, end: FloatValue, n: usize) -> PoolResult<Self> {
        if n < 2 {
            return Err(PoolError::InvalidConfiguration(
                "an evenly spaced age axis needs at least two points".to_string(),
            ));
        }
        let step = (end - start) / (n - 1) as FloatValue;
        Self::new((0..n).map(|i| start + step * i as FloatValue).collect())
    }

    pub fn values(&self) -> &[FloatValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<FloatValue>> for AgeAxis {
    type Error = PoolError;

    fn try_from(ages: Vec<FloatValue>) -> PoolResult<Self> {
        AgeAxis::new(ages)
    }
}

impl From<AgeAxis> for Vec<FloatValue> {
    fn from(axis: AgeAxis) -> Self {
        axis.0
    }
}

/// A constant system `(A, u)` together with its steady state.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearizedSystem {
    matrix: DMatrix<FloatValue>,
    input: DVector<FloatValue>,
    steady_state: DVector<FloatValue>,
}

impl LinearizedSystem {
    /// # Errors
    /// * [`PoolError::InvalidConfiguration`] if the shapes disagree or the
    ///   total input is not positive (no mass ever enters).
    /// * [`PoolError::SingularSystemMatrix`] if `A` is not invertible.
    pub fn new(matrix: DMatrix<FloatValue>, input: DVector<FloatValue>) -> PoolResult<Self> {
        if !matrix.is_square() || matrix.nrows() != input.len() {
            return Err(PoolError::InvalidConfiguration(format!(
                "matrix of shape {:?} does not match an input of length {}",
                matrix.shape(),
                input.len()
            )));
        }
        if !(input.sum() > 0.0) {
            return Err(PoolError::InvalidConfiguration(
                "age distributions need a positive total input".to_string(),
            ));
        }
        let steady_state = linear_algebra::steady_state(&matrix, &input)?;
        Ok(Self {
            matrix,
            input,
            steady_state,
        })
    }

    /// Linearise `model` at time `t`.
    pub fn from_model(model: &PoolModel, t: Time) -> PoolResult<Self> {
        Self::new(model.matrix_at(t)?, model.input_at(t)?)
    }

    pub fn matrix(&self) -> &DMatrix<FloatValue> {
        &self.matrix
    }

    pub fn input(&self) -> &DVector<FloatValue> {
        &self.input
    }

    pub fn steady_state(&self) -> &DVector<FloatValue> {
        &self.steady_state
    }

    pub fn n_pools(&self) -> usize {
        self.input.len()
    }

    pub fn total_stock(&self) -> FloatValue {
        self.steady_state.sum()
    }

    pub fn release_rates(&self) -> DVector<FloatValue> {
        linear_algebra::release_rates(&self.matrix)
    }

    /// `-A⁻¹ x*`: per-pool mass weighted by age.
    fn age_weighted_stock(&self) -> PoolResult<DVector<FloatValue>> {
        linear_algebra::solve(&(-&self.matrix), &self.steady_state, "mean age")
    }

    /// Exact mean system age, `1ᵀA⁻²u / 1ᵀx*`.
    pub fn mean_system_age(&self) -> PoolResult<FloatValue> {
        Ok(self.age_weighted_stock()?.sum() / self.total_stock())
    }

    /// Exact mean age of each pool. `None` for pools with no steady-state mass.
    pub fn mean_pool_ages(&self) -> PoolResult<Vec<Option<FloatValue>>> {
        let weighted = self.age_weighted_stock()?;
        Ok(self
            .steady_state
            .iter()
            .zip(weighted.iter())
            .map(|(x, w)| (*x > 0.0).then(|| w / x))
            .collect())
    }

    /// Exact mean transit time, `1ᵀx* / 1ᵀu`.
    pub fn mean_transit_time(&self) -> FloatValue {
        self.total_stock() / self.input.sum()
    }
}

/// Densities evaluated on an age axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgeDistributions {
    pub ages: Vec<FloatValue>,
    pub system: Array1<FloatValue>,
    /// `[age, pool]`
    pub pools: Array2<FloatValue>,
    pub transit: Array1<FloatValue>,
    pub warnings: Vec<Degeneracy>,
}

impl AgeDistributions {
    pub fn system_summary(&self, probabilities: &[FloatValue]) -> PoolResult<DistributionSummary> {
        summarize(&self.ages, &self.system.to_vec(), probabilities)
    }

    pub fn transit_summary(&self, probabilities: &[FloatValue]) -> PoolResult<DistributionSummary> {
        summarize(&self.ages, &self.transit.to_vec(), probabilities)
    }

    pub fn pool_summary(
        &self,
        pool: usize,
        probabilities: &[FloatValue],
    ) -> PoolResult<DistributionSummary> {
        if pool >= self.pools.ncols() {
            return Err(PoolError::InvalidConfiguration(format!(
                "pool {} does not exist",
                pool
            )));
        }
        let density = self.pools.column(pool).to_vec();
        summarize(&self.ages, &density, probabilities)
    }
}

/// Evaluate the system, pool and transit-time densities on `axis`.
///
/// Evenly spaced axes are walked with a single step exponential; other axes
/// evaluate `e^{aA}` at every age.
pub fn age_distributions(
    system: &LinearizedSystem,
    axis: &AgeAxis,
    cancel: Option<&CancellationToken>,
) -> PoolResult<AgeDistributions> {
    let ages = axis.values();
    let n = system.n_pools();
    let stock = system.steady_state();
    let total_stock = system.total_stock();
    let total_input = system.input.sum();
    let release = system.release_rates();

    let mut warnings = vec![];
    let empty: Vec<bool> = stock.iter().map(|x| *x <= 0.0).collect();
    for (pool, _) in empty.iter().enumerate().filter(|(_, e)| **e) {
        diagnostics::flag(&mut warnings, Degeneracy::EmptyPool { pool });
    }

    let mut system_density = Array1::zeros(ages.len());
    let mut pools = Array2::zeros((ages.len(), n));
    let mut transit = Array1::zeros(ages.len());

    let step_exp = uniform_step(ages).map(|h| (&system.matrix * h).exp());
    let mut surviving = (&system.matrix * ages[0]).exp() * &system.input;

    for (k, age) in ages.iter().enumerate() {
        if let Some(cancel) = cancel {
            cancel.check("age distribution")?;
        }
        if k > 0 {
            surviving = match &step_exp {
                Some(step) => step * &surviving,
                None => (&system.matrix * *age).exp() * &system.input,
            };
        }

        system_density[k] = surviving.sum() / total_stock;
        transit[k] = release.dot(&surviving) / total_input;
        for i in 0..n {
            if !empty[i] {
                pools[[k, i]] = surviving[i] / stock[i];
            }
        }
    }

    check_non_negative(ages, system_density.iter(), &mut warnings);
    check_non_negative(ages, transit.iter(), &mut warnings);
    for column in pools.columns() {
        check_non_negative(ages, column.iter(), &mut warnings);
    }

    log::debug!(
        "Evaluated age distributions of {} pools on {} ages",
        n,
        ages.len()
    );

    Ok(AgeDistributions {
        ages: ages.to_vec(),
        system: system_density,
        pools,
        transit,
        warnings,
    })
}

/// Flag the most negative density value, if any.
fn check_non_negative<'a>(
    ages: &[FloatValue],
    density: impl Iterator<Item = &'a FloatValue>,
    warnings: &mut Vec<Degeneracy>,
) {
    let worst = density
        .zip(ages.iter())
        .filter(|(v, _)| **v < 0.0)
        .min_by(|a, b| a.0.total_cmp(b.0));
    if let Some((value, age)) = worst {
        diagnostics::flag(
            warnings,
            Degeneracy::NegativeDensity {
                age: *age,
                value: *value,
            },
        );
    }
}

/// Summary statistics of a density sampled on an age axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionSummary {
    /// Mean of the distribution truncated to the axis.
    pub mean: Option<FloatValue>,
    /// `(probability, age)`; the age is `None` if the axis never reaches it.
    pub quantiles: Vec<(FloatValue, Option<FloatValue>)>,
    /// Probability mass covered by the axis.
    pub covered: FloatValue,
    pub warnings: Vec<Degeneracy>,
}

impl DistributionSummary {
    pub fn quantile(&self, probability: FloatValue) -> Option<FloatValue> {
        self.quantiles
            .iter()
            .find(|(p, _)| *p == probability)
            .and_then(|(_, age)| *age)
    }

    pub fn median(&self) -> Option<FloatValue> {
        self.quantile(0.5)
    }
}

/// Mean, quantiles and coverage of a normalised density.
///
/// Quantiles use absolute probabilities and are interpolated linearly
/// between the two axis samples bracketing the target cumulative value.
pub fn summarize(
    ages: &[FloatValue],
    density: &[FloatValue],
    probabilities: &[FloatValue],
) -> PoolResult<DistributionSummary> {
    if ages.len() != density.len() || ages.is_empty() {
        return Err(PoolError::InvalidConfiguration(format!(
            "density of length {} does not match an age axis of length {}",
            density.len(),
            ages.len()
        )));
    }
    if let Some(p) = probabilities.iter().find(|p| !(0.0..=1.0).contains(*p)) {
        return Err(PoolError::InvalidConfiguration(format!(
            "quantile probability {} is outside [0, 1]",
            p
        )));
    }

    let cumulative = cumulative_trapezoid(ages, density);
    let covered = cumulative[cumulative.len() - 1];
    let weighted: Vec<FloatValue> = ages.iter().zip(density).map(|(a, f)| a * f).collect();
    let mean = (covered > 0.0).then(|| trapezoid(ages, &weighted) / covered);

    let quantiles = probabilities
        .iter()
        .map(|p| (*p, crossing(ages, &cumulative, *p)))
        .collect();

    let mut warnings = vec![];
    if covered < MIN_COVERED_PROBABILITY {
        diagnostics::flag(&mut warnings, Degeneracy::TruncatedAgeAxis { covered });
    }

    Ok(DistributionSummary {
        mean,
        quantiles,
        covered,
        warnings,
    })
}
