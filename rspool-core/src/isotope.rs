//! Isotope-labelled mass tracked alongside total mass.
//!
//! The augmented state is `[m; m*]` where `m*` is the isotope-labelled mass
//! of each pool. Labelled mass moves exactly like total mass and in
//! addition decays at the physical rate `λ = ln 2 / half-life`:
//!
//! $$ \frac{d}{dt}\begin{bmatrix} m \\ m^* \end{bmatrix} =
//!    \begin{bmatrix} A & 0 \\ 0 & A - \lambda I \end{bmatrix}
//!    \begin{bmatrix} m \\ m^* \end{bmatrix} +
//!    \begin{bmatrix} u \\ u \, r_s \end{bmatrix} $$
//!
//! where `r_s` is the isotope ratio of the source at entry time.

use crate::cancel::CancellationToken;
use crate::constants::{decay_constant, RADIOCARBON_HALF_LIFE};
use crate::derived::ratio_from_delta;
use crate::diagnostics::Degeneracy;
use crate::errors::{PoolError, PoolResult};
use crate::ivp::{integrate, LinearSystem, SolverOptions, SolverStats};
use crate::model::PoolModel;
use crate::source_curve::SourceCurve;
use crate::timeseries::{FloatValue, Time};
use crate::utils::linear_algebra;
use nalgebra::{DMatrix, DVector};
use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};

/// Decay and reference standard of the tracked isotope.
///
/// Serialised as `half_life` (omitted for the radiocarbon default) or
/// `stable = true`, since TOML cannot express a missing half-life:
///
/// ```toml
/// stable = true
/// ratio_standard = 0.0112372
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "IsotopeSettingsRecord", into = "IsotopeSettingsRecord")]
pub struct IsotopeSettings {
    /// unit: yr. `None` for a stable isotope.
    pub half_life: Option<FloatValue>,
    /// Isotope ratio of the reference standard (0‰).
    pub ratio_standard: FloatValue,
}

/// Serialised form of [`IsotopeSettings`].
#[derive(Serialize, Deserialize)]
struct IsotopeSettingsRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    half_life: Option<FloatValue>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    stable: bool,
    #[serde(default = "default_ratio_standard")]
    ratio_standard: FloatValue,
}

fn default_ratio_standard() -> FloatValue {
    1.0
}

impl TryFrom<IsotopeSettingsRecord> for IsotopeSettings {
    type Error = PoolError;

    fn try_from(record: IsotopeSettingsRecord) -> PoolResult<Self> {
        let half_life = match (record.stable, record.half_life) {
            (true, Some(h)) => {
                return Err(PoolError::InvalidConfiguration(format!(
                    "a stable isotope cannot have a half-life (got {})",
                    h
                )))
            }
            (true, None) => None,
            (false, h) => Some(h.unwrap_or(RADIOCARBON_HALF_LIFE)),
        };
        Ok(Self {
            half_life,
            ratio_standard: record.ratio_standard,
        })
    }
}

impl From<IsotopeSettings> for IsotopeSettingsRecord {
    fn from(settings: IsotopeSettings) -> Self {
        Self {
            half_life: settings.half_life,
            stable: settings.half_life.is_none(),
            ratio_standard: settings.ratio_standard,
        }
    }
}

impl Default for IsotopeSettings {
    fn default() -> Self {
        Self {
            half_life: Some(RADIOCARBON_HALF_LIFE),
            ratio_standard: default_ratio_standard(),
        }
    }
}

impl IsotopeSettings {
    /// Settings for a non-decaying tracer with the default standard.
    pub fn stable() -> Self {
        Self {
            half_life: None,
            ..Default::default()
        }
    }

    /// Physical decay constant `λ` (1/yr); zero for a stable isotope.
    pub fn decay_constant(&self) -> FloatValue {
        self.half_life.map_or(0.0, decay_constant)
    }

    pub fn validate(&self) -> PoolResult<()> {
        if !(self.ratio_standard > 0.0 && self.ratio_standard.is_finite()) {
            return Err(PoolError::InvalidConfiguration(format!(
                "ratio standard must be positive, got {}",
                self.ratio_standard
            )));
        }
        if let Some(h) = self.half_life {
            if !(h > 0.0) {
                return Err(PoolError::InvalidConfiguration(format!(
                    "half-life must be positive, got {}",
                    h
                )));
            }
        }
        Ok(())
    }
}

/// A pool model coupled with a source curve. Dimension is twice the pool count.
#[derive(Debug, Clone)]
pub struct IsotopeModel<'a> {
    model: &'a PoolModel,
    source: &'a SourceCurve,
    settings: IsotopeSettings,
    lambda: FloatValue,
}

impl<'a> IsotopeModel<'a> {
    pub fn new(
        model: &'a PoolModel,
        source: &'a SourceCurve,
        settings: IsotopeSettings,
    ) -> PoolResult<Self> {
        settings.validate()?;
        let lambda = settings.decay_constant();
        Ok(Self {
            model,
            source,
            settings,
            lambda,
        })
    }

    pub fn model(&self) -> &PoolModel {
        self.model
    }

    pub fn settings(&self) -> &IsotopeSettings {
        &self.settings
    }

    /// Isotope ratio of material entering the pools at `t`.
    ///
    /// Material is produced at `t - lag` and carries that signature; it does
    /// not decay while in transit.
    pub fn source_ratio_at(&self, t: Time) -> PoolResult<FloatValue> {
        let delta = self.source.value_at(t - self.model.lag())?;
        Ok(ratio_from_delta(delta, self.settings.ratio_standard))
    }

    /// `[m₀; m₀ r₀]` from the model's initial mass and signature.
    pub fn initial_state(&self) -> DVector<FloatValue> {
        let n = self.model.n_pools();
        let mass = self.model.initial_mass();
        let signature = self.model.initial_signature();
        DVector::from_fn(2 * n, |i, _| {
            if i < n {
                mass[i]
            } else {
                mass[i - n] * ratio_from_delta(signature[i - n], self.settings.ratio_standard)
            }
        })
    }
}

impl LinearSystem for IsotopeModel<'_> {
    fn dimension(&self) -> usize {
        2 * self.model.n_pools()
    }

    fn matrix_at(&self, t: Time) -> PoolResult<DMatrix<FloatValue>> {
        let n = self.model.n_pools();
        let a = self.model.matrix_at(t)?;
        let mut full = DMatrix::zeros(2 * n, 2 * n);
        full.view_mut((0, 0), (n, n)).copy_from(&a);
        full.view_mut((n, n), (n, n))
            .copy_from(&linear_algebra::shift_diagonal(&a, self.lambda));
        Ok(full)
    }

    fn input_at(&self, t: Time) -> PoolResult<DVector<FloatValue>> {
        let n = self.model.n_pools();
        let u = self.model.input_at(t)?;
        let ratio = self.source_ratio_at(t)?;
        Ok(DVector::from_fn(2 * n, |i, _| {
            if i < n {
                u[i]
            } else {
                u[i - n] * ratio
            }
        }))
    }
}

/// Pool masses and isotope-labelled masses on the output grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsotopeTrajectory {
    pub times: Vec<Time>,
    /// `[time, pool]`
    pub mass: Array2<FloatValue>,
    /// `[time, pool]`
    pub isotope_mass: Array2<FloatValue>,
    pub ratio_standard: FloatValue,
    pub stats: SolverStats,
    pub warnings: Vec<Degeneracy>,
}

impl IsotopeTrajectory {
    pub fn n_pools(&self) -> usize {
        self.mass.ncols()
    }
}

/// Integrate mass and isotope mass together over `times`.
pub fn simulate_isotopes(
    model: &PoolModel,
    source: &SourceCurve,
    settings: &IsotopeSettings,
    times: &[Time],
    options: &SolverOptions,
    cancel: Option<&CancellationToken>,
) -> PoolResult<IsotopeTrajectory> {
    let system = IsotopeModel::new(model, source, settings.clone())?;
    let trajectory = integrate(&system, &system.initial_state(), times, options, cancel)?;

    let n = model.n_pools();
    log::debug!(
        "Simulated {} pools with isotope decay constant {:e}",
        n,
        system.lambda
    );

    Ok(IsotopeTrajectory {
        times: trajectory.times,
        mass: trajectory.states.slice(s![.., ..n]).to_owned(),
        isotope_mass: trajectory.states.slice(s![.., n..]).to_owned(),
        ratio_standard: settings.ratio_standard,
        stats: trajectory.stats,
        warnings: trajectory.warnings,
    })
}

/// Steady-state isotope-labelled mass `-(A - λI)⁻¹ u r` at time `t`.
pub fn steady_state_isotope_mass(
    model: &PoolModel,
    source: &SourceCurve,
    settings: &IsotopeSettings,
    t: Time,
) -> PoolResult<DVector<FloatValue>> {
    let system = IsotopeModel::new(model, source, settings.clone())?;
    let a = linear_algebra::shift_diagonal(&model.matrix_at(t)?, system.lambda);
    let u = model.input_at(t)? * system.source_ratio_at(t)?;
    linear_algebra::steady_state(&a, &u)
}
