//! Quantities derived from simulated trajectories.
//!
//! All functions here are pure transforms of trajectories that were already
//! integrated: release fluxes and isotopic signatures in delta notation,
//!
//! $$ \delta = \left( \frac{R_{sample}}{R_{standard}} - 1 \right) \cdot 1000 $$
//!
//! where the sample ratio is isotope-labelled mass over total mass.

use crate::constants::PER_MIL;
use crate::diagnostics::{self, is_plausible_delta, Degeneracy};
use crate::errors::{PoolError, PoolResult};
use crate::isotope::IsotopeTrajectory;
use crate::model::PoolModel;
use crate::timeseries::{FloatValue, Time};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Delta value (‰) of an isotope ratio.
pub fn delta_from_ratio(ratio: FloatValue, standard: FloatValue) -> FloatValue {
    (ratio / standard - 1.0) * PER_MIL
}

/// Isotope ratio of a delta value (‰).
pub fn ratio_from_delta(delta: FloatValue, standard: FloatValue) -> FloatValue {
    standard * (delta / PER_MIL + 1.0)
}

/// Signature (‰) of `isotope_mass` within `mass`.
///
/// # Errors
/// [`PoolError::UndefinedRatio`] when `mass` is zero. `pool` and `time`
/// identify the point in the error.
pub fn signature(
    mass: FloatValue,
    isotope_mass: FloatValue,
    standard: FloatValue,
    pool: Option<usize>,
    time: Time,
) -> PoolResult<FloatValue> {
    if mass == 0.0 || !mass.is_finite() {
        return Err(PoolError::UndefinedRatio { pool, time });
    }
    Ok(delta_from_ratio(isotope_mass / mass, standard))
}

/// Mass leaving the system from each pool, `[time, pool]`.
///
/// The release flux of pool `j` is its mass times its decay rate, minus the
/// share transferred to other pools.
pub fn release_fluxes(
    model: &PoolModel,
    times: &[Time],
    mass: &Array2<FloatValue>,
) -> PoolResult<Array2<FloatValue>> {
    if mass.nrows() != times.len() || mass.ncols() != model.n_pools() {
        return Err(PoolError::InvalidConfiguration(format!(
            "mass array of shape {:?} does not match {} times and {} pools",
            mass.shape(),
            times.len(),
            model.n_pools()
        )));
    }
    let mut fluxes = Array2::zeros(mass.raw_dim());
    for (i, t) in times.iter().enumerate() {
        let rates = model.release_rates_at(*t)?;
        for j in 0..model.n_pools() {
            fluxes[[i, j]] = rates[j] * mass[[i, j]];
        }
    }
    Ok(fluxes)
}

/// A point where a signature could not be computed because the mass was zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UndefinedPoint {
    /// `None` for the whole-system and respired aggregates.
    pub pool: Option<usize>,
    pub time: Time,
}

impl UndefinedPoint {
    pub fn to_error(self) -> PoolError {
        PoolError::UndefinedRatio {
            pool: self.pool,
            time: self.time,
        }
    }
}

/// Pool, whole-system and respired signatures over a trajectory.
///
/// Points where the signature is undefined hold `None` and are listed in
/// `undefined`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureTrajectory {
    pub times: Vec<Time>,
    /// `[time, pool]`
    pub pools: Array2<Option<FloatValue>>,
    /// Signature of the total stock (mass-weighted).
    pub system: Vec<Option<FloatValue>>,
    /// Signature of the mass leaving the system (release-flux weighted).
    pub respired: Vec<Option<FloatValue>>,
    /// Total release flux.
    pub respired_flux: Array1<FloatValue>,
    pub undefined: Vec<UndefinedPoint>,
    pub warnings: Vec<Degeneracy>,
}

impl SignatureTrajectory {
    pub fn is_fully_defined(&self) -> bool {
        self.undefined.is_empty()
    }

    /// Each undefined point as a [`PoolError::UndefinedRatio`].
    pub fn undefined_errors(&self) -> Vec<PoolError> {
        self.undefined.iter().map(|p| p.to_error()).collect()
    }
}

/// Compute every signature of an isotope trajectory.
pub fn signatures(
    model: &PoolModel,
    trajectory: &IsotopeTrajectory,
) -> PoolResult<SignatureTrajectory> {
    let times = &trajectory.times;
    let standard = trajectory.ratio_standard;
    let n = trajectory.n_pools();
    let fluxes = release_fluxes(model, times, &trajectory.mass)?;

    let mut pools = Array2::from_elem((times.len(), n), None);
    let mut system = Vec::with_capacity(times.len());
    let mut respired = Vec::with_capacity(times.len());
    let mut respired_flux = Array1::zeros(times.len());
    let mut undefined = vec![];
    let mut warnings = vec![];

    for (i, t) in times.iter().enumerate() {
        let mass = trajectory.mass.row(i);
        let iso = trajectory.isotope_mass.row(i);
        let flux = fluxes.row(i);

        for j in 0..n {
            pools[[i, j]] = defined(
                signature(mass[j], iso[j], standard, Some(j), *t),
                &mut undefined,
            )?;
        }

        system.push(defined(
            signature(mass.sum(), iso.sum(), standard, None, *t),
            &mut undefined,
        )?);

        // Each pool releases isotope mass in proportion to its own ratio
        let released: FloatValue = flux.sum();
        let released_iso: FloatValue = (0..n)
            .filter(|j| mass[*j] != 0.0)
            .map(|j| flux[j] * iso[j] / mass[j])
            .sum();
        respired_flux[i] = released;
        respired.push(defined(
            signature(released, released_iso, standard, None, *t),
            &mut undefined,
        )?);
    }

    for (i, t) in times.iter().enumerate() {
        for j in 0..n {
            if let Some(value) = pools[[i, j]] {
                if !is_plausible_delta(value) {
                    diagnostics::flag(
                        &mut warnings,
                        Degeneracy::ImplausibleSignature {
                            pool: Some(j),
                            time: *t,
                            value,
                        },
                    );
                }
            }
        }
        for value in [system[i], respired[i]].into_iter().flatten() {
            if !is_plausible_delta(value) {
                diagnostics::flag(
                    &mut warnings,
                    Degeneracy::ImplausibleSignature {
                        pool: None,
                        time: *t,
                        value,
                    },
                );
            }
        }
    }

    Ok(SignatureTrajectory {
        times: times.clone(),
        pools,
        system,
        respired,
        respired_flux,
        undefined,
        warnings,
    })
}

/// Keep undefined ratios as `None`, propagate every other error.
fn defined(
    result: PoolResult<FloatValue>,
    undefined: &mut Vec<UndefinedPoint>,
) -> PoolResult<Option<FloatValue>> {
    match result {
        Ok(delta) => Ok(Some(delta)),
        Err(e @ PoolError::UndefinedRatio { pool, time }) => {
            log::debug!("{}", e);
            undefined.push(UndefinedPoint { pool, time });
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
