//! Distribution of isotope signatures over the age cohorts of a system.
//!
//! Mass of age `a` observed at time `T` entered at `T - a`, carrying the
//! source signature of that calendar time, and has since decayed by
//! `e^{-λa}`. Weighting each cohort by its share of the standing stock and
//! binning the cohort signatures gives the probability density of the
//! signature of a randomly drawn unit of mass.

use crate::age::{AgeDistributions, LinearizedSystem};
use crate::derived::{delta_from_ratio, ratio_from_delta};
use crate::diagnostics::{self, is_plausible_delta, Degeneracy};
use crate::errors::{PoolError, PoolResult};
use crate::isotope::IsotopeSettings;
use crate::source_curve::SourceCurve;
use crate::timeseries::{FloatValue, Time};
use crate::utils::quadrature::trapezoid_weights;
use serde::{Deserialize, Serialize};

/// Which age density weights the cohorts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeDensitySource {
    System,
    Pool(usize),
}

/// Fixed-width histogram of cohort signatures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsotopeHistogram {
    /// `n_bins + 1` edges (‰)
    pub edges: Vec<FloatValue>,
    pub centres: Vec<FloatValue>,
    /// Stock carried by each bin. Empty bins hold zero.
    pub mass: Vec<FloatValue>,
    /// Probability density per ‰; integrates to one over the edges.
    pub density: Vec<FloatValue>,
    /// Cohort-weighted mean signature, before binning.
    pub mean: FloatValue,
    /// Mean of the bin centres weighted by bin mass.
    pub binned_mean: FloatValue,
    pub total_mass: FloatValue,
    pub warnings: Vec<Degeneracy>,
}

impl IsotopeHistogram {
    pub fn n_bins(&self) -> usize {
        self.mass.len()
    }

    pub fn bin_width(&self) -> FloatValue {
        self.edges[1] - self.edges[0]
    }
}

/// Cohort signatures and histograms for a linearised system.
///
/// The source curve is borrowed and never modified, so estimators for
/// different systems can share one curve.
#[derive(Debug, Clone)]
pub struct IsotopeDistributionEstimator<'a> {
    system: &'a LinearizedSystem,
    source: &'a SourceCurve,
    settings: IsotopeSettings,
    lag: Time,
}

impl<'a> IsotopeDistributionEstimator<'a> {
    pub fn new(
        system: &'a LinearizedSystem,
        source: &'a SourceCurve,
        settings: IsotopeSettings,
    ) -> PoolResult<Self> {
        settings.validate()?;
        Ok(Self {
            system,
            source,
            settings,
            lag: 0.0,
        })
    }

    /// Transport time between production of the input and its entry.
    pub fn with_lag(mut self, lag: Time) -> Self {
        self.lag = lag;
        self
    }

    /// Signature (‰) of the cohort of each age observed at `time`.
    pub fn cohort_signatures(
        &self,
        ages: &[FloatValue],
        time: Time,
    ) -> PoolResult<Vec<FloatValue>> {
        let lambda = self.settings.decay_constant();
        let standard = self.settings.ratio_standard;
        ages.iter()
            .map(|age| {
                let entered = self.source.value_at(time - age - self.lag)?;
                let ratio = ratio_from_delta(entered, standard) * (-lambda * age).exp();
                Ok(delta_from_ratio(ratio, standard))
            })
            .collect()
    }

    /// Histogram of cohort signatures at `time` in `n_bins` equal-width bins.
    ///
    /// Bins span the smallest to largest signature of any cohort with
    /// positive weight. Every bin is half-open `[lo, hi)` except the last,
    /// which also holds the maximum. A single distinct signature is placed
    /// in a bin widened to ±0.5‰.
    pub fn histogram(
        &self,
        distributions: &AgeDistributions,
        time: Time,
        density_source: AgeDensitySource,
        n_bins: usize,
    ) -> PoolResult<IsotopeHistogram> {
        if n_bins == 0 {
            return Err(PoolError::InvalidConfiguration(
                "histogram needs at least one bin".to_string(),
            ));
        }

        let (density, stock) = match density_source {
            AgeDensitySource::System => (distributions.system.to_vec(), self.system.total_stock()),
            AgeDensitySource::Pool(i) if i < self.system.n_pools() => (
                distributions.pools.column(i).to_vec(),
                self.system.steady_state()[i],
            ),
            AgeDensitySource::Pool(i) => {
                return Err(PoolError::InvalidConfiguration(format!(
                    "pool {} does not exist",
                    i
                )))
            }
        };

        let ages = &distributions.ages;
        let signatures = self.cohort_signatures(ages, time)?;
        let weights: Vec<FloatValue> = trapezoid_weights(ages)
            .iter()
            .zip(density.iter())
            .map(|(w, f)| (w * f * stock).max(0.0))
            .collect();

        let cohorts: Vec<(FloatValue, FloatValue)> = signatures
            .iter()
            .cloned()
            .zip(weights.iter().cloned())
            .filter(|(_, w)| *w > 0.0)
            .collect();
        if cohorts.is_empty() {
            return Err(PoolError::InvalidConfiguration(format!(
                "no age cohort carries mass for {:?}",
                density_source
            )));
        }

        let (mut lo, mut hi) = cohorts
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (s, _)| {
                (lo.min(*s), hi.max(*s))
            });
        if hi - lo <= 0.0 {
            lo -= 0.5;
            hi += 0.5;
        }
        let width = (hi - lo) / n_bins as FloatValue;
        let edges: Vec<FloatValue> = (0..=n_bins).map(|b| lo + width * b as FloatValue).collect();
        let centres: Vec<FloatValue> = edges.windows(2).map(|e| 0.5 * (e[0] + e[1])).collect();

        let mut mass = vec![0.0; n_bins];
        for (s, w) in cohorts.iter() {
            let bin = (((s - lo) / width).floor() as usize).min(n_bins - 1);
            mass[bin] += w;
        }

        let total_mass: FloatValue = mass.iter().sum();
        let density = mass.iter().map(|m| m / (total_mass * width)).collect();
        let mean = cohorts.iter().map(|(s, w)| s * w).sum::<FloatValue>() / total_mass;
        let binned_mean = centres
            .iter()
            .zip(mass.iter())
            .map(|(c, m)| c * m)
            .sum::<FloatValue>()
            / total_mass;

        let mut warnings = vec![];
        if !is_plausible_delta(mean) {
            diagnostics::flag(
                &mut warnings,
                Degeneracy::ImplausibleSignature {
                    pool: match density_source {
                        AgeDensitySource::System => None,
                        AgeDensitySource::Pool(i) => Some(i),
                    },
                    time,
                    value: mean,
                },
            );
        }

        log::debug!(
            "Binned {} cohorts into {} bins over [{:.2}, {:.2}]‰, mean {:.3}‰",
            cohorts.len(),
            n_bins,
            lo,
            hi,
            mean
        );

        Ok(IsotopeHistogram {
            edges,
            centres,
            mass,
            density,
            mean,
            binned_mean,
            total_mass,
            warnings,
        })
    }
}
