//! Isotopic signature of new inputs as a function of calendar time.

use crate::constants::PLAUSIBLE_DELTA_MIN;
use crate::errors::{PoolError, PoolResult};
use crate::timeseries::{Extrapolation, FloatValue, Interpolation, Time, Timeseries};
use serde::{Deserialize, Serialize};

/// An immutable source-signature curve (for example atmospheric Δ14C).
///
/// Built once from `(calendar time, delta)` records and then only read, so a
/// single curve can be shared between concurrent model evaluations.
/// By default the first record is held for earlier times (the background
/// era) and the last record is held for later times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCurve {
    series: Timeseries,
}

impl SourceCurve {
    pub fn new(times: Vec<Time>, signatures: Vec<FloatValue>) -> PoolResult<Self> {
        Ok(Self {
            series: Timeseries::new(times, signatures)?,
        })
    }

    pub fn from_pairs(pairs: &[(Time, FloatValue)]) -> PoolResult<Self> {
        Ok(Self {
            series: Timeseries::from_pairs(pairs)?,
        })
    }

    /// A curve with the same signature at all times.
    pub fn constant(signature: FloatValue) -> PoolResult<Self> {
        Ok(Self {
            series: Timeseries::constant(signature)?,
        })
    }

    pub fn from_timeseries(series: Timeseries) -> Self {
        Self { series }
    }

    pub fn with_extrapolation(self, before: Extrapolation, after: Extrapolation) -> Self {
        Self {
            series: self.series.with_extrapolation(before, after),
        }
    }

    pub fn with_interpolation(self, interpolation: Interpolation) -> Self {
        Self {
            series: self.series.with_interpolation(interpolation),
        }
    }

    /// Signature (delta, ‰) of material entering at calendar time `time`.
    pub fn value_at(&self, time: Time) -> PoolResult<FloatValue> {
        let value = self.series.at(time)?;
        if value < PLAUSIBLE_DELTA_MIN {
            return Err(PoolError::InvalidConfiguration(format!(
                "source signature {}‰ at t={} implies a negative isotope ratio",
                value, time
            )));
        }
        Ok(value)
    }

    pub fn is_constant(&self) -> bool {
        self.series.is_constant()
    }

    pub fn series(&self) -> &Timeseries {
        &self.series
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holds_background_before_first_record() {
        let curve = SourceCurve::from_pairs(&[(1950.0, 0.0), (1963.0, 800.0), (2000.0, 100.0)])
            .unwrap();
        assert_eq!(curve.value_at(1000.0).unwrap(), 0.0);
        assert_eq!(curve.value_at(2050.0).unwrap(), 100.0);
        assert!((curve.value_at(1956.5).unwrap() - 400.0).abs() < 1e-12);
    }

    #[test]
    fn strict_policy_rejects_out_of_range() {
        let curve = SourceCurve::from_pairs(&[(1950.0, 0.0), (2000.0, 100.0)])
            .unwrap()
            .with_extrapolation(Extrapolation::Error, Extrapolation::Error);
        assert!(matches!(
            curve.value_at(1900.0),
            Err(PoolError::ExtrapolationNotAllowed { .. })
        ));
    }

    #[test]
    fn rejects_negative_ratio() {
        let curve = SourceCurve::constant(-1200.0).unwrap();
        assert!(curve.value_at(0.0).is_err());
    }
}
