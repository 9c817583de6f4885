//! Time-indexed scalar series with explicit interpolation and extrapolation.
//!
//! Every time-varying quantity in a pool model (input magnitude, rate
//! modifiers, source isotope curves) is a [`Timeseries`]. Queries between
//! records are interpolated, queries outside the record follow the
//! [`Extrapolation`] policy of the side that was crossed.

use crate::errors::{PoolError, PoolResult};
use serde::{Deserialize, Serialize};

pub type FloatValue = f64;
pub type Time = f64;

/// How values between two records are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    /// Straight line between the bracketing records.
    #[default]
    Linear,
    /// Hold the value of the previous record (step function).
    Previous,
}

/// Policy for queries outside the recorded time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Extrapolation {
    /// Hold the nearest recorded value.
    #[default]
    Constant,
    /// Report zero.
    Zero,
    /// Refuse the query with [`PoolError::ExtrapolationNotAllowed`].
    Error,
}

/// An immutable scalar time series.
///
/// Times are strictly increasing and every value is finite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TimeseriesRecord")]
pub struct Timeseries {
    times: Vec<Time>,
    values: Vec<FloatValue>,
    interpolation: Interpolation,
    before: Extrapolation,
    after: Extrapolation,
}

/// Unvalidated serialised form of [`Timeseries`].
#[derive(Deserialize)]
struct TimeseriesRecord {
    times: Vec<Time>,
    values: Vec<FloatValue>,
    #[serde(default)]
    interpolation: Interpolation,
    #[serde(default)]
    before: Extrapolation,
    #[serde(default)]
    after: Extrapolation,
}

impl TryFrom<TimeseriesRecord> for Timeseries {
    type Error = PoolError;

    fn try_from(record: TimeseriesRecord) -> PoolResult<Self> {
        Ok(Timeseries::new(record.times, record.values)?
            .with_interpolation(record.interpolation)
            .with_extrapolation(record.before, record.after))
    }
}

impl Timeseries {
    /// Create a series from parallel time and value vectors.
    pub fn new(times: Vec<Time>, values: Vec<FloatValue>) -> PoolResult<Self> {
        if times.is_empty() {
            return Err(PoolError::InvalidConfiguration(
                "timeseries must contain at least one record".to_string(),
            ));
        }
        if times.len() != values.len() {
            return Err(PoolError::InvalidConfiguration(format!(
                "timeseries has {} times but {} values",
                times.len(),
                values.len()
            )));
        }
        if let Some(bad) = times.iter().chain(values.iter()).find(|v| !v.is_finite()) {
            return Err(PoolError::InvalidConfiguration(format!(
                "timeseries contains a non-finite entry ({})",
                bad
            )));
        }
        if times.windows(2).any(|w| w[1] <= w[0]) {
            return Err(PoolError::InvalidConfiguration(
                "timeseries times must be strictly increasing".to_string(),
            ));
        }

        Ok(Self {
            times,
            values,
            interpolation: Interpolation::default(),
            before: Extrapolation::default(),
            after: Extrapolation::default(),
        })
    }

    /// A series that has the same value at every time.
    pub fn constant(value: FloatValue) -> PoolResult<Self> {
        Self::new(vec![0.0], vec![value])
    }

    /// Build from `(time, value)` pairs.
    pub fn from_pairs(pairs: &[(Time, FloatValue)]) -> PoolResult<Self> {
        let (times, values) = pairs.iter().cloned().unzip();
        Self::new(times, values)
    }

    pub fn with_interpolation(mut self, interpolation: Interpolation) -> Self {
        self.interpolation = interpolation;
        self
    }

    /// Set the policies applied before the first and after the last record.
    pub fn with_extrapolation(mut self, before: Extrapolation, after: Extrapolation) -> Self {
        self.before = before;
        self.after = after;
        self
    }

    pub fn times(&self) -> &[Time] {
        &self.times
    }

    pub fn values(&self) -> &[FloatValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn first_time(&self) -> Time {
        self.times[0]
    }

    pub fn last_time(&self) -> Time {
        self.times[self.times.len() - 1]
    }

    /// True when every record holds the same value and both sides extrapolate it.
    pub fn is_constant(&self) -> bool {
        self.values.iter().all(|v| *v == self.values[0])
            && self.before == Extrapolation::Constant
            && self.after == Extrapolation::Constant
    }

    /// Smallest and largest recorded value.
    pub fn value_range(&self) -> (FloatValue, FloatValue) {
        self.values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(*v), hi.max(*v))
            })
    }

    /// Value of the series at time `t`.
    pub fn at(&self, t: Time) -> PoolResult<FloatValue> {
        let n = self.times.len();

        if t < self.times[0] {
            return self.extrapolate(self.before, t, "lower", 0);
        }
        if t > self.times[n - 1] {
            return self.extrapolate(self.after, t, "upper", n - 1);
        }

        // Index of the first record strictly after t
        let upper = self.times.partition_point(|x| *x <= t);
        if upper == 0 {
            return Ok(self.values[0]);
        }
        if upper == n {
            return Ok(self.values[n - 1]);
        }
        let lower = upper - 1;

        match self.interpolation {
            Interpolation::Previous => Ok(self.values[lower]),
            Interpolation::Linear => {
                let (t0, t1) = (self.times[lower], self.times[upper]);
                let (v0, v1) = (self.values[lower], self.values[upper]);
                Ok(v0 + (v1 - v0) * (t - t0) / (t1 - t0))
            }
        }
    }

    fn extrapolate(
        &self,
        policy: Extrapolation,
        t: Time,
        side: &str,
        index: usize,
    ) -> PoolResult<FloatValue> {
        match policy {
            Extrapolation::Constant => Ok(self.values[index]),
            Extrapolation::Zero => Ok(0.0),
            Extrapolation::Error => Err(PoolError::ExtrapolationNotAllowed {
                target: t,
                side: side.to_string(),
                bound: self.times[index],
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use is_close::is_close;

    fn ramp() -> Timeseries {
        Timeseries::new(vec![2000.0, 2010.0, 2020.0], vec![0.0, 10.0, 5.0]).unwrap()
    }

    #[test]
    fn linear_interpolation_between_records() {
        let ts = ramp();
        assert!(is_close!(ts.at(2005.0).unwrap(), 5.0));
        assert!(is_close!(ts.at(2015.0).unwrap(), 7.5));
        assert_eq!(ts.at(2010.0).unwrap(), 10.0);
        assert_eq!(ts.at(2020.0).unwrap(), 5.0);
    }

    #[test]
    fn previous_interpolation_holds_value() {
        let ts = ramp().with_interpolation(Interpolation::Previous);
        assert_eq!(ts.at(2009.9).unwrap(), 0.0);
        assert_eq!(ts.at(2010.0).unwrap(), 10.0);
        assert_eq!(ts.at(2019.0).unwrap(), 10.0);
    }

    #[test]
    fn extrapolation_policies() {
        let ts = ramp();
        assert_eq!(ts.at(1900.0).unwrap(), 0.0);
        assert_eq!(ts.at(2100.0).unwrap(), 5.0);

        let ts = ramp().with_extrapolation(Extrapolation::Zero, Extrapolation::Error);
        assert_eq!(ts.at(1900.0).unwrap(), 0.0);
        match ts.at(2030.0) {
            Err(PoolError::ExtrapolationNotAllowed { side, bound, .. }) => {
                assert_eq!(side, "upper");
                assert_eq!(bound, 2020.0);
            }
            other => panic!("Expected extrapolation error, got {:?}", other),
        }
    }

    #[test]
    fn rejects_unordered_times() {
        assert!(Timeseries::new(vec![1.0, 1.0], vec![0.0, 1.0]).is_err());
        assert!(Timeseries::new(vec![2.0, 1.0], vec![0.0, 1.0]).is_err());
        assert!(Timeseries::new(vec![1.0], vec![0.0, 1.0]).is_err());
        assert!(Timeseries::new(vec![], vec![]).is_err());
        assert!(Timeseries::new(vec![1.0], vec![f64::NAN]).is_err());
    }

    #[test]
    fn constant_series() {
        let ts = Timeseries::constant(3.0).unwrap();
        assert!(ts.is_constant());
        assert_eq!(ts.at(-1e6).unwrap(), 3.0);
        assert_eq!(ts.at(1e6).unwrap(), 3.0);
        assert!(!ramp().is_constant());
    }

    #[test]
    fn deserialization_validates() {
        let result: Result<Timeseries, _> =
            serde_json::from_str(r#"{"times": [1.0, 0.0], "values": [1.0, 2.0]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn deserializes_with_default_policies() {
        let ts: Timeseries =
            serde_json::from_str(r#"{"times": [0.0, 1.0], "values": [1.0, 2.0]}"#).unwrap();
        assert_eq!(ts.at(-5.0).unwrap(), 1.0);
        assert!(is_close!(ts.at(0.25).unwrap(), 1.25));
    }
}
