//! Observations a model is calibrated against.
//!
//! Mass and signature observations have independent time supports: each
//! point carries its own time and the model is sampled at the union of all
//! observation times.

use crate::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A model quantity that can be observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Observable {
    /// Sum of all pool masses.
    TotalMass,
    PoolMass(usize),
    /// Mass-weighted signature of the whole stock (‰).
    SystemSignature,
    /// Release-flux weighted signature (‰).
    RespiredSignature,
    PoolSignature(usize),
}

impl fmt::Display for Observable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Observable::TotalMass => write!(f, "total mass"),
            Observable::PoolMass(i) => write!(f, "pool {} mass", i),
            Observable::SystemSignature => write!(f, "system signature"),
            Observable::RespiredSignature => write!(f, "respired signature"),
            Observable::PoolSignature(i) => write!(f, "pool {} signature", i),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub time: f64,
    pub value: f64,
}

/// Observations of one quantity with a shared uncertainty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedSeries {
    observable: Observable,
    observations: Vec<Observation>,
    sigma: Option<f64>,
}

impl ObservedSeries {
    pub fn new(observable: Observable) -> Self {
        Self {
            observable,
            observations: vec![],
            sigma: None,
        }
    }

    pub fn add(&mut self, time: f64, value: f64) -> Result<&mut Self> {
        if !time.is_finite() || !value.is_finite() {
            return Err(Error::InvalidTarget(format!(
                "{} observation ({}, {}) is not finite",
                self.observable, time, value
            )));
        }
        self.observations.push(Observation { time, value });
        Ok(self)
    }

    /// Use a fixed uncertainty instead of the sample standard deviation.
    pub fn with_sigma(&mut self, sigma: f64) -> Result<&mut Self> {
        if !(sigma > 0.0) || !sigma.is_finite() {
            return Err(Error::InvalidTarget(format!(
                "{} sigma must be positive, got {}",
                self.observable, sigma
            )));
        }
        self.sigma = Some(sigma);
        Ok(self)
    }

    pub fn observable(&self) -> Observable {
        self.observable
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Residual scale for this series.
    ///
    /// The explicit sigma when set, otherwise the sample standard deviation of
    /// the observed values. Falls back to 1.0 with fewer than two points or no
    /// spread, so mass and signature series are balanced by their own variance.
    pub fn sigma(&self) -> f64 {
        if let Some(sigma) = self.sigma {
            return sigma;
        }
        let n = self.observations.len();
        if n < 2 {
            return 1.0;
        }
        let mean = self.observations.iter().map(|o| o.value).sum::<f64>() / n as f64;
        let variance = self
            .observations
            .iter()
            .map(|o| (o.value - mean).powi(2))
            .sum::<f64>()
            / (n - 1) as f64;
        let sd = variance.sqrt();
        if sd > 0.0 {
            sd
        } else {
            1.0
        }
    }
}

/// All observations for one calibration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Target {
    series: IndexMap<Observable, ObservedSeries>,
}

impl Target {
    pub fn new() -> Self {
        Self::default()
    }

    /// Series for `observable`, created on first use.
    ///
    /// ```
    /// # use rspool_calibrate::{Observable, Target};
    /// let mut target = Target::new();
    /// target
    ///     .add_series(Observable::TotalMass)
    ///     .add(1990.0, 52.0)?
    ///     .add(2000.0, 55.5)?;
    /// target
    ///     .add_series(Observable::SystemSignature)
    ///     .add(1995.0, 80.0)?
    ///     .with_sigma(5.0)?;
    /// assert_eq!(target.times(), vec![1990.0, 1995.0, 2000.0]);
    /// # Ok::<(), rspool_calibrate::Error>(())
    /// ```
    pub fn add_series(&mut self, observable: Observable) -> &mut ObservedSeries {
        self.series
            .entry(observable)
            .or_insert_with(|| ObservedSeries::new(observable))
    }

    pub fn get(&self, observable: &Observable) -> Option<&ObservedSeries> {
        self.series.get(observable)
    }

    pub fn series(&self) -> impl Iterator<Item = &ObservedSeries> {
        self.series.values()
    }

    /// Sorted, de-duplicated union of all observation times.
    pub fn times(&self) -> Vec<f64> {
        let mut times: Vec<f64> = self
            .series
            .values()
            .flat_map(|s| s.observations.iter().map(|o| o.time))
            .collect();
        times.sort_by(|a, b| a.total_cmp(b));
        times.dedup();
        times
    }

    pub fn n_observations(&self) -> usize {
        self.series.values().map(|s| s.len()).sum()
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_observations() == 0 {
            return Err(Error::InvalidTarget("target has no observations".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_independent_time_supports() {
        let mut target = Target::new();
        target
            .add_series(Observable::TotalMass)
            .add(2000.0, 1.0)
            .unwrap()
            .add(1990.0, 2.0)
            .unwrap();
        target
            .add_series(Observable::RespiredSignature)
            .add(1995.0, 50.0)
            .unwrap()
            .add(2000.0, 40.0)
            .unwrap();
        assert_eq!(target.times(), vec![1990.0, 1995.0, 2000.0]);
        assert_eq!(target.n_observations(), 4);
        assert!(target.validate().is_ok());
    }

    #[test]
    fn test_sigma_defaults() {
        let mut series = ObservedSeries::new(Observable::TotalMass);
        assert_eq!(series.sigma(), 1.0);
        series.add(0.0, 1.0).unwrap().add(1.0, 3.0).unwrap();
        assert_relative_eq!(series.sigma(), 2.0_f64.sqrt());
        series.with_sigma(0.5).unwrap();
        assert_eq!(series.sigma(), 0.5);

        let mut flat = ObservedSeries::new(Observable::PoolMass(0));
        flat.add(0.0, 4.0).unwrap().add(1.0, 4.0).unwrap();
        assert_eq!(flat.sigma(), 1.0);
    }

    #[test]
    fn test_rejects_invalid_points() {
        let mut target = Target::new();
        assert!(target.validate().is_err());
        let series = target.add_series(Observable::SystemSignature);
        assert!(series.add(f64::NAN, 1.0).is_err());
        assert!(series.with_sigma(0.0).is_err());
    }

    #[test]
    fn test_add_series_reuses_existing() {
        let mut target = Target::new();
        target.add_series(Observable::PoolMass(1)).add(0.0, 1.0).unwrap();
        target.add_series(Observable::PoolMass(1)).add(1.0, 1.0).unwrap();
        assert_eq!(target.get(&Observable::PoolMass(1)).unwrap().len(), 2);
    }
}
