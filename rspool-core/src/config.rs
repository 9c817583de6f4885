//! TOML configuration surface for pool models.
//!
//! ```toml
//! decay_rates = [0.2, 0.015]
//! initial_mass = [0.0, 0.0]
//! lag = 0.0
//!
//! [topology]
//! kind = "series"
//! transfer = [0.15]
//!
//! [input]
//! partition = [1.0, 0.0]
//! magnitude = 1.0
//!
//! [time_grid]
//! start = 0.0
//! end = 100.0
//! step = 1.0
//! ```
//!
//! The input may instead be a series (`times`, `values` and optional
//! `interpolation`, `before`, `after`). Optional tables: `modifier`
//! (series), `ages` (`values` or `start`/`end`/`points`, plus
//! `quantiles`), `isotope` (`half_life` or `stable = true`,
//! `ratio_standard`, `source` series) and `solver`.

use crate::age::AgeAxis;
use crate::errors::{PoolError, PoolResult};
use crate::isotope::IsotopeSettings;
use crate::ivp::SolverOptions;
use crate::model::{InputFlux, PoolModel, PoolModelBuilder, Topology};
use crate::source_curve::SourceCurve;
use crate::timeseries::{Extrapolation, FloatValue, Interpolation, Time, Timeseries};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// External input: a partition across pools and a total magnitude.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    pub partition: Vec<FloatValue>,
    /// Constant total input.
    pub magnitude: Option<FloatValue>,
    pub times: Option<Vec<Time>>,
    pub values: Option<Vec<FloatValue>>,
    #[serde(default)]
    pub interpolation: Interpolation,
    #[serde(default)]
    pub before: Extrapolation,
    #[serde(default)]
    pub after: Extrapolation,
}

impl InputConfig {
    /// Build the [`InputFlux`] described by this table.
    ///
    /// # Errors
    /// [`PoolError::InvalidConfiguration`] unless exactly one of `magnitude`
    /// or the `times`/`values` pair is given, or when the series is invalid.
    pub fn to_input(&self) -> PoolResult<InputFlux> {
        let magnitude = match (self.magnitude, &self.times, &self.values) {
            (Some(m), None, None) => Timeseries::constant(m)?,
            (None, Some(times), Some(values)) => Timeseries::new(times.clone(), values.clone())?
                .with_interpolation(self.interpolation)
                .with_extrapolation(self.before, self.after),
            _ => {
                return Err(PoolError::InvalidConfiguration(
                    "input needs either `magnitude` or both `times` and `values`".to_string(),
                ))
            }
        };
        Ok(InputFlux::new(magnitude, self.partition.clone()))
    }
}

/// Output times: an explicit list or an evenly stepped range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeGridConfig {
    pub times: Option<Vec<Time>>,
    pub start: Option<Time>,
    pub end: Option<Time>,
    pub step: Option<Time>,
}

impl TimeGridConfig {
    /// Expand into the output times.
    ///
    /// A stepped range includes `end` when it falls on the step.
    pub fn to_times(&self) -> PoolResult<Vec<Time>> {
        match (&self.times, self.start, self.end, self.step) {
            (Some(times), None, None, None) => Ok(times.clone()),
            (None, Some(start), Some(end), Some(step)) => {
                if !(step > 0.0) || end < start {
                    return Err(PoolError::InvalidConfiguration(format!(
                        "time grid needs start <= end and a positive step (start={}, end={}, step={})",
                        start, end, step
                    )));
                }
                let n = ((end - start) / step + 1e-9).floor() as usize;
                Ok((0..=n).map(|i| start + step * i as Time).collect())
            }
            _ => Err(PoolError::InvalidConfiguration(
                "time grid needs either `times` or `start`, `end` and `step`".to_string(),
            )),
        }
    }
}

/// Age axis and quantiles for age and transit-time summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgesConfig {
    pub values: Option<Vec<FloatValue>>,
    pub start: Option<FloatValue>,
    pub end: Option<FloatValue>,
    pub points: Option<usize>,
    #[serde(default)]
    pub quantiles: Vec<FloatValue>,
}

impl AgesConfig {
    /// Explicit `values`, or `points` evenly spaced ages from `start`
    /// (default 0) to `end`.
    pub fn to_axis(&self) -> PoolResult<AgeAxis> {
        match (&self.values, self.start, self.end, self.points) {
            (Some(values), None, None, None) => AgeAxis::new(values.clone()),
            (None, start, Some(end), Some(points)) => {
                AgeAxis::linspace(start.unwrap_or(0.0), end, points)
            }
            _ => Err(PoolError::InvalidConfiguration(
                "ages need either `values` or `end` and `points`".to_string(),
            )),
        }
    }
}

/// Tracer settings and, optionally, the source signature curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsotopeConfig {
    #[serde(flatten)]
    pub settings: IsotopeSettings,
    /// Source signature curve (calendar time, ‰).
    pub source: Option<Timeseries>,
}

/// Complete description of a pool model run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub decay_rates: Vec<FloatValue>,
    pub initial_mass: Vec<FloatValue>,
    pub initial_signature: Option<Vec<FloatValue>>,
    #[serde(default)]
    pub lag: Time,
    #[serde(default)]
    pub topology: Topology,
    pub input: InputConfig,
    pub modifier: Option<Timeseries>,
    pub time_grid: TimeGridConfig,
    pub ages: Option<AgesConfig>,
    pub isotope: Option<IsotopeConfig>,
    pub solver: Option<SolverOptions>,
}

impl ModelConfig {
    /// Parse a configuration from TOML text.
    ///
    /// # Errors
    /// [`PoolError::InvalidConfiguration`] carrying the parser message when
    /// the text is malformed or a field fails validation.
    pub fn from_toml_str(content: &str) -> PoolResult<Self> {
        toml::from_str(content).map_err(|e| {
            PoolError::InvalidConfiguration(format!("could not parse model configuration: {}", e))
        })
    }

    /// Read and parse a TOML configuration file.
    ///
    /// # Arguments
    ///
    /// * `path` - Location of the file
    pub fn from_path(path: impl AsRef<Path>) -> PoolResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PoolError::InvalidConfiguration(format!("could not read {}: {}", path.display(), e))
        })?;
        log::info!("Loading model configuration from {}", path.display());
        Self::from_toml_str(&content)
    }

    /// Serialise back to TOML. Parsing the output yields an equal configuration.
    pub fn to_toml_string(&self) -> PoolResult<String> {
        toml::to_string(self).map_err(|e| {
            PoolError::InvalidConfiguration(format!("could not serialise configuration: {}", e))
        })
    }

    /// Build and validate the [`PoolModel`] this configuration describes.
    ///
    /// Dimension mismatches, negative rates and over-allocated transfer
    /// fractions are reported as [`PoolError::InvalidConfiguration`].
    pub fn build_model(&self) -> PoolResult<PoolModel> {
        let mut builder = PoolModelBuilder::new(self.decay_rates.clone());
        builder
            .with_topology(self.topology.clone())
            .with_input(self.input.to_input()?)
            .with_lag(self.lag)
            .with_initial_mass(self.initial_mass.clone());
        if let Some(signature) = &self.initial_signature {
            builder.with_initial_signature(signature.clone());
        }
        if let Some(modifier) = &self.modifier {
            builder.with_modifier(modifier.clone());
        }
        builder.build()
    }

    /// Requested output times.
    pub fn time_grid(&self) -> PoolResult<Vec<Time>> {
        self.time_grid.to_times()
    }

    /// Age axis for age queries, if an `ages` table is present.
    pub fn age_axis(&self) -> PoolResult<Option<AgeAxis>> {
        self.ages.as_ref().map(|a| a.to_axis()).transpose()
    }

    /// Requested quantile probabilities; empty without an `ages` table.
    pub fn quantiles(&self) -> &[FloatValue] {
        self.ages.as_ref().map_or(&[], |a| a.quantiles.as_slice())
    }

    /// Tracer settings, falling back to radiocarbon.
    pub fn isotope_settings(&self) -> IsotopeSettings {
        self.isotope
            .as_ref()
            .map(|i| i.settings.clone())
            .unwrap_or_default()
    }

    /// Source signature curve, if one is configured.
    pub fn source_curve(&self) -> Option<SourceCurve> {
        self.isotope
            .as_ref()
            .and_then(|i| i.source.clone())
            .map(SourceCurve::from_timeseries)
    }

    /// Solver options, falling back to the defaults.
    pub fn solver_options(&self) -> SolverOptions {
        self.solver.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ivp::SolverMethod;
    use is_close::is_close;

    const SERIES: &str = r#"
decay_rates = [0.2, 0.015]
initial_mass = [0.0, 0.0]

[topology]
kind = "series"
transfer = [0.15]

[input]
partition = [1.0, 0.0]
magnitude = 1.0

[time_grid]
start = 0.0
end = 10.0
step = 0.5

[ages]
end = 100.0
points = 101
quantiles = [0.5, 0.95]

[isotope]
half_life = 5730.0
ratio_standard = 1.0

[isotope.source]
times = [1950.0, 1964.0]
values = [0.0, 700.0]

[solver]
method = "dopri5"
rtol = 1e-8
"#;

    #[test]
    fn parses_full_configuration() {
        let config = ModelConfig::from_toml_str(SERIES).unwrap();
        let model = config.build_model().unwrap();
        assert_eq!(model.n_pools(), 2);
        assert!(is_close!(model.matrix_at(0.0).unwrap()[(1, 0)], 0.03));

        let grid = config.time_grid().unwrap();
        assert_eq!(grid.len(), 21);
        assert_eq!(grid[20], 10.0);

        assert_eq!(config.age_axis().unwrap().unwrap().len(), 101);
        assert_eq!(config.quantiles(), &[0.5, 0.95]);
        assert_eq!(config.isotope_settings().half_life, Some(5730.0));
        assert!(config.source_curve().is_some());

        let solver = config.solver_options();
        assert_eq!(solver.method, SolverMethod::Dopri5);
        assert_eq!(solver.rtol, 1e-8);
        assert_eq!(solver.atol, SolverOptions::default().atol);
    }

    #[test]
    fn defaults_apply() {
        let config = ModelConfig::from_toml_str(
            r#"
decay_rates = [0.1]
initial_mass = [1.0]

[input]
partition = [1.0]
times = [2000.0, 2010.0]
values = [1.0, 2.0]
before = "zero"

[time_grid]
times = [2000.0, 2005.0]
"#,
        )
        .unwrap();
        assert_eq!(config.topology, Topology::Parallel);
        assert_eq!(config.lag, 0.0);
        assert!(config.age_axis().unwrap().is_none());
        assert_eq!(config.isotope_settings(), IsotopeSettings::default());

        let model = config.build_model().unwrap();
        assert_eq!(model.input_at(1990.0).unwrap()[0], 0.0);
        assert!(is_close!(model.input_at(2005.0).unwrap()[0], 1.5));
    }

    #[test]
    fn rejects_ambiguous_input() {
        let mut config = ModelConfig::from_toml_str(SERIES).unwrap();
        config.input.times = Some(vec![0.0]);
        assert!(matches!(
            config.build_model(),
            Err(PoolError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn dimension_mismatch_is_invalid() {
        let mut config = ModelConfig::from_toml_str(SERIES).unwrap();
        config.initial_mass = vec![0.0];
        assert!(matches!(
            config.build_model(),
            Err(PoolError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn malformed_toml_is_invalid() {
        assert!(matches!(
            ModelConfig::from_toml_str("decay_rates = ["),
            Err(PoolError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn stable_isotope_survives_round_trip() {
        let mut config = ModelConfig::from_toml_str(SERIES).unwrap();
        config.isotope.as_mut().unwrap().settings = IsotopeSettings::stable();

        let serialised = config.to_toml_string().unwrap();
        assert!(serialised.contains("stable = true"));
        let deserialised = ModelConfig::from_toml_str(&serialised).unwrap();
        assert_eq!(deserialised.isotope_settings().half_life, None);
        assert_eq!(deserialised.isotope_settings().decay_constant(), 0.0);
        assert_eq!(config, deserialised);
    }

    #[test]
    fn stable_isotope_from_toml() {
        let content = SERIES.replace("half_life = 5730.0", "stable = true");
        let config = ModelConfig::from_toml_str(&content).unwrap();
        assert_eq!(config.isotope_settings(), IsotopeSettings::stable());

        let both = SERIES.replace("half_life = 5730.0", "half_life = 5730.0\nstable = true");
        assert!(matches!(
            ModelConfig::from_toml_str(&both),
            Err(PoolError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn round_trip_through_toml() {
        let config = ModelConfig::from_toml_str(SERIES).unwrap();
        let serialised = config.to_toml_string().unwrap();
        let deserialised = ModelConfig::from_toml_str(&serialised).unwrap();
        assert_eq!(config, deserialised);
    }
}
