//! Named, box-bounded model parameters.
//!
//! Every parameter has a uniform prior on `[lower, upper]`, so the log prior
//! is constant inside the box and `-inf` outside it. Optimisers and samplers
//! keep candidates inside the box; the model is never run outside it.

use crate::{Error, Result};
use indexmap::IndexMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A single bounded parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub lower: f64,
    pub upper: f64,
}

impl Parameter {
    pub fn new(lower: f64, upper: f64) -> Result<Self> {
        if !lower.is_finite() || !upper.is_finite() || lower >= upper {
            return Err(Error::InvalidParameter(format!(
                "bounds must be finite with lower < upper, got [{}, {}]",
                lower, upper
            )));
        }
        Ok(Self { lower, upper })
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.lower, self.upper)
    }

    /// Fold `value` back into the box by mirroring at the bounds.
    pub fn reflect(&self, value: f64) -> f64 {
        if self.contains(value) {
            return value;
        }
        let width = self.width();
        let period = 2.0 * width;
        let offset = (value - self.lower).rem_euclid(period);
        if offset <= width {
            self.lower + offset
        } else {
            self.upper - (offset - width)
        }
    }
}

/// Ordered collection of parameters, indexed the same way as parameter vectors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    parameters: IndexMap<String, Parameter>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter with bounds `[lower, upper]`.
    ///
    /// ```
    /// # use rspool_calibrate::ParameterSet;
    /// let mut params = ParameterSet::new();
    /// params.add("k_fast", 0.01, 1.0)?.add("k_slow", 1e-4, 0.1)?;
    /// assert_eq!(params.param_names(), vec!["k_fast", "k_slow"]);
    /// # Ok::<(), rspool_calibrate::Error>(())
    /// ```
    pub fn add(&mut self, name: impl Into<String>, lower: f64, upper: f64) -> Result<&mut Self> {
        let name = name.into();
        if self.parameters.contains_key(&name) {
            return Err(Error::InvalidParameter(format!(
                "parameter '{}' is already defined",
                name
            )));
        }
        let parameter = Parameter::new(lower, upper)
            .map_err(|e| Error::InvalidParameter(format!("{}: {}", name, e)))?;
        self.parameters.insert(name, parameter);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn param_names(&self) -> Vec<String> {
        self.parameters.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.parameters.get(name)
    }

    pub fn lower(&self) -> Vec<f64> {
        self.parameters.values().map(|p| p.lower).collect()
    }

    pub fn upper(&self) -> Vec<f64> {
        self.parameters.values().map(|p| p.upper).collect()
    }

    /// Check that `values` has one entry per parameter.
    pub fn validate(&self, values: &[f64]) -> Result<()> {
        if values.len() != self.len() {
            return Err(Error::InvalidParameter(format!(
                "expected {} parameter values, got {}",
                self.len(),
                values.len()
            )));
        }
        if let Some((name, value)) = self
            .parameters
            .keys()
            .zip(values.iter())
            .find(|(_, v)| !v.is_finite())
        {
            return Err(Error::InvalidParameter(format!(
                "parameter '{}' is not finite ({})",
                name, value
            )));
        }
        Ok(())
    }

    pub fn contains(&self, values: &[f64]) -> bool {
        values.len() == self.len()
            && self
                .parameters
                .values()
                .zip(values.iter())
                .all(|(p, v)| p.contains(*v))
    }

    /// Clamp each value onto its bounds.
    pub fn project(&self, values: &[f64]) -> Vec<f64> {
        self.parameters
            .values()
            .zip(values.iter())
            .map(|(p, v)| p.clamp(*v))
            .collect()
    }

    pub fn reflect(&self, values: &[f64]) -> Vec<f64> {
        self.parameters
            .values()
            .zip(values.iter())
            .map(|(p, v)| p.reflect(*v))
            .collect()
    }

    /// Log of the (unnormalised) uniform prior.
    pub fn log_prior(&self, values: &[f64]) -> Result<f64> {
        self.validate(values)?;
        if self.contains(values) {
            Ok(0.0)
        } else {
            Ok(f64::NEG_INFINITY)
        }
    }

    /// Draw a vector uniformly from the box.
    pub fn sample_random_with_rng<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        self.parameters
            .values()
            .map(|p| rng.gen_range(p.lower..=p.upper))
            .collect()
    }

    pub fn to_map(&self, values: &[f64]) -> IndexMap<String, f64> {
        self.parameters
            .keys()
            .cloned()
            .zip(values.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    fn params() -> ParameterSet {
        let mut params = ParameterSet::new();
        params.add("a", 0.0, 1.0).unwrap().add("b", -2.0, 2.0).unwrap();
        params
    }

    #[test]
    fn test_add_and_names() {
        let params = params();
        assert_eq!(params.len(), 2);
        assert_eq!(params.param_names(), vec!["a", "b"]);
        assert_eq!(params.lower(), vec![0.0, -2.0]);
        assert_eq!(params.upper(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_rejects_bad_bounds_and_duplicates() {
        let mut params = params();
        assert!(matches!(
            params.add("c", 1.0, 1.0),
            Err(Error::InvalidParameter(_))
        ));
        assert!(params.add("d", f64::NEG_INFINITY, 1.0).is_err());
        assert!(params.add("a", 0.0, 2.0).is_err());
    }

    #[test]
    fn test_log_prior() {
        let params = params();
        assert_eq!(params.log_prior(&[0.5, 0.0]).unwrap(), 0.0);
        assert_eq!(params.log_prior(&[1.5, 0.0]).unwrap(), f64::NEG_INFINITY);
        assert!(params.log_prior(&[0.5]).is_err());
        assert!(params.log_prior(&[f64::NAN, 0.0]).is_err());
    }

    #[test]
    fn test_project_and_reflect() {
        let params = params();
        assert_eq!(params.project(&[1.5, -3.0]), vec![1.0, -2.0]);

        let reflected = params.reflect(&[1.25, -2.5]);
        assert_relative_eq!(reflected[0], 0.75);
        assert_relative_eq!(reflected[1], -1.5);
        // Far outside folds more than once
        assert_relative_eq!(params.get("a").unwrap().reflect(2.25), 0.25);
        assert_relative_eq!(params.get("a").unwrap().reflect(-0.25), 0.25);
    }

    #[test]
    fn test_random_samples_in_bounds() {
        let params = params();
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(42);
        for _ in 0..100 {
            assert!(params.contains(&params.sample_random_with_rng(&mut rng)));
        }
    }

    #[test]
    fn test_to_map() {
        let map = params().to_map(&[0.1, 0.2]);
        assert_eq!(map["a"], 0.1);
        assert_eq!(map["b"], 0.2);
    }
}
