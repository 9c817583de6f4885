//! Builder for validated pool models.

use super::{InputFlux, PoolModel, Topology};
use crate::constants::{FRACTION_TOLERANCE, PLAUSIBLE_DELTA_MIN};
use crate::errors::{PoolError, PoolResult};
use crate::timeseries::{FloatValue, Time, Timeseries};
use is_close::is_close;
use nalgebra::{DMatrix, DVector};

/// Build a [`PoolModel`] from decay rates and a transfer structure.
///
/// The number of pools is the length of the decay-rate vector. Everything
/// else defaults to: no transfers, no input, no lag, no rate modifier, zero
/// initial mass and signatures equal to the reference standard (0‰).
///
/// ```
/// use rspool_core::model::{InputFlux, PoolModelBuilder, Topology};
///
/// let model = PoolModelBuilder::new(vec![0.2, 0.015])
///     .with_topology(Topology::Series { transfer: vec![0.15] })
///     .with_input(InputFlux::into_pool(1.0, 0, 2).unwrap())
///     .build()
///     .unwrap();
/// assert_eq!(model.n_pools(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct PoolModelBuilder {
    decay_rates: Vec<FloatValue>,
    topology: Topology,
    input: Option<InputFlux>,
    lag: Time,
    modifier: Option<Timeseries>,
    initial_mass: Option<Vec<FloatValue>>,
    initial_signature: Option<Vec<FloatValue>>,
}

impl PoolModelBuilder {
    pub fn new(decay_rates: Vec<FloatValue>) -> Self {
        Self {
            decay_rates,
            topology: Topology::default(),
            input: None,
            lag: 0.0,
            modifier: None,
            initial_mass: None,
            initial_signature: None,
        }
    }

    pub fn with_topology(&mut self, topology: Topology) -> &mut Self {
        self.topology = topology;
        self
    }

    pub fn with_input(&mut self, input: InputFlux) -> &mut Self {
        self.input = Some(input);
        self
    }

    /// Transport time between production of the input and its entry.
    pub fn with_lag(&mut self, lag: Time) -> &mut Self {
        self.lag = lag;
        self
    }

    /// Dimensionless multiplier applied to every rate (e.g. temperature/moisture scalar).
    pub fn with_modifier(&mut self, modifier: Timeseries) -> &mut Self {
        self.modifier = Some(modifier);
        self
    }

    pub fn with_initial_mass(&mut self, initial_mass: Vec<FloatValue>) -> &mut Self {
        self.initial_mass = Some(initial_mass);
        self
    }

    /// Initial per-pool signatures in delta notation (‰).
    pub fn with_initial_signature(&mut self, initial_signature: Vec<FloatValue>) -> &mut Self {
        self.initial_signature = Some(initial_signature);
        self
    }

    /// Validate the configuration and assemble the transfer-rate matrix.
    ///
    /// # Errors
    /// [`PoolError::InvalidConfiguration`] when a decay rate is negative or not
    /// finite, when the fractions leaving any pool sum to more than one, or
    /// when any per-pool vector does not match the number of pools.
    pub fn build(&self) -> PoolResult<PoolModel> {
        let n = self.decay_rates.len();
        if n == 0 {
            return invalid("a model needs at least one pool".to_string());
        }

        for (i, k) in self.decay_rates.iter().enumerate() {
            if !k.is_finite() || *k < 0.0 {
                return invalid(format!("pool {} has invalid decay rate {}", i, k));
            }
        }

        let fractions = self.topology.fractions(n)?;
        for ((i, j), frac) in fractions.iter().enumerate().map(|(idx, f)| ((idx % n, idx / n), f)) {
            if !frac.is_finite() || *frac < 0.0 || *frac > 1.0 {
                return invalid(format!(
                    "transfer fraction from pool {} to pool {} is {} (must be within 0..=1)",
                    j, i, frac
                ));
            }
        }
        for (j, column) in fractions.column_iter().enumerate() {
            let total = column.sum();
            if total > 1.0 + FRACTION_TOLERANCE {
                return invalid(format!(
                    "transfer fractions leaving pool {} sum to {} (more than 1)",
                    j, total
                ));
            }
        }

        let input = match &self.input {
            Some(input) => input.clone(),
            None => InputFlux::into_pool(0.0, 0, n)?,
        };
        validate_input(&input, n)?;

        if !self.lag.is_finite() || self.lag < 0.0 {
            return invalid(format!("input lag must be a non-negative number, got {}", self.lag));
        }

        if let Some(modifier) = &self.modifier {
            let (lo, _) = modifier.value_range();
            if lo < 0.0 {
                return invalid(format!("rate modifier must be non-negative, got {}", lo));
            }
        }

        let initial_mass = match &self.initial_mass {
            Some(m) => {
                expect_pools("initial mass", m.len(), n)?;
                if let Some(bad) = m.iter().find(|v| !v.is_finite() || **v < 0.0) {
                    return invalid(format!("initial mass must be non-negative, got {}", bad));
                }
                DVector::from_vec(m.clone())
            }
            None => DVector::zeros(n),
        };

        let initial_signature = match &self.initial_signature {
            Some(s) => {
                expect_pools("initial signature", s.len(), n)?;
                if let Some(bad) = s.iter().find(|v| !v.is_finite() || **v < PLAUSIBLE_DELTA_MIN) {
                    return invalid(format!("initial signature {}‰ is not a valid delta", bad));
                }
                DVector::from_vec(s.clone())
            }
            None => DVector::zeros(n),
        };

        let decay_rates = DVector::from_vec(self.decay_rates.clone());
        let base_matrix = transfer_rate_matrix(&decay_rates, &fractions);

        log::debug!(
            "Built {}-pool model with {:?} topology, lag {}",
            n,
            self.topology,
            self.lag
        );

        Ok(PoolModel {
            decay_rates,
            fractions,
            base_matrix,
            input,
            lag: self.lag,
            modifier: self.modifier.clone(),
            initial_mass,
            initial_signature,
        })
    }
}

/// `A = (F - I) diag(k)`.
fn transfer_rate_matrix(
    decay_rates: &DVector<FloatValue>,
    fractions: &DMatrix<FloatValue>,
) -> DMatrix<FloatValue> {
    let n = decay_rates.len();
    let mut a = fractions - DMatrix::<FloatValue>::identity(n, n);
    for (j, k) in decay_rates.iter().enumerate() {
        a.column_mut(j).scale_mut(*k);
    }
    a
}

fn validate_input(input: &InputFlux, n: usize) -> PoolResult<()> {
    expect_pools("input partition", input.partition().len(), n)?;
    if let Some(bad) = input.partition().iter().find(|p| !p.is_finite() || **p < 0.0) {
        return invalid(format!("input partition entries must be non-negative, got {}", bad));
    }
    let total: FloatValue = input.partition().iter().sum();
    if !is_close!(total, 1.0, rel_tol = FRACTION_TOLERANCE, abs_tol = FRACTION_TOLERANCE) {
        return invalid(format!("input partition sums to {} (must be 1)", total));
    }
    let (lo, _) = input.magnitude().value_range();
    if lo < 0.0 {
        return invalid(format!("input magnitude must be non-negative, got {}", lo));
    }
    Ok(())
}

fn expect_pools(what: &str, got: usize, n: usize) -> PoolResult<()> {
    if got != n {
        return invalid(format!(
            "{} has {} entries but the model has {} pools",
            what, got, n
        ));
    }
    Ok(())
}

fn invalid<T>(msg: String) -> PoolResult<T> {
    Err(PoolError::InvalidConfiguration(msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_invalid(result: PoolResult<PoolModel>) -> bool {
        matches!(result, Err(PoolError::InvalidConfiguration(_)))
    }

    #[test]
    fn test_negative_decay_rate() {
        assert!(is_invalid(PoolModelBuilder::new(vec![0.1, -0.01]).build()));
        assert!(is_invalid(PoolModelBuilder::new(vec![f64::NAN]).build()));
        assert!(is_invalid(PoolModelBuilder::new(vec![]).build()));
    }

    #[test]
    fn test_fractions_over_one() {
        let result = PoolModelBuilder::new(vec![0.1, 0.1, 0.1])
            .with_topology(Topology::Custom {
                fractions: vec![
                    vec![0.0, 0.0, 0.0],
                    vec![0.7, 0.0, 0.0],
                    vec![0.5, 0.0, 0.0],
                ],
            })
            .build();
        assert!(is_invalid(result));

        let result = PoolModelBuilder::new(vec![0.1, 0.1])
            .with_topology(Topology::Series {
                transfer: vec![1.5],
            })
            .build();
        assert!(is_invalid(result));
    }

    #[test]
    fn test_closed_pool_is_allowed() {
        // All outflow of pool 0 goes to pool 1
        let model = PoolModelBuilder::new(vec![0.1, 0.1])
            .with_topology(Topology::Series {
                transfer: vec![1.0],
            })
            .build()
            .unwrap();
        assert_eq!(model.release_rates_at(0.0).unwrap()[0], 0.0);
    }

    #[test]
    fn test_initial_state_dimension_mismatch() {
        let result = PoolModelBuilder::new(vec![0.1, 0.2])
            .with_initial_mass(vec![1.0, 2.0, 3.0])
            .build();
        assert!(is_invalid(result));

        let result = PoolModelBuilder::new(vec![0.1, 0.2])
            .with_initial_signature(vec![0.0])
            .build();
        assert!(is_invalid(result));
    }

    #[test]
    fn test_input_partition_validation() {
        let result = PoolModelBuilder::new(vec![0.1, 0.2])
            .with_input(InputFlux::constant(1.0, vec![0.5, 0.4]).unwrap())
            .build();
        assert!(is_invalid(result));

        let result = PoolModelBuilder::new(vec![0.1, 0.2])
            .with_input(InputFlux::constant(-1.0, vec![0.5, 0.5]).unwrap())
            .build();
        assert!(is_invalid(result));
    }

    #[test]
    fn test_negative_lag_and_modifier() {
        assert!(is_invalid(PoolModelBuilder::new(vec![0.1]).with_lag(-1.0).build()));
        let modifier = Timeseries::new(vec![0.0, 1.0], vec![1.0, -0.5]).unwrap();
        assert!(is_invalid(
            PoolModelBuilder::new(vec![0.1]).with_modifier(modifier).build()
        ));
    }

    #[test]
    fn test_matrix_columns() {
        let model = PoolModelBuilder::new(vec![0.5, 0.25])
            .with_topology(Topology::Feedback {
                forward: vec![0.4],
                backward: vec![0.2],
            })
            .build()
            .unwrap();
        let a = model.matrix_at(0.0).unwrap();
        let expected = DMatrix::from_row_slice(2, 2, &[-0.5, 0.05, 0.2, -0.25]);
        assert!((a - expected).abs().max() < 1e-15);
    }
}
