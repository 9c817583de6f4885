//! Matrix representation of a pool model.
//!
//! A model is described by per-pool decay rates `k`, a transfer-fraction
//! matrix `F` and an input flux `u(t)`. The transfer-rate matrix is
//!
//! $$ A(t) = \xi(t) \, (F - I) \, \mathrm{diag}(k) $$
//!
//! where $\xi(t)$ is an optional environmental rate modifier. Diagonal
//! entries are the negative decay rates and entry `(i, j)` is the rate of
//! mass flow from pool `j` into pool `i`.

mod builder;
mod topology;

pub use builder::PoolModelBuilder;
pub use topology::Topology;

use crate::errors::{PoolError, PoolResult};
use crate::timeseries::{FloatValue, Time, Timeseries};
use crate::utils::linear_algebra;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// External mass input: a total magnitude over time split across pools.
///
/// `u_i(t) = magnitude(t) * partition[i]`. The partition sums to one so the
/// magnitude is the total influx.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputFlux {
    magnitude: Timeseries,
    partition: Vec<FloatValue>,
}

impl InputFlux {
    pub fn new(magnitude: Timeseries, partition: Vec<FloatValue>) -> Self {
        Self {
            magnitude,
            partition,
        }
    }

    /// Constant total input split by `partition`.
    pub fn constant(total: FloatValue, partition: Vec<FloatValue>) -> PoolResult<Self> {
        Ok(Self::new(Timeseries::constant(total)?, partition))
    }

    /// Constant input entering a single pool.
    pub fn into_pool(total: FloatValue, pool: usize, n_pools: usize) -> PoolResult<Self> {
        if pool >= n_pools {
            return Err(PoolError::InvalidConfiguration(format!(
                "input pool {} does not exist in a {}-pool model",
                pool, n_pools
            )));
        }
        let mut partition = vec![0.0; n_pools];
        partition[pool] = 1.0;
        Self::constant(total, partition)
    }

    pub fn magnitude(&self) -> &Timeseries {
        &self.magnitude
    }

    pub fn partition(&self) -> &[FloatValue] {
        &self.partition
    }

    /// Per-pool input rates at time `t` (no lag applied).
    pub fn at(&self, t: Time) -> PoolResult<DVector<FloatValue>> {
        let total = self.magnitude.at(t)?;
        Ok(DVector::from_iterator(
            self.partition.len(),
            self.partition.iter().map(|p| p * total),
        ))
    }
}

/// A validated pool model. Construct with [`PoolModelBuilder`].
///
/// The number of pools is fixed at construction. Evaluating the model never
/// mutates it, so one model can be shared between threads.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolModel {
    decay_rates: DVector<FloatValue>,
    fractions: DMatrix<FloatValue>,
    base_matrix: DMatrix<FloatValue>,
    input: InputFlux,
    lag: Time,
    modifier: Option<Timeseries>,
    initial_mass: DVector<FloatValue>,
    initial_signature: DVector<FloatValue>,
}

impl PoolModel {
    pub fn n_pools(&self) -> usize {
        self.decay_rates.len()
    }

    pub fn decay_rates(&self) -> &DVector<FloatValue> {
        &self.decay_rates
    }

    pub fn transfer_fractions(&self) -> &DMatrix<FloatValue> {
        &self.fractions
    }

    pub fn input(&self) -> &InputFlux {
        &self.input
    }

    pub fn lag(&self) -> Time {
        self.lag
    }

    pub fn modifier(&self) -> Option<&Timeseries> {
        self.modifier.as_ref()
    }

    pub fn initial_mass(&self) -> &DVector<FloatValue> {
        &self.initial_mass
    }

    /// Initial per-pool signatures in delta notation (‰).
    pub fn initial_signature(&self) -> &DVector<FloatValue> {
        &self.initial_signature
    }

    /// Rate modifier at time `t`; 1 when the model has none.
    pub fn modifier_at(&self, t: Time) -> PoolResult<FloatValue> {
        match &self.modifier {
            Some(series) => series.at(t),
            None => Ok(1.0),
        }
    }

    /// Transfer-rate matrix `A(t)`.
    pub fn matrix_at(&self, t: Time) -> PoolResult<DMatrix<FloatValue>> {
        let xi = self.modifier_at(t)?;
        Ok(&self.base_matrix * xi)
    }

    /// Input vector `u(t)`, sourced from `t - lag`.
    ///
    /// Before the first record of the input series the input's own
    /// extrapolation policy applies (constant hold unless configured otherwise).
    pub fn input_at(&self, t: Time) -> PoolResult<DVector<FloatValue>> {
        self.input.at(t - self.lag)
    }

    /// Transfer-rate matrices for each time in `times`.
    pub fn matrices_over(&self, times: &[Time]) -> PoolResult<Vec<DMatrix<FloatValue>>> {
        times.iter().map(|t| self.matrix_at(*t)).collect()
    }

    /// Input vectors for each time in `times`.
    pub fn inputs_over(&self, times: &[Time]) -> PoolResult<Vec<DVector<FloatValue>>> {
        times.iter().map(|t| self.input_at(*t)).collect()
    }

    /// Per-pool rate at which mass leaves the system at time `t`.
    ///
    /// This is the decay rate minus everything transferred to other pools.
    pub fn release_rates_at(&self, t: Time) -> PoolResult<DVector<FloatValue>> {
        Ok(linear_algebra::release_rates(&self.matrix_at(t)?))
    }

    /// True if neither the matrix nor the input changes with time.
    pub fn is_time_invariant(&self) -> bool {
        self.modifier.as_ref().map_or(true, |m| m.is_constant()) && self.input.magnitude.is_constant()
    }

    /// Steady-state masses `-A⁻¹u` for the matrix and input at time `t`.
    pub fn steady_state(&self, t: Time) -> PoolResult<DVector<FloatValue>> {
        linear_algebra::steady_state(&self.matrix_at(t)?, &self.input_at(t)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeseries::Timeseries;

    fn two_pool_series() -> PoolModel {
        PoolModelBuilder::new(vec![0.2, 0.015])
            .with_topology(Topology::Series {
                transfer: vec![0.15],
            })
            .with_input(InputFlux::into_pool(1.0, 0, 2).unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn matrix_has_negative_diagonal_and_transfers() {
        let model = two_pool_series();
        let a = model.matrix_at(0.0).unwrap();
        assert_eq!(a[(0, 0)], -0.2);
        assert_eq!(a[(1, 1)], -0.015);
        assert!((a[(1, 0)] - 0.03).abs() < 1e-15);
        assert_eq!(a[(0, 1)], 0.0);
    }

    #[test]
    fn steady_state_matches_analytic() {
        let model = two_pool_series();
        let x = model.steady_state(0.0).unwrap();
        assert!((x[0] - 5.0).abs() < 1e-10);
        assert!((x[1] - 10.0).abs() < 1e-10);
        assert!(model.is_time_invariant());
    }

    #[test]
    fn modifier_scales_matrix() {
        let modifier = Timeseries::new(vec![0.0, 10.0], vec![1.0, 2.0]).unwrap();
        let model = PoolModelBuilder::new(vec![0.1])
            .with_input(InputFlux::into_pool(1.0, 0, 1).unwrap())
            .with_modifier(modifier)
            .build()
            .unwrap();
        assert!((model.matrix_at(5.0).unwrap()[(0, 0)] + 0.15).abs() < 1e-12);
        assert!(!model.is_time_invariant());
    }

    #[test]
    fn lag_shifts_input() {
        let magnitude = Timeseries::new(vec![0.0, 10.0], vec![0.0, 10.0]).unwrap();
        let model = PoolModelBuilder::new(vec![0.1])
            .with_input(InputFlux::new(magnitude, vec![1.0]))
            .with_lag(2.0)
            .build()
            .unwrap();
        assert!((model.input_at(5.0).unwrap()[0] - 3.0).abs() < 1e-12);
        // Before the record the first value is held
        assert_eq!(model.input_at(1.0).unwrap()[0], 0.0);
    }

    #[test]
    fn release_rates_exclude_transfers() {
        let model = two_pool_series();
        let z = model.release_rates_at(0.0).unwrap();
        assert!((z[0] - 0.17).abs() < 1e-12);
        assert!((z[1] - 0.015).abs() < 1e-12);
    }

    #[test]
    fn matrices_over_horizon() {
        let model = two_pool_series();
        let mats = model.matrices_over(&[0.0, 1.0, 2.0]).unwrap();
        assert_eq!(mats.len(), 3);
        assert_eq!(mats[0], mats[2]);
        let inputs = model.inputs_over(&[0.0, 1.0]).unwrap();
        assert_eq!(inputs[1][0], 1.0);
    }
}
