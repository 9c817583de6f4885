//! Physical and numerical constants shared across the crate.

use crate::timeseries::FloatValue;

/// Half-life of radiocarbon (Cambridge value)
/// unit: yr
pub const RADIOCARBON_HALF_LIFE: FloatValue = 5730.0;

/// Scale of delta notation (parts per thousand)
pub const PER_MIL: FloatValue = 1000.0;

/// Smallest physically meaningful delta value; below this the ratio is negative.
/// unit: ‰
pub const PLAUSIBLE_DELTA_MIN: FloatValue = -1000.0;

/// Largest delta value accepted without a degeneracy warning.
///
/// Atmospheric radiocarbon peaked near +900‰ in 1963.
/// unit: ‰
pub const PLAUSIBLE_DELTA_MAX: FloatValue = 2000.0;

/// Fraction of a distribution that the age axis must cover before a
/// truncation warning is raised.
pub const MIN_COVERED_PROBABILITY: FloatValue = 0.99;

/// Tolerance for sums of transfer fractions and input partitions.
pub const FRACTION_TOLERANCE: FloatValue = 1e-9;

/// First-order decay constant for a half-life.
pub fn decay_constant(half_life: FloatValue) -> FloatValue {
    std::f64::consts::LN_2 / half_life
}
