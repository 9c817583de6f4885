//! Results that were computed but are numerically degenerate.
//!
//! These never abort a computation. They are attached to the output that
//! produced them and logged at `warn` level so callers can tell "could not
//! compute" (an error) from "computed, but suspicious" (a [`Degeneracy`]).

use crate::constants::{PLAUSIBLE_DELTA_MAX, PLAUSIBLE_DELTA_MIN};
use crate::timeseries::{FloatValue, Time};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Degeneracy {
    /// A pool mass fell below zero.
    NegativeMass {
        pool: usize,
        time: Time,
        value: FloatValue,
    },
    /// A probability density evaluated below zero.
    NegativeDensity { age: Time, value: FloatValue },
    /// A delta value outside the physically plausible range.
    /// `pool` is `None` for whole-system or respired aggregates.
    ImplausibleSignature {
        pool: Option<usize>,
        time: Time,
        value: FloatValue,
    },
    /// The age axis covers less than the expected share of a distribution.
    TruncatedAgeAxis { covered: FloatValue },
    /// A pool has zero steady-state mass, so its age density is reported as zero.
    EmptyPool { pool: usize },
}

impl fmt::Display for Degeneracy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Degeneracy::NegativeMass { pool, time, value } => {
                write!(f, "pool {} has negative mass {} at t={}", pool, value, time)
            }
            Degeneracy::NegativeDensity { age, value } => {
                write!(f, "negative density {} at age {}", value, age)
            }
            Degeneracy::ImplausibleSignature { pool, time, value } => match pool {
                Some(p) => write!(f, "pool {} signature {}‰ at t={} is implausible", p, value, time),
                None => write!(f, "aggregate signature {}‰ at t={} is implausible", value, time),
            },
            Degeneracy::TruncatedAgeAxis { covered } => {
                write!(f, "age axis covers only {:.4} of the distribution", covered)
            }
            Degeneracy::EmptyPool { pool } => {
                write!(f, "pool {} has no steady-state mass", pool)
            }
        }
    }
}

/// Record a degeneracy, logging it once.
pub(crate) fn flag(warnings: &mut Vec<Degeneracy>, degeneracy: Degeneracy) {
    log::warn!("{}", degeneracy);
    warnings.push(degeneracy);
}

pub(crate) fn is_plausible_delta(delta: FloatValue) -> bool {
    (PLAUSIBLE_DELTA_MIN..=PLAUSIBLE_DELTA_MAX).contains(&delta)
}
