//! Transfer structures between pools.
//!
//! Named layouts (series, parallel, feedback) are presets that expand into the
//! same general transfer-fraction matrix as a fully custom layout.

use crate::errors::{PoolError, PoolResult};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// How the outflow of each pool is routed to other pools.
///
/// Every variant expands to a matrix `F` where `F[(i, j)]` is the proportion
/// of pool `j`'s outflow that enters pool `i`. Whatever is not routed leaves
/// the system (release/respiration).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Topology {
    /// Independent pools with no transfers.
    #[default]
    Parallel,
    /// Pool `i` passes `transfer[i]` of its outflow to pool `i + 1`.
    Series { transfer: Vec<f64> },
    /// Series routing plus back-transfers: `forward[i]` goes from pool `i` to
    /// `i + 1` and `backward[i]` from pool `i + 1` back to `i`.
    Feedback {
        forward: Vec<f64>,
        backward: Vec<f64>,
    },
    /// Explicit row-major fraction matrix, `fractions[i][j]` from `j` to `i`.
    Custom { fractions: Vec<Vec<f64>> },
}

impl Topology {
    /// Expand into an `n_pools x n_pools` transfer-fraction matrix.
    pub fn fractions(&self, n_pools: usize) -> PoolResult<DMatrix<f64>> {
        let mut f = DMatrix::zeros(n_pools, n_pools);

        match self {
            Topology::Parallel => {}
            Topology::Series { transfer } => {
                expect_len("series transfer", transfer.len(), n_pools.saturating_sub(1))?;
                for (i, frac) in transfer.iter().enumerate() {
                    f[(i + 1, i)] = *frac;
                }
            }
            Topology::Feedback { forward, backward } => {
                expect_len("feedback forward", forward.len(), n_pools.saturating_sub(1))?;
                expect_len("feedback backward", backward.len(), n_pools.saturating_sub(1))?;
                for i in 0..forward.len() {
                    f[(i + 1, i)] = forward[i];
                    f[(i, i + 1)] = backward[i];
                }
            }
            Topology::Custom { fractions } => {
                expect_len("custom fraction rows", fractions.len(), n_pools)?;
                for (i, row) in fractions.iter().enumerate() {
                    expect_len("custom fraction columns", row.len(), n_pools)?;
                    for (j, frac) in row.iter().enumerate() {
                        if i == j && *frac != 0.0 {
                            return Err(PoolError::InvalidConfiguration(format!(
                                "pool {} cannot transfer to itself (fraction {})",
                                i, frac
                            )));
                        }
                        f[(i, j)] = *frac;
                    }
                }
            }
        }

        Ok(f)
    }
}

fn expect_len(what: &str, got: usize, expected: usize) -> PoolResult<()> {
    if got != expected {
        return Err(PoolError::InvalidConfiguration(format!(
            "{} has {} entries, expected {}",
            what, got, expected
        )));
    }
    Ok(())
}
