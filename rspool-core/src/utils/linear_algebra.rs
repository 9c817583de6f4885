//! Linear algebra utilities.

use crate::errors::{PoolError, PoolResult};
use nalgebra::{DMatrix, DVector};

/// Solve the dense system `Ax = b` using LU decomposition with partial pivoting.
///
/// # Errors
/// [`PoolError::SingularSystemMatrix`] if `A` is not invertible or the
/// solution is not finite. `context` names the calculation in the message.
///
/// # Example
/// ```
/// use nalgebra::{DMatrix, DVector};
/// use rspool_core::utils::linear_algebra::solve;
///
/// let a = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
/// let b = DVector::from_vec(vec![1.0, 2.0]);
///
/// let x = solve(&a, &b, "example").unwrap();
/// assert!((x[0] - 1.0 / 11.0).abs() < 1e-12);
/// assert!((x[1] - 7.0 / 11.0).abs() < 1e-12);
/// ```
pub fn solve(a: &DMatrix<f64>, b: &DVector<f64>, context: &str) -> PoolResult<DVector<f64>> {
    if !a.is_square() || a.nrows() != b.len() {
        return Err(PoolError::InvalidConfiguration(format!(
            "{}: cannot solve a {}x{} system with a right-hand side of length {}",
            context,
            a.nrows(),
            a.ncols(),
            b.len()
        )));
    }

    let lu = a.clone().lu();
    if !lu.is_invertible() {
        return Err(PoolError::SingularSystemMatrix(format!(
            "{}: matrix has a zero pivot",
            context
        )));
    }
    let x = lu.solve(b).ok_or_else(|| {
        PoolError::SingularSystemMatrix(format!("{}: LU solve failed", context))
    })?;

    if x.iter().any(|v| !v.is_finite()) {
        return Err(PoolError::SingularSystemMatrix(format!(
            "{}: matrix is numerically singular",
            context
        )));
    }
    Ok(x)
}

/// Steady state of `dx/dt = Ax + u`, i.e. `x* = -A⁻¹u`.
pub fn steady_state(a: &DMatrix<f64>, u: &DVector<f64>) -> PoolResult<DVector<f64>> {
    solve(&(-a), u, "steady state")
}

/// Row vector of per-pool release rates, `zᵀ = -1ᵀA`.
///
/// Entry `j` is the rate at which mass in pool `j` leaves the system
/// (its decay rate minus everything transferred to other pools).
pub fn release_rates(a: &DMatrix<f64>) -> DVector<f64> {
    DVector::from_iterator(a.ncols(), a.column_iter().map(|c| -c.sum()))
}

/// `A - λI`, the matrix seen by a tracer that also decays at rate `λ`.
pub fn shift_diagonal(a: &DMatrix<f64>, lambda: f64) -> DMatrix<f64> {
    let mut shifted = a.clone();
    for i in 0..shifted.nrows() {
        shifted[(i, i)] -= lambda;
    }
    shifted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solve_identity() {
        let a = DMatrix::<f64>::identity(3, 3);
        let b = DVector::from_vec(vec![1.0, 2.0, 3.0]);

        let x = solve(&a, &b, "identity").unwrap();
        assert_eq!(x, b);
    }

    #[test]
    fn test_steady_state_two_pool_series() {
        // dx1/dt = 1 - 0.2 x1 ; dx2/dt = 0.15 * 0.2 x1 - 0.015 x2
        let a = DMatrix::from_row_slice(2, 2, &[-0.2, 0.0, 0.03, -0.015]);
        let u = DVector::from_vec(vec![1.0, 0.0]);

        let x = steady_state(&a, &u).unwrap();

        assert!((x[0] - 5.0).abs() < 1e-10, "x[0] = {} (expected 5.0)", x[0]);
        assert!((x[1] - 10.0).abs() < 1e-10, "x[1] = {} (expected 10.0)", x[1]);
    }

    #[test]
    fn test_singular_matrix_is_reported() {
        // Second pool never decays
        let a = DMatrix::from_row_slice(2, 2, &[-0.2, 0.0, 0.2, 0.0]);
        let u = DVector::from_vec(vec![1.0, 0.0]);

        match steady_state(&a, &u) {
            Err(PoolError::SingularSystemMatrix(msg)) => assert!(msg.contains("steady state")),
            other => panic!("Expected SingularSystemMatrix, got {:?}", other),
        }
    }

    #[test]
    fn test_dimension_mismatch() {
        let a = DMatrix::<f64>::identity(2, 2);
        let b = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        assert!(matches!(
            solve(&a, &b, "mismatch"),
            Err(PoolError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_release_rates() {
        let a = DMatrix::from_row_slice(2, 2, &[-0.2, 0.0, 0.03, -0.015]);
        let z = release_rates(&a);
        assert!((z[0] - 0.17).abs() < 1e-12);
        assert!((z[1] - 0.015).abs() < 1e-12);
    }

    #[test]
    fn test_shift_diagonal() {
        let a = DMatrix::from_row_slice(2, 2, &[-0.2, 0.0, 0.03, -0.015]);
        let shifted = shift_diagonal(&a, 0.01);
        assert!((shifted[(0, 0)] + 0.21).abs() < 1e-12);
        assert!((shifted[(1, 1)] + 0.025).abs() < 1e-12);
        assert_eq!(shifted[(1, 0)], 0.03);
    }
}
