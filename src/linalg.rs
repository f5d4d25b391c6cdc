//! Dense symmetric matrix routines.
use nalgebra::{Cholesky, DMatrix, Dyn};
use ndarray::{Array2, ArrayView2};

use crate::Error;

/// Smallest accepted ratio between a Cholesky pivot and the corresponding diagonal entry.
pub const PIVOT_TOLERANCE: f64 = 1e-12;

/// Factorize `matrix`, rejecting pivots that only differ from zero by rounding noise.
fn factorize(matrix: ArrayView2<f64>) -> Result<Cholesky<f64, Dyn>, Error> {
    let n = matrix.shape()[0];
    if matrix.shape()[1] != n {
        return Err(Error::Internal(format!(
            "cholesky of a non square {}x{} matrix",
            n,
            matrix.shape()[1]
        )));
    }
    if n == 0 {
        return Err(Error::Internal("cholesky of an empty matrix".to_string()));
    }

    let chol = Cholesky::new(DMatrix::from_fn(n, n, |i, j| matrix[[i, j]])).ok_or_else(|| {
        Error::NumericInstability("covariance matrix is not positive-definite".to_string())
    })?;

    for (j, diag) in chol.l_dirty().diagonal().iter().enumerate() {
        let pivot = diag * diag;
        if !pivot.is_finite() || pivot <= PIVOT_TOLERANCE * matrix[[j, j]] {
            return Err(Error::NumericInstability(format!(
                "covariance matrix is not positive-definite (pivot {pivot:e} at column {j})"
            )));
        }
    }

    Ok(chol)
}

/// Compute the lower triangular Cholesky factor `L` of `matrix`, such that `matrix = L·Lᵀ`.
///
/// Only the lower triangle of `matrix` is read.
///
/// # Errors
/// Returns [`Error::NumericInstability`] if `matrix` is not (numerically) positive-definite. A
/// pivot is rejected when it does not exceed [`PIVOT_TOLERANCE`] times its diagonal entry, which
/// catches duplicated or collinear variables whose pivot only differs from zero by rounding noise.
pub fn cholesky(matrix: ArrayView2<f64>) -> Result<Array2<f64>, Error> {
    let l = factorize(matrix)?.l();

    Ok(Array2::from_shape_fn(l.shape(), |(i, j)| l[(i, j)]))
}

/// Invert a symmetric positive-definite matrix through its Cholesky factorization.
///
/// The result is exactly symmetric.
///
/// # Errors
/// See [`cholesky`].
pub fn cholesky_inverse(matrix: ArrayView2<f64>) -> Result<Array2<f64>, Error> {
    let inverse = factorize(matrix)?.inverse();
    let inverse = Array2::from_shape_fn(inverse.shape(), |(i, j)| {
        0.5 * (inverse[(i, j)] + inverse[(j, i)])
    });

    if inverse.iter().any(|x| !x.is_finite()) {
        return Err(Error::NumericInstability(
            "covariance matrix inverse is not finite".to_string(),
        ));
    }

    Ok(inverse)
}

/// Return `true` if `matrix` is square and symmetric within the given relative tolerance.
pub fn is_symmetric(matrix: ArrayView2<f64>, tolerance: f64) -> bool {
    let n = matrix.shape()[0];
    if matrix.shape()[1] != n {
        return false;
    }

    for i in 0..n {
        for j in 0..i {
            let (a, b) = (matrix[[i, j]], matrix[[j, i]]);
            if (a - b).abs() > tolerance * a.abs().max(b.abs()).max(f64::MIN_POSITIVE) {
                return false;
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::{cholesky, cholesky_inverse, is_symmetric};
    use crate::error::ErrorKind;
    use ndarray::{array, Array2, Axis};

    fn assert_close(a: &Array2<f64>, b: &Array2<f64>, tolerance: f64) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < tolerance, "{x} != {y}");
        }
    }

    #[test]
    fn test_cholesky() {
        let matrix = array![[4.0, 12.0, -16.0], [12.0, 37.0, -43.0], [-16.0, -43.0, 98.0]];

        let l = cholesky(matrix.view()).unwrap();
        assert_close(
            &l,
            &array![[2.0, 0.0, 0.0], [6.0, 1.0, 0.0], [-8.0, 5.0, 3.0]],
            1e-12,
        );
        assert_close(&l.dot(&l.t()), &matrix, 1e-12);
    }

    #[test]
    fn test_inverse() {
        let matrix = array![[4.0, 12.0, -16.0], [12.0, 37.0, -43.0], [-16.0, -43.0, 98.0]];

        let inverse = cholesky_inverse(matrix.view()).unwrap();
        assert!(is_symmetric(inverse.view(), 0.0));
        assert_close(&inverse.dot(&matrix), &Array2::eye(3), 1e-9);
        assert_close(&matrix.dot(&inverse), &Array2::eye(3), 1e-9);
    }

    #[test]
    fn test_inverse_diagonal() {
        let matrix = array![[2.0, 0.0], [0.0, 0.5]];

        assert_close(
            &cholesky_inverse(matrix.view()).unwrap(),
            &array![[0.5, 0.0], [0.0, 2.0]],
            1e-12,
        );
    }

    #[test]
    fn test_duplicate_variables_are_rejected() {
        // Covariance of two identical samples
        let matrix = array![[2.5, 2.5], [2.5, 2.5]];

        assert_eq!(
            cholesky_inverse(matrix.view()).unwrap_err().kind(),
            ErrorKind::NumericInstability
        );
    }

    #[test]
    fn test_collinear_variables_are_rejected() {
        // Third variable is the sum of the first two
        let x = array![[1.0, 0.3, 1.3], [0.2, -1.1, -0.9], [-0.7, 0.4, -0.3], [0.5, 0.5, 1.0]];
        let matrix = x.t().dot(&x) / 3.0;

        assert_eq!(
            cholesky(matrix.view()).unwrap_err().kind(),
            ErrorKind::NumericInstability
        );
    }

    #[test]
    fn test_offset_collinear_sample_is_rejected() {
        // Third sample is an affine combination of the first two
        let traces = Array2::from_shape_fn((1000, 3), |(i, j)| {
            let (s0, s1) = ((i as f64 * 0.37).sin(), (i as f64 * 1.3).cos());
            match j {
                0 => s0,
                1 => s1,
                _ => 0.1 * s0 + 0.7 * s1 + 1234.5,
            }
        });
        let deviations = &traces - &traces.mean_axis(Axis(0)).unwrap();
        let covariance = deviations.t().dot(&deviations) / 999.0;

        assert_eq!(
            cholesky_inverse(covariance.view()).unwrap_err().kind(),
            ErrorKind::NumericInstability
        );
    }

    #[test]
    fn test_zero_and_negative_matrices_are_rejected() {
        assert_eq!(
            cholesky(Array2::<f64>::zeros((2, 2)).view()).unwrap_err().kind(),
            ErrorKind::NumericInstability
        );
        assert_eq!(
            cholesky(array![[1.0, 2.0], [2.0, 1.0]].view())
                .unwrap_err()
                .kind(),
            ErrorKind::NumericInstability
        );
        assert_eq!(
            cholesky(array![[f64::NAN]].view()).unwrap_err().kind(),
            ErrorKind::NumericInstability
        );
    }

    #[test]
    fn test_is_symmetric() {
        assert!(is_symmetric(array![[1.0, 2.0], [2.0, 1.0]].view(), 1e-9));
        assert!(!is_symmetric(array![[1.0, 2.0], [2.1, 1.0]].view(), 1e-9));
        assert!(!is_symmetric(array![[1.0, 2.0]].view(), 1e-9));
    }
}
