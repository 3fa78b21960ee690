//! Dense linear-algebra helpers shared by every estimator.
//!
//! Pseudo-inverses use a relative cutoff of `1e-15 · σ_max` and ranks use the
//! `σ_max · max(n, k) · ε` tolerance.

use nalgebra::{DMatrix, DVector, SymmetricEigen, SVD};

use crate::error::{IvError, Result};

const PINV_RCOND: f64 = 1e-15;

/// Concatenates two matrices with the same number of rows side by side.
pub fn hstack(left: &DMatrix<f64>, right: &DMatrix<f64>) -> DMatrix<f64> {
    let split = left.ncols();
    DMatrix::from_fn(left.nrows(), split + right.ncols(), |i, j| {
        if j < split {
            left[(i, j)]
        } else {
            right[(i, j - split)]
        }
    })
}

/// Multiplies row `i` of `matrix` by `scale[i]`.
pub fn scale_rows(matrix: &DMatrix<f64>, scale: &DVector<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(matrix.nrows(), matrix.ncols(), |i, j| matrix[(i, j)] * scale[i])
}

/// Column means returned as a column vector.
pub fn column_means(matrix: &DMatrix<f64>) -> DVector<f64> {
    let n = matrix.nrows().max(1) as f64;
    DVector::from_fn(matrix.ncols(), |j, _| matrix.column(j).sum() / n)
}

/// Returns `(m + m') / 2`.
pub fn symmetrize(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    (matrix + matrix.transpose()) * 0.5
}

/// Moore-Penrose pseudo-inverse computed from the SVD.
pub fn pinv(matrix: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    if matrix.nrows() == 0 || matrix.ncols() == 0 {
        return Ok(DMatrix::zeros(matrix.ncols(), matrix.nrows()));
    }
    let svd = SVD::new(matrix.clone(), true, true);
    let max_sv = svd.singular_values.iter().cloned().fold(0.0_f64, f64::max);
    if !max_sv.is_finite() {
        return Err(IvError::NumericalError {
            context: "pseudo-inverse",
        });
    }
    svd.pseudo_inverse(PINV_RCOND * max_sv)
        .map_err(|_| IvError::NumericalError {
            context: "pseudo-inverse",
        })
}

/// Plain inverse of a square matrix via LU.
pub fn inverse(matrix: &DMatrix<f64>, context: &'static str) -> Result<DMatrix<f64>> {
    if matrix.nrows() != matrix.ncols() {
        return Err(IvError::dimension_mismatch(
            context,
            matrix.nrows(),
            matrix.ncols(),
        ));
    }
    matrix
        .clone()
        .try_inverse()
        .filter(|inv| inv.iter().all(|v| v.is_finite()))
        .ok_or_else(|| IvError::singular(context))
}

/// Numerical rank using the SVD.
pub fn matrix_rank(matrix: &DMatrix<f64>) -> usize {
    if matrix.nrows() == 0 || matrix.ncols() == 0 {
        return 0;
    }
    let singular_values = SVD::new(matrix.clone(), false, false).singular_values;
    let max_sv = singular_values.iter().cloned().fold(0.0_f64, f64::max);
    let tol = max_sv * matrix.nrows().max(matrix.ncols()) as f64 * f64::EPSILON;
    singular_values.iter().filter(|&&s| s > tol).count()
}

/// Inverse symmetric square root `m^{-1/2}` from the eigendecomposition of `m`.
pub fn inv_sqrth(matrix: &DMatrix<f64>, context: &'static str) -> Result<DMatrix<f64>> {
    let eigen = SymmetricEigen::new(symmetrize(matrix));
    if eigen.eigenvalues.iter().any(|&v| !(v > 0.0)) {
        return Err(IvError::singular(context));
    }
    let scale = eigen.eigenvalues.map(|v| 1.0 / v.sqrt());
    let vectors = &eigen.eigenvectors;
    Ok(vectors * DMatrix::from_diagonal(&scale) * vectors.transpose())
}

/// Smallest eigenvalue of a symmetric matrix.
pub fn min_eigenvalue(matrix: &DMatrix<f64>) -> Result<f64> {
    let eigen = SymmetricEigen::new(symmetrize(matrix));
    let min = eigen
        .eigenvalues
        .iter()
        .cloned()
        .fold(f64::INFINITY, f64::min);
    if min.is_nan() || eigen.eigenvalues.is_empty() {
        return Err(IvError::NumericalError {
            context: "eigenvalue decomposition",
        });
    }
    Ok(min)
}

/// Location of the first non-zero constant column, if any.
pub fn find_constant(x: &DMatrix<f64>) -> Option<usize> {
    if x.nrows() == 0 {
        return None;
    }
    (0..x.ncols()).find(|&j| {
        let column = x.column(j);
        let first = column[0];
        first != 0.0 && column.iter().all(|&v| v == first)
    })
}

/// Detects an explicit or implied constant among the columns of `x`.
///
/// Returns the location of the explicit constant column when one exists, otherwise
/// the column that contributes most to the implied constant.
pub fn has_constant(x: &DMatrix<f64>) -> (bool, Option<usize>) {
    if x.ncols() == 0 || x.nrows() == 0 {
        return (false, None);
    }
    if let Some(loc) = find_constant(x) {
        return (true, Some(loc));
    }

    let (n, k) = x.shape();
    let ones = DMatrix::from_element(n, 1, 1.0);
    let rank = matrix_rank(x);
    let augmented_rank = matrix_rank(&hstack(&ones, x));
    if augmented_rank != rank {
        return (false, None);
    }

    let loc = pinv(x).ok().and_then(|pinv_x| {
        let beta = pinv_x * DVector::from_element(n, 1.0);
        (0..k)
            .map(|j| {
                let column = x.column(j);
                let mean = column.sum() / n as f64;
                let var = column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
                (j, beta[j].abs() * var)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(j, _)| j)
    });
    (true, loc)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn pinv_of_full_rank_square_matches_inverse() {
        let m = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 2.0, 3.0]);
        let p = pinv(&m).unwrap();
        let inv = inverse(&m, "test").unwrap();
        assert_relative_eq!(p, inv, epsilon = 1e-12);
    }

    #[test]
    fn pinv_of_tall_matrix_is_left_inverse() {
        let m = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0]);
        let p = pinv(&m).unwrap();
        assert_eq!(p.shape(), (2, 3));
        assert_relative_eq!(p * &m, DMatrix::identity(2, 2), epsilon = 1e-12);
    }

    #[test]
    fn rank_detects_collinear_columns() {
        let m = DMatrix::from_row_slice(3, 3, &[1.0, 2.0, 3.0, 1.0, 3.0, 4.0, 1.0, 4.0, 5.0]);
        assert_eq!(matrix_rank(&m), 2);
        assert_eq!(matrix_rank(&DMatrix::<f64>::zeros(4, 0)), 0);
    }

    #[test]
    fn inv_sqrth_whitens() {
        let m = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let s = inv_sqrth(&m, "test").unwrap();
        assert_relative_eq!(&s * &m * &s, DMatrix::identity(2, 2), epsilon = 1e-12);
    }

    #[test]
    fn constant_detection() {
        let x = DMatrix::from_row_slice(3, 2, &[1.0, 0.5, 1.0, 2.0, 1.0, -1.0]);
        assert_eq!(find_constant(&x), Some(0));
        assert_eq!(has_constant(&x), (true, Some(0)));

        // Two dummies that sum to one imply a constant.
        let dummies = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0]);
        assert_eq!(find_constant(&dummies), None);
        assert!(has_constant(&dummies).0);

        let none = DMatrix::from_row_slice(3, 1, &[1.0, 2.0, 4.0]);
        assert!(!has_constant(&none).0);

        // A square full-rank block spans the ones vector.
        let square = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 2.0]);
        assert!(has_constant(&square).0);
    }

    #[test]
    fn hstack_and_scale_rows() {
        let a = DMatrix::from_row_slice(2, 1, &[1.0, 2.0]);
        let b = DMatrix::from_row_slice(2, 2, &[3.0, 4.0, 5.0, 6.0]);
        let c = hstack(&a, &b);
        assert_eq!(c, DMatrix::from_row_slice(2, 3, &[1.0, 3.0, 4.0, 2.0, 5.0, 6.0]));
        let scaled = scale_rows(&c, &DVector::from_vec(vec![2.0, 0.5]));
        assert_eq!(scaled[(0, 2)], 8.0);
        assert_eq!(scaled[(1, 0)], 1.0);
    }
}
