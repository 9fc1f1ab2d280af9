//! # Eigen Solvers
//!
//! Symmetric and symmetric-definite generalized eigenproblems with selection
//! of the top eigenpairs. Eigenvalues always come back in ascending order
//! with eigenvectors as the matching columns.

use crate::error::{FedSpcaError, Result};
use crate::utils::{to_array2, to_dmatrix};
use log::trace;
use nalgebra::{Cholesky, DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use std::cmp::Ordering;

const EIGEN_EPS: f64 = 1e-14;
const EIGEN_MAX_ITER: usize = 0;

/// Which eigenpairs of an `n × n` problem to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EigenSubset {
    #[default]
    All,
    /// The `k` largest, i.e. rank range `[n - k, n - 1]` in ascending order.
    Top(usize),
}

impl EigenSubset {
    pub fn from_components(n_components: Option<usize>) -> Self {
        n_components.map_or(EigenSubset::All, EigenSubset::Top)
    }

    /// Ascending rank range selected out of `n` eigenvalues.
    pub fn range(&self, n: usize) -> Result<std::ops::Range<usize>> {
        match *self {
            EigenSubset::All => Ok(0..n),
            EigenSubset::Top(k) if k == 0 || k > n => Err(FedSpcaError::InvalidConfiguration(
                format!("cannot select {} eigenpairs out of {}", k, n),
            )),
            EigenSubset::Top(k) => Ok(n - k..n),
        }
    }
}

/// Eigenvalues in ascending order and the eigenvectors as matching columns.
///
/// Produced once per fit and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct EigenResult {
    pub eigenvalues: Array1<f64>,
    pub eigenvectors: Array2<f64>,
}

impl EigenResult {
    pub fn n_components(&self) -> usize {
        self.eigenvalues.len()
    }

    /// Projects the rows of `x` onto the eigenvectors.
    pub fn project(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.eigenvectors.nrows() {
            return Err(FedSpcaError::shape(
                "data to project",
                (x.nrows(), self.eigenvectors.nrows()),
                x.dim(),
            ));
        }
        Ok(x.dot(&self.eigenvectors))
    }
}

// Trait for eigen-solver implementations
pub trait EigenSolver: Send + Sync {
    /// Solves `A·u = λ·u` for symmetric `A`.
    fn symmetric(&self, a: ArrayView2<f64>, subset: EigenSubset) -> Result<EigenResult>;

    /// Solves `A·u = λ·B·u` for symmetric `A` and symmetric positive definite
    /// `B`. Eigenvectors are normalised so that `uᵗ·B·u = 1`.
    fn generalized(
        &self,
        a: ArrayView2<f64>,
        b: ArrayView2<f64>,
        subset: EigenSubset,
    ) -> Result<EigenResult>;
}

/// Dense solver backed by nalgebra's symmetric QR algorithm.
#[derive(Debug, Clone, Copy, Default)]
pub struct NalgebraEigen;

fn check_square(context: &str, a: ArrayView2<f64>) -> Result<usize> {
    let (rows, cols) = a.dim();
    if rows != cols {
        return Err(FedSpcaError::shape(context, (rows, rows), (rows, cols)));
    }
    if rows == 0 {
        return Err(FedSpcaError::EmptyInput(format!("{} is empty", context)));
    }
    Ok(rows)
}

fn symmetrize(m: DMatrix<f64>) -> DMatrix<f64> {
    (&m + m.transpose()) * 0.5
}

fn sorted_subset(
    eigenvalues: &[f64],
    eigenvectors: &DMatrix<f64>,
    subset: EigenSubset,
) -> Result<(Array1<f64>, DMatrix<f64>)> {
    if eigenvalues.iter().any(|v| !v.is_finite()) {
        return Err(FedSpcaError::SingularMatrix(
            "eigen-decomposition produced non-finite eigenvalues".into(),
        ));
    }
    let mut order: Vec<usize> = (0..eigenvalues.len()).collect();
    order.sort_by(|&i, &j| {
        eigenvalues[i]
            .partial_cmp(&eigenvalues[j])
            .unwrap_or(Ordering::Equal)
    });

    let selected = &order[subset.range(order.len())?];
    let values = Array1::from_iter(selected.iter().map(|&i| eigenvalues[i]));
    let vectors = eigenvectors.select_columns(selected.iter());
    Ok((values, vectors))
}

impl EigenSolver for NalgebraEigen {
    fn symmetric(&self, a: ArrayView2<f64>, subset: EigenSubset) -> Result<EigenResult> {
        let n = check_square("symmetric eigenproblem", a)?;
        trace!("symmetric eigen-solve of size {} ({:?})", n, subset);

        let eigen = SymmetricEigen::try_new(symmetrize(to_dmatrix(a)), EIGEN_EPS, EIGEN_MAX_ITER)
            .ok_or_else(|| {
                FedSpcaError::SingularMatrix("symmetric eigen-solver did not converge".into())
            })?;

        let (eigenvalues, vectors) =
            sorted_subset(eigen.eigenvalues.as_slice(), &eigen.eigenvectors, subset)?;
        Ok(EigenResult {
            eigenvalues,
            eigenvectors: to_array2(vectors),
        })
    }

    fn generalized(
        &self,
        a: ArrayView2<f64>,
        b: ArrayView2<f64>,
        subset: EigenSubset,
    ) -> Result<EigenResult> {
        let n = check_square("generalized eigenproblem", a)?;
        if b.dim() != (n, n) {
            return Err(FedSpcaError::shape(
                "right-hand side of generalized eigenproblem",
                (n, n),
                b.dim(),
            ));
        }
        trace!("generalized eigen-solve of size {} ({:?})", n, subset);

        // B = L·Lᵗ, C = L⁻¹·A·L⁻ᵗ, u = L⁻ᵗ·y
        let l = to_dmatrix(cholesky_lower(b)?.view());
        let singular =
            || FedSpcaError::SingularMatrix("triangular solve against Cholesky factor failed".into());

        let a = symmetrize(to_dmatrix(a));
        let left = l.solve_lower_triangular(&a).ok_or_else(singular)?;
        let c = l
            .solve_lower_triangular(&left.transpose())
            .ok_or_else(singular)?;

        let eigen = SymmetricEigen::try_new(symmetrize(c), EIGEN_EPS, EIGEN_MAX_ITER)
            .ok_or_else(|| {
                FedSpcaError::SingularMatrix("generalized eigen-solver did not converge".into())
            })?;

        let (eigenvalues, reduced) =
            sorted_subset(eigen.eigenvalues.as_slice(), &eigen.eigenvectors, subset)?;
        let vectors = l.tr_solve_lower_triangular(&reduced).ok_or_else(singular)?;

        Ok(EigenResult {
            eigenvalues,
            eigenvectors: to_array2(vectors),
        })
    }
}

/// Lower Cholesky factor `L` with `A = L·Lᵗ`.
pub fn cholesky_lower(a: ArrayView2<f64>) -> Result<Array2<f64>> {
    check_square("Cholesky input", a)?;
    let chol = Cholesky::new(symmetrize(to_dmatrix(a))).ok_or_else(|| {
        FedSpcaError::SingularMatrix("matrix is not positive definite".into())
    })?;
    Ok(to_array2(chol.l()))
}

/// Norm of every column, handy for checking eigenvector normalisation.
pub fn column_norms(m: ArrayView2<f64>) -> Array1<f64> {
    m.map_axis(Axis(0), |col| col.dot(&col).sqrt())
}
