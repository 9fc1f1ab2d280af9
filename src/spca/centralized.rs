use crate::eigen::{EigenResult, EigenSolver, EigenSubset, NalgebraEigen};
use crate::error::{FedSpcaError, Result};
use crate::kernel::Kernel;
use crate::utils::center_rows;
use ndarray::{Array2, ArrayView2, Axis};

/// Supervised PCA on data held in one place.
///
/// Solves `Xcᵗ·(L + I)·Xc` with `Xc` the column-centred data and `L` the
/// label kernel. The federated formulations reproduce this result.
#[derive(Debug, Clone, Copy, Default)]
pub struct Spca {
    n_components: Option<usize>,
    label_kernel: Kernel,
}

impl Spca {
    pub fn new(n_components: Option<usize>) -> Self {
        Self {
            n_components,
            label_kernel: Kernel::Linear,
        }
    }

    pub fn label_kernel(mut self, kernel: Kernel) -> Self {
        self.label_kernel = kernel;
        self
    }

    pub fn fit(&self, x: ArrayView2<f64>, y: ArrayView2<f64>) -> Result<EigenResult> {
        if x.nrows() == 0 {
            return Err(FedSpcaError::EmptyInput("no samples".into()));
        }
        if y.nrows() != x.nrows() {
            return Err(FedSpcaError::shape(
                "labels",
                (x.nrows(), y.ncols()),
                y.dim(),
            ));
        }

        let mean = x
            .mean_axis(Axis(0))
            .ok_or_else(|| FedSpcaError::EmptyInput("no samples".into()))?;
        let centered = center_rows(x, &mean);

        let mut bracket = self.label_kernel.gram(y)?;
        bracket += &Array2::eye(x.nrows());
        let q = centered.t().dot(&bracket).dot(&centered);

        NalgebraEigen.symmetric(q.view(), EigenSubset::from_components(self.n_components))
    }
}
