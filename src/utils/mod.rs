use crate::error::{FedSpcaError, Result};
use nalgebra::DMatrix;
use ndarray::{concatenate, Array1, Array2, ArrayView2, Axis};
use nshare::{IntoNalgebra, IntoNdarray2};
use smartcore::linalg::basic::arrays::{Array2 as DenseArray2, MutArray};
use smartcore::linalg::basic::matrix::DenseMatrix;

/// Copies an ndarray view into an owned nalgebra matrix.
pub(crate) fn to_dmatrix(a: ArrayView2<f64>) -> DMatrix<f64> {
    a.into_nalgebra().into_owned()
}

pub(crate) fn to_array2(m: DMatrix<f64>) -> Array2<f64> {
    m.into_ndarray2().into_owned()
}

pub(crate) fn to_dense(x: ArrayView2<f64>) -> DenseMatrix<f64> {
    let mut dense = <DenseMatrix<f64> as DenseArray2<f64>>::zeros(x.nrows(), x.ncols());
    for ((i, j), &v) in x.indexed_iter() {
        dense.set((i, j), v);
    }
    dense
}

/// `H = I - (1/n)·1·1ᵗ`
pub fn centering_matrix(n: usize) -> Array2<f64> {
    let inv = 1.0 / n as f64;
    Array2::from_shape_fn((n, n), |(i, j)| if i == j { 1.0 - inv } else { -inv })
}

/// Shape summary of a horizontally partitioned data set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub n_features: usize,
    pub n_labels: usize,
    pub client_sizes: Vec<usize>,
}

impl Partition {
    pub fn n_samples(&self) -> usize {
        self.client_sizes.iter().sum()
    }

    pub fn n_clients(&self) -> usize {
        self.client_sizes.len()
    }

    /// Row offset of every client inside the row-stacked data set.
    pub fn offsets(&self) -> Vec<usize> {
        self.client_sizes
            .iter()
            .scan(0, |acc, &n_i| {
                let start = *acc;
                *acc += n_i;
                Some(start)
            })
            .collect()
    }
}

/// Checks that every client shares the feature and label dimension and that
/// features and labels are row aligned.
pub fn validate_partition(xs: &[Array2<f64>], ys: &[Array2<f64>]) -> Result<Partition> {
    if xs.is_empty() {
        return Err(FedSpcaError::EmptyInput("no clients supplied".into()));
    }
    if xs.len() != ys.len() {
        return Err(FedSpcaError::shape(
            "client count of labels",
            (xs.len(), 1),
            (ys.len(), 1),
        ));
    }

    let n_features = xs[0].ncols();
    let n_labels = ys[0].ncols();
    let mut client_sizes = Vec::with_capacity(xs.len());

    for (i, (x, y)) in xs.iter().zip(ys).enumerate() {
        if x.nrows() == 0 {
            return Err(FedSpcaError::EmptyInput(format!("client {} has no samples", i)));
        }
        if x.ncols() != n_features {
            return Err(FedSpcaError::shape(
                format!("features of client {}", i),
                (x.nrows(), n_features),
                x.dim(),
            ));
        }
        if y.dim() != (x.nrows(), n_labels) {
            return Err(FedSpcaError::shape(
                format!("labels of client {}", i),
                (x.nrows(), n_labels),
                y.dim(),
            ));
        }
        client_sizes.push(x.nrows());
    }

    if n_features == 0 {
        return Err(FedSpcaError::EmptyInput("feature dimension is zero".into()));
    }

    Ok(Partition {
        n_features,
        n_labels,
        client_sizes,
    })
}

/// Row-stacks a sequence of matrices that share their column count.
pub fn vstack(parts: &[Array2<f64>]) -> Result<Array2<f64>> {
    if parts.is_empty() {
        return Err(FedSpcaError::EmptyInput("nothing to stack".into()));
    }
    let views: Vec<ArrayView2<f64>> = parts.iter().map(|p| p.view()).collect();
    concatenate(Axis(0), &views).map_err(|_| {
        let ncols = parts[0].ncols();
        let bad = parts
            .iter()
            .find(|p| p.ncols() != ncols)
            .map(|p| p.dim())
            .unwrap_or((0, 0));
        FedSpcaError::shape("row stacking", (bad.0, ncols), bad)
    })
}

/// Builds an (n × n_classes) one-hot label matrix.
pub fn one_hot(labels: &[usize], n_classes: usize) -> Result<Array2<f64>> {
    if labels.is_empty() {
        return Err(FedSpcaError::EmptyInput("no labels to encode".into()));
    }
    let mut encoded = Array2::zeros((labels.len(), n_classes));
    for (row, &label) in labels.iter().enumerate() {
        if label >= n_classes {
            return Err(FedSpcaError::InvalidConfiguration(format!(
                "label {} outside of {} classes",
                label, n_classes
            )));
        }
        encoded[[row, label]] = 1.0;
    }
    Ok(encoded)
}

/// Subtracts `mean` from every row of an owned copy of `x`.
pub fn center_rows(x: ArrayView2<f64>, mean: &Array1<f64>) -> Array2<f64> {
    let mut centered = x.to_owned();
    centered
        .axis_iter_mut(Axis(0))
        .for_each(|mut row| row -= mean);
    centered
}

/// Largest absolute element-wise difference between two same-shaped matrices.
pub fn max_abs_diff(a: ArrayView2<f64>, b: ArrayView2<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .fold(0.0_f64, |acc, (x, y)| acc.max((x - y).abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_centering_matrix_removes_column_means() {
        let h = centering_matrix(4);
        let x = array![[1.0, 2.0], [3.0, 4.0], [5.0, 0.0], [-1.0, 2.0]];
        let centered = h.dot(&x);

        for col in centered.columns() {
            assert_abs_diff_eq!(col.sum(), 0.0, epsilon = 1e-12);
        }
        assert!(max_abs_diff(h.dot(&h).view(), h.view()) < 1e-12);
    }

    #[test]
    fn test_validate_partition() {
        let xs = vec![Array2::<f64>::zeros((3, 4)), Array2::zeros((5, 4))];
        let ys = vec![Array2::<f64>::zeros((3, 2)), Array2::zeros((5, 2))];
        let partition = validate_partition(&xs, &ys).unwrap();

        assert_eq!(partition.n_features, 4);
        assert_eq!(partition.n_labels, 2);
        assert_eq!(partition.n_samples(), 8);
        assert_eq!(partition.offsets(), vec![0, 3]);
    }

    #[test]
    fn test_validate_partition_errors() {
        let ys = vec![Array2::<f64>::zeros((3, 2))];
        assert!(matches!(
            validate_partition(&[], &[]),
            Err(FedSpcaError::EmptyInput(_))
        ));

        let xs = vec![Array2::<f64>::zeros((3, 4)), Array2::zeros((3, 5))];
        let ys2 = vec![Array2::<f64>::zeros((3, 2)), Array2::zeros((3, 2))];
        assert!(matches!(
            validate_partition(&xs, &ys2),
            Err(FedSpcaError::ShapeMismatch { .. })
        ));

        let xs = vec![Array2::<f64>::zeros((4, 4))];
        assert!(matches!(
            validate_partition(&xs, &ys),
            Err(FedSpcaError::ShapeMismatch { .. })
        ));

        let xs = vec![Array2::<f64>::zeros((0, 4))];
        let ys = vec![Array2::<f64>::zeros((0, 2))];
        assert!(matches!(
            validate_partition(&xs, &ys),
            Err(FedSpcaError::EmptyInput(_))
        ));
    }

    #[test]
    fn test_one_hot() {
        let encoded = one_hot(&[0, 2, 1], 3).unwrap();
        assert_eq!(encoded, array![[1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]]);
        assert!(one_hot(&[3], 3).is_err());
    }

    #[test]
    fn test_nalgebra_round_trip_keeps_layout() {
        let a = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let m = to_dmatrix(a.view());
        assert_eq!(m[(1, 2)], 6.0);
        assert_eq!(to_array2(m), a);

        let t = to_dmatrix(a.t());
        assert_eq!(t.nrows(), 3);
        assert_eq!(t[(2, 1)], 6.0);
    }

    #[test]
    fn test_dense_matrix_keeps_layout() {
        use smartcore::linalg::basic::arrays::Array;

        let a = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let dense = to_dense(a.t());
        assert_eq!(dense.shape(), (3, 2));
        assert_eq!(*dense.get((2, 1)), 6.0);
        assert_eq!(*dense.get((0, 1)), 4.0);
    }

    #[test]
    fn test_center_rows_does_not_touch_input() {
        let x = array![[1.0, 2.0], [3.0, 4.0]];
        let mean = array![2.0, 3.0];
        let centered = center_rows(x.view(), &mean);
        assert_eq!(centered, array![[-1.0, -1.0], [1.0, 1.0]]);
        assert_eq!(x, array![[1.0, 2.0], [3.0, 4.0]]);
    }
}
