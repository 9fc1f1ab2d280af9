use crate::error::{FedSpcaError, Result};
use crate::utils::to_dense;
use log::debug;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::metrics::distance::manhattan::Manhattan;
use smartcore::metrics::distance::Distances;
use smartcore::neighbors::knn_classifier::{KNNClassifier, KNNClassifierParameters};
use smartcore::neighbors::KNNWeightFunction;

/// Labels query points from a labelled training set.
pub trait NeighborClassifier: Send + Sync {
    /// Returns one label row per query row, with the column count of
    /// `train_y`.
    fn predict(
        &self,
        train_x: ArrayView2<f64>,
        train_y: ArrayView2<f64>,
        query: ArrayView2<f64>,
    ) -> Result<Array2<f64>>;
}

/// Vote among the `n_neighbors` closest training rows under the Manhattan
/// distance, backed by smartcore's KNN classifier.
///
/// Multi-column labels are voted column by column. smartcore needs at least
/// two neighbours, so a single neighbour is run as two weighted by inverse
/// distance, where the nearer one always carries the vote.
#[derive(Debug, Clone, Copy)]
pub struct KNeighborsClassifier {
    n_neighbors: usize,
}

impl Default for KNeighborsClassifier {
    fn default() -> Self {
        Self { n_neighbors: 5 }
    }
}

impl KNeighborsClassifier {
    pub fn new(n_neighbors: usize) -> Result<Self> {
        if n_neighbors == 0 {
            return Err(FedSpcaError::InvalidConfiguration(
                "n_neighbors must be at least 1".into(),
            ));
        }
        Ok(Self { n_neighbors })
    }

    pub fn n_neighbors(&self) -> usize {
        self.n_neighbors
    }

    /// Votes one label column. Distinct values are encoded as class indices
    /// for smartcore and decoded afterwards.
    fn predict_column(
        data: &DenseMatrix<f64>,
        query: &DenseMatrix<f64>,
        n_query: usize,
        column: ArrayView1<f64>,
        k: usize,
    ) -> Result<Vec<f64>> {
        let mut classes: Vec<f64> = column.to_vec();
        classes.sort_by(|a, b| a.total_cmp(b));
        classes.dedup();
        if let [only] = classes.as_slice() {
            return Ok(vec![*only; n_query]);
        }
        let encoded: Vec<i32> = column
            .iter()
            .map(|v| classes.partition_point(|c| c.total_cmp(v).is_lt()) as i32)
            .collect();

        let (k, weight) = if k == 1 {
            (2, KNNWeightFunction::Distance)
        } else {
            (k, KNNWeightFunction::Uniform)
        };
        let params = KNNClassifierParameters::default()
            .with_k(k)
            .with_weight(weight)
            .with_distance(Distances::manhattan());

        let model =
            KNNClassifier::<f64, i32, DenseMatrix<f64>, Vec<i32>, Manhattan<f64>>::fit(data, &encoded, params)
                .map_err(|e| FedSpcaError::backend("nearest-neighbour vote", e))?;
        let predicted = model
            .predict(query)
            .map_err(|e| FedSpcaError::backend("nearest-neighbour vote", e))?;

        predicted
            .into_iter()
            .map(|c| {
                classes.get(c as usize).copied().ok_or_else(|| {
                    FedSpcaError::backend("nearest-neighbour vote", format!("unknown class index {}", c))
                })
            })
            .collect()
    }
}

impl NeighborClassifier for KNeighborsClassifier {
    fn predict(
        &self,
        train_x: ArrayView2<f64>,
        train_y: ArrayView2<f64>,
        query: ArrayView2<f64>,
    ) -> Result<Array2<f64>> {
        if train_x.nrows() == 0 {
            return Err(FedSpcaError::EmptyInput("no training samples".into()));
        }
        if train_y.nrows() != train_x.nrows() {
            return Err(FedSpcaError::shape(
                "neighbour labels",
                (train_x.nrows(), train_y.ncols()),
                train_y.dim(),
            ));
        }
        if query.ncols() != train_x.ncols() {
            return Err(FedSpcaError::shape(
                "neighbour query",
                (query.nrows(), train_x.ncols()),
                query.dim(),
            ));
        }

        let mut predicted = Array2::zeros((query.nrows(), train_y.ncols()));
        if train_x.nrows() == 1 {
            for mut row in predicted.rows_mut() {
                row.assign(&train_y.row(0));
            }
            return Ok(predicted);
        }

        let k = self.n_neighbors.min(train_x.nrows());
        if k < self.n_neighbors {
            debug!(
                "only {} training samples, voting with {} neighbours instead of {}",
                train_x.nrows(),
                k,
                self.n_neighbors
            );
        }

        let data = to_dense(train_x);
        let points = to_dense(query);
        let columns = train_y
            .axis_iter(Axis(1))
            .into_par_iter()
            .map(|column| Self::predict_column(&data, &points, query.nrows(), column, k))
            .collect::<Result<Vec<_>>>()?;

        for (mut out, labels) in predicted.columns_mut().into_iter().zip(columns) {
            for (slot, label) in out.iter_mut().zip(labels) {
                *slot = label;
            }
        }
        Ok(predicted)
    }
}
