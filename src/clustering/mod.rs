//! # Local Compression
//!
//! Clustering and nearest-neighbour labelling a client runs on its own data
//! before the kernel variant sends anything to the server.

use crate::error::{FedSpcaError, Result};
use crate::kernel::squared_euclidean;
use crate::utils::to_dense;
use log::trace;
use ndarray::{Array2, ArrayView2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use smartcore::cluster::kmeans::{KMeans as SmartKMeans, KMeansParameters};
use smartcore::linalg::basic::matrix::DenseMatrix;

mod neighbors;
pub use neighbors::KNeighborsClassifier;
pub use neighbors::NeighborClassifier;

/// Produces representative points for a data matrix.
pub trait Clustering: Send + Sync {
    /// Returns `n_clusters` centres (one per row). Labels are offered to
    /// implementations that can use them and may be ignored.
    fn cluster_centers(
        &self,
        x: ArrayView2<f64>,
        labels: Option<ArrayView2<f64>>,
        n_clusters: usize,
        seed: u64,
    ) -> Result<Array2<f64>>;
}

/// smartcore's k-means (k-means++ seeding, Lloyd iterations) restarted
/// `n_init` times from seeds derived from the caller's seed; the run with
/// the lowest inertia wins.
///
/// Centres are the means of the final clusters. Runs that leave a cluster
/// empty are discarded.
#[derive(Debug, Clone, Copy)]
pub struct KMeans {
    n_init: usize,
    max_iter: usize,
}

impl Default for KMeans {
    fn default() -> Self {
        Self {
            n_init: 10,
            max_iter: 300,
        }
    }
}

impl KMeans {
    pub fn new(n_init: usize, max_iter: usize) -> Self {
        Self {
            n_init: n_init.max(1),
            max_iter: max_iter.max(1),
        }
    }

    /// One seeded run: `(centres, inertia)`, or `None` if a cluster came
    /// back empty.
    fn run(
        &self,
        data: &DenseMatrix<f64>,
        x: ArrayView2<f64>,
        k: usize,
        seed: u64,
    ) -> Result<Option<(Array2<f64>, f64)>> {
        let mut params = KMeansParameters::default()
            .with_k(k)
            .with_max_iter(self.max_iter);
        params.seed = Some(seed);

        let model = SmartKMeans::<f64, u32, DenseMatrix<f64>, Vec<u32>>::fit(data, params)
            .map_err(|e| FedSpcaError::backend("k-means", e))?;
        let assignment = model
            .predict(data)
            .map_err(|e| FedSpcaError::backend("k-means", e))?;

        let mut centers = Array2::<f64>::zeros((k, x.ncols()));
        let mut counts = vec![0usize; k];
        for (row, &c) in x.rows().into_iter().zip(assignment.iter()) {
            let mut target = centers.row_mut(c as usize);
            target += &row;
            counts[c as usize] += 1;
        }
        if counts.contains(&0) {
            trace!("k-means run with seed {} left a cluster empty", seed);
            return Ok(None);
        }
        for (mut center, &count) in centers.rows_mut().into_iter().zip(counts.iter()) {
            center /= count as f64;
        }

        let inertia: f64 = x
            .rows()
            .into_iter()
            .zip(assignment.iter())
            .map(|(row, &c)| squared_euclidean(row, centers.row(c as usize)))
            .sum();
        Ok(Some((centers, inertia)))
    }
}

impl Clustering for KMeans {
    fn cluster_centers(
        &self,
        x: ArrayView2<f64>,
        _labels: Option<ArrayView2<f64>>,
        n_clusters: usize,
        seed: u64,
    ) -> Result<Array2<f64>> {
        let n = x.nrows();
        if n == 0 {
            return Err(FedSpcaError::EmptyInput("no samples to cluster".into()));
        }
        if n_clusters == 0 || n_clusters > n {
            return Err(FedSpcaError::InvalidConfiguration(format!(
                "cannot form {} clusters from {} samples",
                n_clusters, n
            )));
        }
        if n_clusters == 1 {
            return x
                .mean_axis(Axis(0))
                .map(|mean| mean.insert_axis(Axis(0)))
                .ok_or_else(|| FedSpcaError::EmptyInput("no samples to cluster".into()));
        }

        let data = to_dense(x);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let seeds: Vec<u64> = (0..self.n_init).map(|_| rng.random()).collect();
        let runs = seeds
            .par_iter()
            .map(|&run_seed| self.run(&data, x, n_clusters, run_seed))
            .collect::<Result<Vec<_>>>()?;

        let mut best: Option<(Array2<f64>, f64)> = None;
        for (centers, inertia) in runs.into_iter().flatten() {
            if best.as_ref().map_or(true, |(_, b)| inertia < *b) {
                best = Some((centers, inertia));
            }
        }
        best.map(|(centers, _)| centers).ok_or_else(|| {
            FedSpcaError::InvalidConfiguration(format!(
                "every k-means run left one of the {} clusters empty",
                n_clusters
            ))
        })
    }
}
