use super::FederatedSpca;
use crate::clustering::{Clustering, NeighborClassifier};
use crate::eigen::EigenResult;
use crate::error::{FedSpcaError, Result};
use crate::kernel::Kernel;
use crate::utils::{centering_matrix, validate_partition, vstack};
use log::{debug, info};
use ndarray::{Array2, ArrayView2};
use rand::Rng;
use rayon::prelude::*;

/// Representative points sent to the server by the kernel formulation,
/// with the labels their owning clients predicted for them.
#[derive(Debug, Clone)]
pub struct CentroidSet {
    /// `(K × m)`
    pub points: Array2<f64>,
    /// `(K × c)`
    pub labels: Array2<f64>,
}

impl CentroidSet {
    pub fn len(&self) -> usize {
        self.points.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.points.nrows() == 0
    }
}

/// Splits a centroid budget across clients in proportion to their sample
/// counts. Shares are floored and the remainder goes one by one to the
/// first clients, so the counts always add up to `total`.
pub fn apportion_centroids(total: usize, client_sizes: &[usize]) -> Result<Vec<usize>> {
    let n: usize = client_sizes.iter().sum();
    if n == 0 {
        return Err(FedSpcaError::EmptyInput(
            "no samples to place centroids on".into(),
        ));
    }
    if total > n {
        return Err(FedSpcaError::InvalidConfiguration(format!(
            "centroid budget {} exceeds the {} available samples",
            total, n
        )));
    }

    let mut counts: Vec<usize> = client_sizes.iter().map(|&n_i| total * n_i / n).collect();
    let remainder = total - counts.iter().sum::<usize>();
    for count in counts.iter_mut().take(remainder) {
        *count += 1;
    }
    Ok(counts)
}

/// Client-side compression: cluster, then label the centres with a
/// neighbour vote over the client's own samples.
fn compress_client(
    clustering: &dyn Clustering,
    classifier: &dyn NeighborClassifier,
    x: ArrayView2<f64>,
    y: ArrayView2<f64>,
    n_centroids: usize,
    seed: u64,
) -> Result<(Array2<f64>, Array2<f64>)> {
    let points = clustering.cluster_centers(x, Some(y), n_centroids, seed)?;
    let labels = classifier.predict(x, y, points.view())?;
    Ok((points, labels))
}

pub(super) fn fit<R: Rng>(
    spca: &FederatedSpca,
    kernel: Kernel,
    xs: &[Array2<f64>],
    ys: &[Array2<f64>],
    rng: &mut R,
) -> Result<(EigenResult, CentroidSet)> {
    let partition = validate_partition(xs, ys)?;
    let counts = apportion_centroids(spca.centroids, &partition.client_sizes)?;
    debug!(
        "centroid budget {} apportioned as {:?}",
        spca.centroids, counts
    );
    let seeds: Vec<u64> = counts.iter().map(|_| rng.random()).collect();

    let clustering = &*spca.clustering;
    let classifier = &*spca.classifier;
    let summaries = xs
        .par_iter()
        .zip(ys.par_iter())
        .zip(counts.par_iter().zip(seeds.par_iter()))
        .filter(|(_, (count, _))| **count > 0)
        .map(|((x, y), (&count, &seed))| {
            compress_client(clustering, classifier, x.view(), y.view(), count, seed)
        })
        .collect::<Result<Vec<_>>>()?;

    let (points, labels): (Vec<Array2<f64>>, Vec<Array2<f64>>) = summaries.into_iter().unzip();
    let centroids = CentroidSet {
        points: vstack(&points)?,
        labels: vstack(&labels)?,
    };
    let k = centroids.len();
    info!(
        "server received {} centroids from {} clients",
        k,
        points.len()
    );

    // K·H·(L + I)·H·K, written as (HK)ᵗ·(L + I)·(HK) since K and H are symmetric
    let support = kernel.gram(centroids.points.view())?;
    let hk = centering_matrix(k).dot(&support);
    let mut bracket = spca.label_kernel.gram(centroids.labels.view())?;
    bracket += &Array2::eye(k);
    let q = hk.t().dot(&bracket).dot(&hk);

    let b = &support + &(Array2::<f64>::eye(k) * spca.eps);
    let eigen = spca.solver.generalized(q.view(), b.view(), spca.subset())?;
    Ok((eigen, centroids))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masking::MaskSet;
    use crate::spca::tests::{init_logging, labelled_clients};
    use crate::spca::{FederatedSpcaBuilder, Spca};
    use crate::utils::max_abs_diff;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_apportionment_adds_up() {
        let counts = apportion_centroids(50, &[10, 20, 33]).unwrap();
        assert_eq!(counts, vec![8, 16, 26]);
        assert_eq!(counts.iter().sum::<usize>(), 50);

        assert_eq!(apportion_centroids(2, &[1, 1, 10]).unwrap(), vec![1, 0, 1]);
        assert_eq!(apportion_centroids(12, &[4, 8]).unwrap(), vec![4, 8]);
        for total in 1..=30 {
            let counts = apportion_centroids(total, &[7, 3, 11, 9]).unwrap();
            assert_eq!(counts.iter().sum::<usize>(), total);
        }
    }

    #[test]
    fn test_apportionment_rejects_impossible_budgets() {
        assert!(matches!(
            apportion_centroids(4, &[1, 2]),
            Err(FedSpcaError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            apportion_centroids(1, &[]),
            Err(FedSpcaError::EmptyInput(_))
        ));
    }

    #[test]
    fn test_linear_kernel_matches_standard_for_one_client() {
        init_logging();
        // every sample becomes its own centroid and labels itself
        let (xs, ys) = labelled_clients(&[6], 8, 31);

        let mut kernel = FederatedSpcaBuilder::new()
            .feature_kernel(Kernel::Linear)
            .centroids(6)
            .n_neighbors(1)
            .n_components(2)
            .build()
            .unwrap();
        let got = kernel.fit(&xs, &ys, None, None).unwrap().eigen().clone();

        let mut rng = StdRng::seed_from_u64(32);
        let masks = MaskSet::generate(8, &[6], &mut rng);
        let mut standard = FederatedSpcaBuilder::new()
            .n_components(2)
            .secure_aggregation(false)
            .build()
            .unwrap();
        let expected = standard
            .fit(&xs, &ys, Some(&masks.p), Some(masks.qs.as_slice()))
            .unwrap()
            .eigen()
            .clone();

        for i in 0..2 {
            assert_relative_eq!(got.eigenvalues[i], expected.eigenvalues[i], max_relative = 1e-6);
        }
    }

    #[test]
    fn test_rbf_label_kernel_matches_centralized_for_one_client() {
        let (xs, ys) = labelled_clients(&[6], 8, 35);

        let mut kernel = FederatedSpcaBuilder::new()
            .feature_kernel(Kernel::Linear)
            .label_kernel(Kernel::rbf(0.5))
            .centroids(6)
            .n_neighbors(1)
            .n_components(2)
            .build()
            .unwrap();
        let model = kernel.fit(&xs, &ys, None, None).unwrap();
        assert_eq!(model.centroids().unwrap().labels.dim(), (6, 2));

        let central = Spca::new(Some(2))
            .label_kernel(Kernel::rbf(0.5))
            .fit(xs[0].view(), ys[0].view())
            .unwrap();
        for i in 0..2 {
            assert_relative_eq!(
                model.eigen().eigenvalues[i],
                central.eigenvalues[i],
                max_relative = 1e-6
            );
        }
    }

    #[test]
    fn test_rbf_fit_and_transform() {
        let (xs, ys) = labelled_clients(&[30, 20], 3, 33);

        let mut spca = FederatedSpcaBuilder::new()
            .feature_kernel(Kernel::Rbf { gamma: None })
            .centroids(10)
            .n_components(3)
            .build()
            .unwrap();
        let model = spca.fit(&xs, &ys, None, None).unwrap();

        let centroids = model.centroids().unwrap();
        assert_eq!(centroids.len(), 10);
        assert_eq!(centroids.labels.dim(), (10, 2));
        let eigen = model.eigen();
        assert_eq!(eigen.eigenvectors.dim(), (10, 3));
        assert!(eigen.eigenvalues[0] <= eigen.eigenvalues[1]);
        assert!(eigen.eigenvalues[1] <= eigen.eigenvalues[2]);

        // coefficients are orthonormal under K + eps·I
        let support = Kernel::Rbf { gamma: None }
            .gram(centroids.points.view())
            .unwrap()
            + Array2::<f64>::eye(10) * 1e-10;
        let gram = eigen.eigenvectors.t().dot(&support).dot(&eigen.eigenvectors);
        assert!(max_abs_diff(gram.view(), Array2::<f64>::eye(3).view()) < 1e-6);

        let projected = spca.transform(xs[0].view(), None).unwrap();
        assert_eq!(projected.dim(), (30, 3));
    }

    #[test]
    fn test_budget_larger_than_data_fails() {
        let (xs, ys) = labelled_clients(&[4, 3], 2, 34);
        let mut spca = FederatedSpcaBuilder::new()
            .feature_kernel(Kernel::Linear)
            .centroids(8)
            .build()
            .unwrap();
        assert!(spca.fit(&xs, &ys, None, None).is_err());
        assert!(!spca.is_fitted());
    }
}
