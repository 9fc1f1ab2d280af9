//! # Federated Supervised PCA
//!
//! Supervised PCA (Barshan et al., 2011) over data horizontally partitioned
//! across clients. Three formulations are available:
//!
//! - **Standard**: masked covariance-like aggregation, an `m × m` eigenproblem.
//!   Clients mask features with the shared `P` and samples with their own
//!   private `Q[i]`.
//! - **Dual**: masked Gram-like aggregation, an `n × n` eigenproblem, for
//!   `m ≫ n`. Only the shared `P` masks the data; this is a weaker privacy
//!   mode than the standard formulation and relies on the server not
//!   colluding with any holder of `P`.
//! - **Kernel**: every client compresses its data into centroids which are
//!   sent in the clear; the server solves a generalized eigenproblem over
//!   a kernel of the centroids.
//!
//! Every fit is a single synchronous call: local computation, masking,
//! aggregation, server-side eigen-decomposition. Unmasking the standard and
//! dual eigenvectors is left to a holder of `P`.

use crate::aggregation::Aggregation;
use crate::clustering::{Clustering, KMeans, KNeighborsClassifier, NeighborClassifier};
use crate::eigen::{EigenResult, EigenSolver, EigenSubset, NalgebraEigen};
use crate::error::{FedSpcaError, Result};
use crate::kernel::Kernel;
use crate::masking::unmask;
use crate::utils::center_rows;
use log::info;
use ndarray::{Array1, Array2, ArrayView2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;

mod centralized;
mod dual;
mod kernel;
mod standard;

pub use centralized::Spca;
pub use kernel::apportion_centroids;
pub use kernel::CentroidSet;

/// Which eigenproblem the federation solves.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Formulation {
    #[default]
    Standard,
    Dual,
    Kernel(Kernel),
}

/// Result of a fit.
#[derive(Debug, Clone)]
pub enum SpcaModel {
    /// Standard and dual formulations. Eigenvectors are still masked by `P`.
    /// `mean` is the global feature mean when the formulation computed one.
    Linear {
        eigen: EigenResult,
        mean: Option<Array1<f64>>,
    },
    /// Kernel formulation. Eigenvectors are coefficients over the centroids.
    Kernel {
        eigen: EigenResult,
        centroids: CentroidSet,
        kernel: Kernel,
    },
}

impl SpcaModel {
    pub fn eigen(&self) -> &EigenResult {
        match self {
            SpcaModel::Linear { eigen, .. } | SpcaModel::Kernel { eigen, .. } => eigen,
        }
    }

    pub fn centroids(&self) -> Option<&CentroidSet> {
        match self {
            SpcaModel::Kernel { centroids, .. } => Some(centroids),
            SpcaModel::Linear { .. } => None,
        }
    }

    /// Eigenvectors in the original feature basis. Linear models need the
    /// shared mask `P`; kernel models are returned as they are.
    pub fn unmasked_eigenvectors(&self, p: Option<ArrayView2<f64>>) -> Result<Array2<f64>> {
        match (self, p) {
            (SpcaModel::Linear { eigen, .. }, Some(p)) => unmask(eigen.eigenvectors.view(), p),
            (SpcaModel::Linear { .. }, None) => Err(FedSpcaError::InvalidConfiguration(
                "eigenvectors are masked; the shared mask P is needed to project".into(),
            )),
            (SpcaModel::Kernel { eigen, .. }, _) => Ok(eigen.eigenvectors.clone()),
        }
    }

    /// Projects new samples onto the fitted components.
    ///
    /// Linear models are unmasked with `P`, centred with the global mean when
    /// one was computed, and projected as `X·U`. Kernel models evaluate the
    /// kernel against the centroids: `K(X, centroids)·U`.
    pub fn transform(&self, x: ArrayView2<f64>, p: Option<ArrayView2<f64>>) -> Result<Array2<f64>> {
        match self {
            SpcaModel::Linear { eigen, mean } => {
                let unmasked = EigenResult {
                    eigenvalues: eigen.eigenvalues.clone(),
                    eigenvectors: self.unmasked_eigenvectors(p)?,
                };
                match mean {
                    Some(mean) if mean.len() != x.ncols() => Err(FedSpcaError::shape(
                        "data to project",
                        (x.nrows(), mean.len()),
                        x.dim(),
                    )),
                    Some(mean) => unmasked.project(center_rows(x, mean).view()),
                    None => unmasked.project(x),
                }
            }
            SpcaModel::Kernel {
                eigen,
                centroids,
                kernel,
            } => {
                let k = kernel.pairwise(x, centroids.points.view())?;
                Ok(k.dot(&eigen.eigenvectors))
            }
        }
    }
}

/// Builder for [`FederatedSpca`].
///
/// Defaults: all components, standard formulation, linear label kernel,
/// secure aggregation, 50 centroids, 5 neighbours, `eps = 1e-10`, masks
/// validated, seed 42.
pub struct FederatedSpcaBuilder {
    n_components: Option<usize>,
    formulation: Formulation,
    label_kernel: Kernel,
    aggregation: Aggregation,
    centroids: usize,
    n_neighbors: usize,
    eps: f64,
    validate_masks: bool,
    random_seed: u64,
    solver: Arc<dyn EigenSolver>,
    clustering: Arc<dyn Clustering>,
}

impl Default for FederatedSpcaBuilder {
    fn default() -> Self {
        Self {
            n_components: None,
            formulation: Formulation::default(),
            label_kernel: Kernel::Linear,
            aggregation: Aggregation::Secure,
            centroids: 50,
            n_neighbors: 5,
            eps: 1e-10,
            validate_masks: true,
            random_seed: 42,
            solver: Arc::new(NalgebraEigen),
            clustering: Arc::new(KMeans::default()),
        }
    }
}

impl FederatedSpcaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of top components to keep. Must not exceed the size of the
    /// eigenproblem of the chosen formulation.
    pub fn n_components(mut self, n_components: usize) -> Self {
        self.n_components = Some(n_components);
        self
    }

    pub fn formulation(mut self, formulation: Formulation) -> Self {
        self.formulation = formulation;
        self
    }

    /// Shortcut for `formulation(Formulation::Kernel(kernel))`.
    pub fn feature_kernel(mut self, kernel: Kernel) -> Self {
        self.formulation = Formulation::Kernel(kernel);
        self
    }

    /// Kernel applied to labels by the dual and kernel formulations.
    pub fn label_kernel(mut self, kernel: Kernel) -> Self {
        self.label_kernel = kernel;
        self
    }

    pub fn aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn secure_aggregation(mut self, secure: bool) -> Self {
        self.aggregation = if secure {
            Aggregation::Secure
        } else {
            Aggregation::Plain
        };
        self
    }

    /// Total centroid budget shared by all clients (kernel formulation).
    pub fn centroids(mut self, centroids: usize) -> Self {
        self.centroids = centroids;
        self
    }

    /// Neighbours voting on each centroid label (kernel formulation).
    pub fn n_neighbors(mut self, n_neighbors: usize) -> Self {
        self.n_neighbors = n_neighbors;
        self
    }

    /// Diagonal regulariser added to the centroid kernel matrix, and the
    /// eigenvalue floor of the dual formulation.
    pub fn eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    pub fn validate_masks(mut self, validate: bool) -> Self {
        self.validate_masks = validate;
        self
    }

    pub fn random_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    pub fn eigen_solver(mut self, solver: impl EigenSolver + 'static) -> Self {
        self.solver = Arc::new(solver);
        self
    }

    pub fn clustering(mut self, clustering: impl Clustering + 'static) -> Self {
        self.clustering = Arc::new(clustering);
        self
    }

    pub fn build(self) -> Result<FederatedSpca> {
        if self.n_components == Some(0) {
            return Err(FedSpcaError::InvalidConfiguration(
                "n_components must be at least 1".into(),
            ));
        }
        if !self.eps.is_finite() || self.eps < 0.0 {
            return Err(FedSpcaError::InvalidConfiguration(format!(
                "eps must be finite and non-negative, got {}",
                self.eps
            )));
        }
        self.label_kernel.validate()?;

        match self.formulation {
            Formulation::Standard if self.label_kernel != Kernel::Linear => {
                return Err(FedSpcaError::InvalidConfiguration(format!(
                    "the standard formulation only supports a linear label kernel, got {}",
                    self.label_kernel.name()
                )));
            }
            Formulation::Kernel(kernel) => {
                kernel.validate()?;
                if self.centroids == 0 {
                    return Err(FedSpcaError::InvalidConfiguration(
                        "centroid budget must be at least 1".into(),
                    ));
                }
            }
            _ => {}
        }

        let classifier = KNeighborsClassifier::new(self.n_neighbors)?;

        Ok(FederatedSpca {
            n_components: self.n_components,
            formulation: self.formulation,
            label_kernel: self.label_kernel,
            aggregation: self.aggregation,
            centroids: self.centroids,
            eps: self.eps,
            validate_masks: self.validate_masks,
            random_seed: self.random_seed,
            solver: self.solver,
            clustering: self.clustering,
            classifier: Arc::new(classifier),
            model: None,
        })
    }
}

/// Federated supervised PCA estimator.
///
/// UNFIT until [`FederatedSpca::fit`] succeeds; a later fit discards the
/// previous model before it starts, so a failed fit leaves it UNFIT.
pub struct FederatedSpca {
    n_components: Option<usize>,
    formulation: Formulation,
    label_kernel: Kernel,
    aggregation: Aggregation,
    centroids: usize,
    eps: f64,
    validate_masks: bool,
    random_seed: u64,
    solver: Arc<dyn EigenSolver>,
    clustering: Arc<dyn Clustering>,
    classifier: Arc<dyn NeighborClassifier>,
    model: Option<SpcaModel>,
}

impl FederatedSpca {
    /// Fits with a generator seeded from the configured `random_seed`.
    ///
    /// # Parameters
    /// - `xs`: one `(n_i × m)` feature matrix per client
    /// - `ys`: one `(n_i × c)` label matrix per client, row aligned with `xs`
    /// - `p`: shared `(m × m)` orthogonal feature mask (standard and dual)
    /// - `qs`: one private `(n_i × n)` sample mask per client (standard), the
    ///   client's rows of an orthogonal `(n × n)` matrix
    ///
    /// Inputs are never modified.
    pub fn fit(
        &mut self,
        xs: &[Array2<f64>],
        ys: &[Array2<f64>],
        p: Option<&Array2<f64>>,
        qs: Option<&[Array2<f64>]>,
    ) -> Result<&SpcaModel> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.random_seed);
        self.fit_with_rng(xs, ys, p, qs, &mut rng)
    }

    /// Fits with an explicit randomness source for perturbations and
    /// clustering seeds.
    pub fn fit_with_rng<R: Rng>(
        &mut self,
        xs: &[Array2<f64>],
        ys: &[Array2<f64>],
        p: Option<&Array2<f64>>,
        qs: Option<&[Array2<f64>]>,
        rng: &mut R,
    ) -> Result<&SpcaModel> {
        self.model = None;
        info!(
            "fitting federated SPCA: {:?} formulation, {} clients, {:?} aggregation",
            self.formulation,
            xs.len(),
            self.aggregation
        );

        let model = match self.formulation {
            Formulation::Standard => {
                let p = p.ok_or_else(|| missing_mask("standard", "P"))?;
                let qs = qs.ok_or_else(|| missing_mask("standard", "Q"))?;
                let (eigen, mean) = standard::fit(self, xs, ys, p.view(), qs, rng)?;
                SpcaModel::Linear {
                    eigen,
                    mean: Some(mean),
                }
            }
            Formulation::Dual => {
                let p = p.ok_or_else(|| missing_mask("dual", "P"))?;
                let (eigen, mean) = dual::fit(self, xs, ys, p.view(), rng)?;
                SpcaModel::Linear {
                    eigen,
                    mean: Some(mean),
                }
            }
            Formulation::Kernel(feature_kernel) => {
                let (eigen, centroids) = kernel::fit(self, feature_kernel, xs, ys, rng)?;
                SpcaModel::Kernel {
                    eigen,
                    centroids,
                    kernel: feature_kernel,
                }
            }
        };

        info!(
            "federated SPCA fitted with {} components",
            model.eigen().n_components()
        );
        let model: &SpcaModel = self.model.insert(model);
        Ok(model)
    }

    pub fn model(&self) -> Option<&SpcaModel> {
        self.model.as_ref()
    }

    pub fn is_fitted(&self) -> bool {
        self.model.is_some()
    }

    pub fn eigenvalues(&self) -> Option<&Array1<f64>> {
        self.model.as_ref().map(|m| &m.eigen().eigenvalues)
    }

    pub fn eigenvectors(&self) -> Option<&Array2<f64>> {
        self.model.as_ref().map(|m| &m.eigen().eigenvectors)
    }

    pub fn centroids(&self) -> Option<&CentroidSet> {
        self.model.as_ref().and_then(|m| m.centroids())
    }

    pub fn transform(&self, x: ArrayView2<f64>, p: Option<ArrayView2<f64>>) -> Result<Array2<f64>> {
        self.model
            .as_ref()
            .ok_or(FedSpcaError::NotFitted)?
            .transform(x, p)
    }

    pub fn formulation(&self) -> Formulation {
        self.formulation
    }

    fn subset(&self) -> EigenSubset {
        EigenSubset::from_components(self.n_components)
    }
}

fn missing_mask(formulation: &str, mask: &str) -> FedSpcaError {
    FedSpcaError::InvalidConfiguration(format!(
        "the {} formulation needs the {} mask",
        formulation, mask
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masking::MaskSet;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;

    pub(crate) fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    pub(crate) fn labelled_clients(sizes: &[usize], m: usize, seed: u64) -> (Vec<Array2<f64>>, Vec<Array2<f64>>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        for &n_i in sizes {
            let mut x = Array2::<f64>::zeros((n_i, m));
            let mut y = Array2::<f64>::zeros((n_i, 2));
            for i in 0..n_i {
                let class = rng.random_range(0..2);
                y[[i, class]] = 1.0;
                for j in 0..m {
                    let signal = if j == 0 { 3.0 * class as f64 } else { 0.0 };
                    x[[i, j]] = signal + rng.random_range(-1.0..1.0) * (j + 1) as f64;
                }
            }
            xs.push(x);
            ys.push(y);
        }
        (xs, ys)
    }

    #[test]
    fn test_builder_validation() {
        assert!(FederatedSpcaBuilder::new().n_components(0).build().is_err());
        assert!(FederatedSpcaBuilder::new().eps(-1.0).build().is_err());
        assert!(FederatedSpcaBuilder::new().n_neighbors(0).build().is_err());
        assert!(FederatedSpcaBuilder::new()
            .label_kernel(Kernel::rbf(1.0))
            .build()
            .is_err());
        assert!(FederatedSpcaBuilder::new()
            .feature_kernel(Kernel::rbf(-2.0))
            .build()
            .is_err());
        assert!(FederatedSpcaBuilder::new()
            .feature_kernel(Kernel::Linear)
            .centroids(0)
            .build()
            .is_err());
        assert!(FederatedSpcaBuilder::new()
            .formulation(Formulation::Dual)
            .label_kernel(Kernel::rbf(1.0))
            .build()
            .is_ok());
    }

    #[test]
    fn test_unfit_state() {
        let spca = FederatedSpcaBuilder::new().build().unwrap();
        assert!(!spca.is_fitted());
        assert!(spca.eigenvalues().is_none());
        assert!(matches!(
            spca.transform(Array2::<f64>::zeros((1, 2)).view(), None),
            Err(FedSpcaError::NotFitted)
        ));
    }

    #[test]
    fn test_missing_masks_are_reported() {
        let (xs, ys) = labelled_clients(&[10], 3, 1);
        let mut spca = FederatedSpcaBuilder::new().build().unwrap();
        assert!(matches!(
            spca.fit(&xs, &ys, None, None),
            Err(FedSpcaError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_failed_refit_discards_previous_model() {
        init_logging();
        let (xs, ys) = labelled_clients(&[12, 8], 3, 2);
        let mut rng = StdRng::seed_from_u64(3);
        let masks = MaskSet::generate(3, &[12, 8], &mut rng);

        let mut spca = FederatedSpcaBuilder::new().n_components(2).build().unwrap();
        spca.fit(&xs, &ys, Some(&masks.p), Some(masks.qs.as_slice())).unwrap();
        assert!(spca.is_fitted());

        let wrong_p = Array2::<f64>::eye(4);
        assert!(spca.fit(&xs, &ys, Some(&wrong_p), Some(masks.qs.as_slice())).is_err());
        assert!(!spca.is_fitted());
    }

    #[test]
    fn test_fit_is_reproducible_for_a_seed() {
        let (xs, ys) = labelled_clients(&[15, 15], 4, 4);
        let mut rng = StdRng::seed_from_u64(5);
        let masks = MaskSet::generate(4, &[15, 15], &mut rng);

        let run = || {
            let mut spca = FederatedSpcaBuilder::new()
                .n_components(2)
                .random_seed(7)
                .build()
                .unwrap();
            let model = spca
                .fit(&xs, &ys, Some(&masks.p), Some(masks.qs.as_slice()))
                .unwrap();
            model.eigen().eigenvalues.clone()
        };

        let a = run();
        let b = run();
        for i in 0..2 {
            assert_abs_diff_eq!(a[i], b[i], epsilon = 1e-9);
        }
    }

    #[test]
    fn test_transform_needs_mask_for_linear_models() {
        let (xs, ys) = labelled_clients(&[20], 3, 6);
        let mut rng = StdRng::seed_from_u64(6);
        let masks = MaskSet::generate(3, &[20], &mut rng);

        let mut spca = FederatedSpcaBuilder::new()
            .n_components(2)
            .secure_aggregation(false)
            .build()
            .unwrap();
        spca.fit(&xs, &ys, Some(&masks.p), Some(masks.qs.as_slice())).unwrap();

        assert!(spca.transform(xs[0].view(), None).is_err());
        let z = spca.transform(xs[0].view(), Some(masks.p.view())).unwrap();
        assert_eq!(z.dim(), (20, 2));
    }

    #[test]
    fn test_dual_and_standard_projections_agree() {
        let sizes = [11, 9];
        let (xs, ys) = labelled_clients(&sizes, 4, 8);
        let mut rng = StdRng::seed_from_u64(9);
        let masks = MaskSet::generate(4, &sizes, &mut rng);

        let mut standard = FederatedSpcaBuilder::new().n_components(2).build().unwrap();
        standard
            .fit(&xs, &ys, Some(&masks.p), Some(masks.qs.as_slice()))
            .unwrap();
        let mut dual = FederatedSpcaBuilder::new()
            .formulation(Formulation::Dual)
            .n_components(2)
            .build()
            .unwrap();
        dual.fit(&xs, &ys, Some(&masks.p), None).unwrap();

        let a = standard.transform(xs[1].view(), Some(masks.p.view())).unwrap();
        let b = dual.transform(xs[1].view(), Some(masks.p.view())).unwrap();
        assert_eq!(a.dim(), (9, 2));
        for i in 0..2 {
            let same = (&a.column(i) - &b.column(i)).iter().fold(0.0_f64, |m, v| m.max(v.abs()));
            let flipped = (&a.column(i) + &b.column(i)).iter().fold(0.0_f64, |m, v| m.max(v.abs()));
            assert!(same.min(flipped) < 1e-6);
        }

        // centred with the global mean: projections over all samples sum to zero
        let all = crate::utils::vstack(&xs).unwrap();
        let z = dual.transform(all.view(), Some(masks.p.view())).unwrap();
        for total in z.sum_axis(ndarray::Axis(0)).iter() {
            assert_abs_diff_eq!(*total, 0.0, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_transform_rejects_wrong_feature_count() {
        let (xs, ys) = labelled_clients(&[10, 10], 3, 10);
        let mut rng = StdRng::seed_from_u64(11);
        let masks = MaskSet::generate(3, &[10, 10], &mut rng);

        let mut spca = FederatedSpcaBuilder::new()
            .formulation(Formulation::Dual)
            .n_components(2)
            .build()
            .unwrap();
        spca.fit(&xs, &ys, Some(&masks.p), None).unwrap();

        let narrow = Array2::<f64>::zeros((5, 2));
        assert!(matches!(
            spca.transform(narrow.view(), Some(masks.p.view())),
            Err(FedSpcaError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_transform_rejects_mean_of_wrong_length() {
        let model = SpcaModel::Linear {
            eigen: EigenResult {
                eigenvalues: Array1::from(vec![1.0, 2.0]),
                eigenvectors: Array2::eye(3).slice_move(ndarray::s![.., ..2]),
            },
            mean: Some(Array1::zeros(4)),
        };
        let x = Array2::<f64>::ones((2, 3));
        let p = Array2::<f64>::eye(3);
        assert!(matches!(
            model.transform(x.view(), Some(p.view())),
            Err(FedSpcaError::ShapeMismatch { .. })
        ));
    }
}
