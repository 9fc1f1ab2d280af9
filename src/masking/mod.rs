//! # Orthogonal Masking
//!
//! Random orthogonal matrices hide the row and column bases of client data
//! while leaving the inner products that covariance and Gram matrices are
//! built from untouched.

use crate::error::{FedSpcaError, Result};
use crate::utils::{to_array2, vstack};
use log::debug;
use nalgebra::{DMatrix, QR};
use ndarray::{s, Array2, ArrayView2};
use rand::Rng;
use rand_distr::StandardNormal;

/// Default tolerance used when checking `M·Mᵗ ≈ I`.
pub const ORTHOGONALITY_TOLERANCE: f64 = 1e-8;

/// Draws a `d × d` orthogonal matrix: the Q factor of the QR decomposition
/// of a standard normal matrix.
pub fn random_orthogonal<R: Rng>(d: usize, rng: &mut R) -> Array2<f64> {
    let gaussian = DMatrix::<f64>::from_fn(d, d, |_, _| rng.sample(StandardNormal));
    to_array2(QR::new(gaussian).q())
}

/// Largest entry of `|M·Mᵗ - I|`.
pub fn orthogonality_deviation(mask: ArrayView2<f64>) -> f64 {
    let product = mask.dot(&mask.t());
    product
        .indexed_iter()
        .map(|((i, j), v)| {
            let expected = if i == j { 1.0 } else { 0.0 };
            (v - expected).abs()
        })
        .fold(0.0, f64::max)
}

/// Fails with [`FedSpcaError::NonOrthogonalMask`] unless `mask` is square
/// and `M·Mᵗ ≈ I` within `tolerance`.
pub fn check_orthogonal(mask: ArrayView2<f64>, tolerance: f64) -> Result<()> {
    let (rows, cols) = mask.dim();
    if rows != cols {
        return Err(FedSpcaError::shape("orthogonal mask", (rows, rows), (rows, cols)));
    }
    let deviation = orthogonality_deviation(mask);
    if deviation > tolerance {
        return Err(FedSpcaError::NonOrthogonalMask { deviation });
    }
    Ok(())
}

/// Removes the shared feature mask from eigenvectors computed on masked
/// data: `U = Pᵗ · U'`. Only a party holding `P` can run this.
pub fn unmask(eigenvectors: ArrayView2<f64>, p: ArrayView2<f64>) -> Result<Array2<f64>> {
    if p.nrows() != eigenvectors.nrows() || p.ncols() != p.nrows() {
        return Err(FedSpcaError::shape(
            "feature mask for unmasking",
            (eigenvectors.nrows(), eigenvectors.nrows()),
            p.dim(),
        ));
    }
    Ok(p.t().dot(&eigenvectors))
}

/// The masks a trusted third party hands out before a standard fit: one
/// feature mask `P` shared by every client and one private sample mask
/// `Q[i]` per client.
///
/// The sample masks are the row blocks of a single `(n × n)` orthogonal
/// matrix, so `Q[i]` is `(n_i × n)` with `Q[i]·Q[i]ᵗ = I`. Every client's
/// masked data then spans all `n` columns and the aggregate mixes clients.
#[derive(Debug, Clone)]
pub struct MaskSet {
    pub p: Array2<f64>,
    pub qs: Vec<Array2<f64>>,
}

impl MaskSet {
    pub fn generate<R: Rng>(n_features: usize, client_sizes: &[usize], rng: &mut R) -> Self {
        let n: usize = client_sizes.iter().sum();
        debug!(
            "generating masks: P {}x{}, Q {}x{} split over {} clients",
            n_features,
            n_features,
            n,
            n,
            client_sizes.len()
        );
        let p = random_orthogonal(n_features, rng);
        let q = random_orthogonal(n, rng);

        let mut offset = 0;
        let qs = client_sizes
            .iter()
            .map(|&n_i| {
                let block = q.slice(s![offset..offset + n_i, ..]).to_owned();
                offset += n_i;
                block
            })
            .collect();
        MaskSet { p, qs }
    }
}

/// Checks a mask has shape `dim × dim` and, when asked, that it is orthogonal.
pub(crate) fn check_mask(
    context: &str,
    mask: ArrayView2<f64>,
    dim: usize,
    validate: bool,
) -> Result<()> {
    if mask.dim() != (dim, dim) {
        return Err(FedSpcaError::shape(context, (dim, dim), mask.dim()));
    }
    if validate {
        check_orthogonal(mask, ORTHOGONALITY_TOLERANCE)?;
    }
    Ok(())
}

/// Checks the per-client sample masks: client `i` holds an `(n_i × n)`
/// block and, when asked, the stacked blocks form an orthogonal matrix.
pub(crate) fn check_sample_masks(
    qs: &[Array2<f64>],
    client_sizes: &[usize],
    validate: bool,
) -> Result<()> {
    if qs.len() != client_sizes.len() {
        return Err(FedSpcaError::shape(
            "number of client sample masks",
            (client_sizes.len(), 1),
            (qs.len(), 1),
        ));
    }
    let n: usize = client_sizes.iter().sum();
    for (i, (q, &n_i)) in qs.iter().zip(client_sizes).enumerate() {
        if q.dim() != (n_i, n) {
            return Err(FedSpcaError::shape(
                format!("sample mask of client {}", i),
                (n_i, n),
                q.dim(),
            ));
        }
        if validate {
            let deviation = orthogonality_deviation(q.view());
            if deviation > ORTHOGONALITY_TOLERANCE {
                return Err(FedSpcaError::NonOrthogonalMask { deviation });
            }
        }
    }
    if validate {
        // rows of different clients must be orthogonal to each other too
        let stacked = vstack(qs)?;
        check_orthogonal(stacked.view(), ORTHOGONALITY_TOLERANCE)?;
    }
    Ok(())
}
