use super::standard::global_mean;
use super::FederatedSpca;
use crate::eigen::{cholesky_lower, EigenResult, EigenSubset};
use crate::error::{FedSpcaError, Result};
use crate::masking::check_mask;
use crate::utils::{validate_partition, vstack};
use log::debug;
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use rand::Rng;
use rayon::prelude::*;

/// Dual SPCA: the server sees `P·Xᵗ·H` and solves the `n × n` problem
/// `ψᵗ·ψ` with `ψ = P·Xᵗ·H·Δ` and `Δ·Δᵗ = L + I`. Eigenvectors are mapped
/// back to (masked) feature space as `ψ·v / √λ`.
///
/// Also returns the global feature mean, aggregated like the standard
/// formulation does, so new data is centred the same way at projection.
pub(super) fn fit<R: Rng>(
    spca: &FederatedSpca,
    xs: &[Array2<f64>],
    ys: &[Array2<f64>],
    p: ArrayView2<f64>,
    rng: &mut R,
) -> Result<(EigenResult, Array1<f64>)> {
    let partition = validate_partition(xs, ys)?;
    let n = partition.n_samples();
    check_mask("shared feature mask P", p, partition.n_features, spca.validate_masks)?;

    let masked: Vec<Array2<f64>> = xs.par_iter().map(|x| p.dot(&x.t())).collect();
    let mut pxh = Array2::zeros((partition.n_features, n));
    for (block, offset) in masked.iter().zip(partition.offsets()) {
        pxh.slice_mut(s![.., offset..offset + block.ncols()])
            .assign(block);
    }
    // right-multiplying by H centres every feature row across samples
    for mut row in pxh.rows_mut() {
        let mean = row.mean().unwrap_or(0.0);
        row.mapv_inplace(|v| v - mean);
    }
    debug!("server concatenated PXH {:?}", pxh.dim());

    let mean = global_mean(xs, spca.aggregation, rng)?;

    let y = vstack(ys)?;
    let mut bracket = spca.label_kernel.gram(y.view())?;
    bracket += &Array2::eye(n);
    let delta = cholesky_lower(bracket.view())?;
    let psi = pxh.dot(&delta);

    let gram = psi.t().dot(&psi);
    let raw = spca.solver.symmetric(gram.view(), spca.subset())?;

    let largest = raw.eigenvalues.iter().cloned().fold(0.0, f64::max);
    let floor = spca.eps * largest.max(1.0);
    let keep: Vec<usize> = match spca.subset() {
        EigenSubset::All => (0..raw.n_components())
            .filter(|&i| raw.eigenvalues[i] > floor)
            .collect(),
        EigenSubset::Top(_) => {
            if let Some(v) = raw.eigenvalues.iter().find(|&&v| v <= floor) {
                return Err(FedSpcaError::SingularMatrix(format!(
                    "requested dual eigenpair has eigenvalue {:e}, at or below the floor {:e}",
                    v, floor
                )));
            }
            (0..raw.n_components()).collect()
        }
    };
    if keep.is_empty() {
        return Err(FedSpcaError::SingularMatrix(
            "dual problem has no eigenvalue above the floor".into(),
        ));
    }
    debug!(
        "dual problem kept {} of {} eigenpairs",
        keep.len(),
        raw.n_components()
    );

    let eigenvalues = raw.eigenvalues.select(Axis(0), &keep);
    let mut eigenvectors = psi.dot(&raw.eigenvectors.select(Axis(1), &keep));
    for (mut column, &value) in eigenvectors.columns_mut().into_iter().zip(eigenvalues.iter()) {
        let scale = value.sqrt();
        column.mapv_inplace(|v| v / scale);
    }

    Ok((
        EigenResult {
            eigenvalues,
            eigenvectors,
        },
        mean,
    ))
}
