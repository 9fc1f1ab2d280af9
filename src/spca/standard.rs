use super::FederatedSpca;
use crate::aggregation::Aggregation;
use crate::eigen::EigenResult;
use crate::error::{FedSpcaError, Result};
use crate::masking::{check_mask, check_sample_masks};
use crate::utils::{center_rows, validate_partition};
use log::debug;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::Rng;
use rayon::prelude::*;

/// Global feature mean from per-client column sums (`mean_i · n_i`), summed
/// with the configured aggregation and divided by the total sample count.
pub(super) fn global_mean<R: Rng>(
    xs: &[Array2<f64>],
    aggregation: Aggregation,
    rng: &mut R,
) -> Result<Array1<f64>> {
    let n: usize = xs.iter().map(|x| x.nrows()).sum();
    if n == 0 {
        return Err(FedSpcaError::EmptyInput("no samples to average".into()));
    }
    let weighted: Vec<Array2<f64>> = xs
        .par_iter()
        .map(|x| x.sum_axis(Axis(0)).insert_axis(Axis(0)))
        .collect();
    let total = aggregation.sum(&weighted, rng)?;
    Ok(total.row(0).mapv(|v| v / n as f64))
}

/// Client-side step: centre, then mask features with `P` and samples with
/// the private `Q[i]`, the client's `(n_i × n)` rows of a shared orthogonal
/// matrix. Both results span all `n` sample columns, so summing every
/// client's contribution yields `P·Xᵗ·Q` and `Qᵗ·Y` without any column block
/// belonging to a single client.
fn mask_client(
    x: ArrayView2<f64>,
    y: ArrayView2<f64>,
    p: ArrayView2<f64>,
    q: ArrayView2<f64>,
    mean: &Array1<f64>,
) -> (Array2<f64>, Array2<f64>) {
    let centered = center_rows(x, mean);
    (p.dot(&centered.t()).dot(&q), q.t().dot(&y))
}

pub(super) fn fit<R: Rng>(
    spca: &FederatedSpca,
    xs: &[Array2<f64>],
    ys: &[Array2<f64>],
    p: ArrayView2<f64>,
    qs: &[Array2<f64>],
    rng: &mut R,
) -> Result<(EigenResult, Array1<f64>)> {
    let partition = validate_partition(xs, ys)?;
    let m = partition.n_features;
    let n = partition.n_samples();

    check_mask("shared feature mask P", p, m, spca.validate_masks)?;
    check_sample_masks(qs, &partition.client_sizes, spca.validate_masks)?;

    let mean = global_mean(xs, spca.aggregation, rng)?;
    debug!("global mean aggregated over {} samples", n);

    let (masked_xs, masked_ys): (Vec<Array2<f64>>, Vec<Array2<f64>>) = xs
        .par_iter()
        .zip(ys.par_iter())
        .zip(qs.par_iter())
        .map(|((x, y), q)| mask_client(x.view(), y.view(), p, q.view(), &mean))
        .unzip();

    let pxq = spca.aggregation.sum(&masked_xs, rng)?;
    let qty = spca.aggregation.sum(&masked_ys, rng)?;
    debug!(
        "server received PXQ {:?} and QtY {:?}",
        pxq.dim(),
        qty.dim()
    );

    // PXQ·(QtY·QtYᵗ + I)·PXQᵗ without forming the n × n bracket
    let projected = pxq.dot(&qty);
    let q_mat = projected.dot(&projected.t()) + pxq.dot(&pxq.t());

    let eigen = spca.solver.symmetric(q_mat.view(), spca.subset())?;
    Ok((eigen, mean))
}
