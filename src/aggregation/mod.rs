//! # Secure Aggregation
//!
//! Pairwise-perturbation secure summation. Every unordered pair of parties
//! shares one random matrix `S(i,j)`; party `i` adds it and party `j`
//! subtracts it, so the perturbations cancel in the global sum and the
//! aggregator only ever sees perturbed shares.
//!
//! The threat model is honest-but-curious with no collusion between parties.

use crate::error::{FedSpcaError, Result};
use log::{debug, trace};
use ndarray::{Array2, ArrayView2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;

/// Half-width of the integer range perturbations are drawn from.
pub const PERTURBATION_RANGE: i64 = 100_000;

/// Anti-symmetric tensor of pairwise perturbations, `R[i][j] = -R[j][i]`.
///
/// Only the upper triangle is stored. The tensor is owned by a single
/// aggregation round and dropped with it.
pub struct PerturbationTensor {
    n_parties: usize,
    shape: (usize, usize),
    upper: Vec<Array2<f64>>,
}

impl PerturbationTensor {
    /// Draws one independent perturbation per unordered pair.
    ///
    /// Each pair gets its own ChaCha20 stream seeded from `rng`, so the
    /// matrices are generated in parallel but remain reproducible.
    pub fn generate<R: Rng>(n_parties: usize, shape: (usize, usize), rng: &mut R) -> Self {
        let n_pairs = n_parties * n_parties.saturating_sub(1) / 2;
        let seeds: Vec<ChaCha20Rng> = (0..n_pairs)
            .map(|_| ChaCha20Rng::from_rng(&mut *rng))
            .collect();

        let upper = seeds
            .into_par_iter()
            .map(|mut pair_rng| {
                Array2::from_shape_simple_fn(shape, || {
                    let coarse = pair_rng.random_range(-PERTURBATION_RANGE..PERTURBATION_RANGE);
                    coarse as f64 + pair_rng.random::<f64>()
                })
            })
            .collect();

        trace!("generated {} pairwise perturbations of shape {:?}", n_pairs, shape);

        PerturbationTensor {
            n_parties,
            shape,
            upper,
        }
    }

    pub fn n_parties(&self) -> usize {
        self.n_parties
    }

    fn pair_index(&self, i: usize, j: usize) -> usize {
        debug_assert!(i < j);
        i * (2 * self.n_parties - i - 1) / 2 + (j - i - 1)
    }

    /// `R[i][j]`; zero on the diagonal.
    pub fn get(&self, i: usize, j: usize) -> Array2<f64> {
        if i == j {
            Array2::zeros(self.shape)
        } else if i < j {
            self.upper[self.pair_index(i, j)].clone()
        } else {
            -&self.upper[self.pair_index(j, i)]
        }
    }

    /// `Σ_j R[party][j]`, the amount the party removes before revealing.
    pub fn row_sum(&self, party: usize) -> Array2<f64> {
        let mut total = Array2::zeros(self.shape);
        for other in 0..self.n_parties {
            if other > party {
                total += &self.upper[self.pair_index(party, other)];
            } else if other < party {
                total -= &self.upper[self.pair_index(other, party)];
            }
        }
        total
    }
}

/// One secure summation round over a fixed set of parties.
///
/// Parties call [`SecureAggregator::reveal`] exactly once each; the round is
/// closed with [`SecureAggregator::finish`], which refuses to produce a sum
/// unless every party contributed.
pub struct SecureAggregator {
    shape: (usize, usize),
    perturbations: PerturbationTensor,
    revealed: Vec<Option<Array2<f64>>>,
}

impl SecureAggregator {
    pub fn new<R: Rng>(n_parties: usize, shape: (usize, usize), rng: &mut R) -> Result<Self> {
        if n_parties == 0 {
            return Err(FedSpcaError::EmptyInput(
                "secure aggregation needs at least one party".into(),
            ));
        }
        debug!(
            "opening secure aggregation round: {} parties, shape {:?}",
            n_parties, shape
        );
        Ok(SecureAggregator {
            shape,
            perturbations: PerturbationTensor::generate(n_parties, shape, rng),
            revealed: vec![None; n_parties],
        })
    }

    pub fn n_parties(&self) -> usize {
        self.revealed.len()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// The value party `party` would send for `value`: `value - Σ_j R[party][j]`.
    pub fn masked_share(&self, party: usize, value: ArrayView2<f64>) -> Result<Array2<f64>> {
        if party >= self.n_parties() {
            return Err(FedSpcaError::shape(
                "party index",
                (self.n_parties(), 1),
                (party, 1),
            ));
        }
        if value.dim() != self.shape {
            return Err(FedSpcaError::shape(
                format!("contribution of party {}", party),
                self.shape,
                value.dim(),
            ));
        }
        Ok(&value - &self.perturbations.row_sum(party))
    }

    fn record(&mut self, party: usize, share: Array2<f64>) -> Result<&Array2<f64>> {
        let slot = &mut self.revealed[party];
        if slot.is_some() {
            return Err(FedSpcaError::InvalidConfiguration(format!(
                "party {} contributed twice to the same round",
                party
            )));
        }
        let share: &Array2<f64> = slot.insert(share);
        Ok(share)
    }

    /// Masks and records the contribution of `party`, returning exactly what
    /// the aggregator gets to see.
    pub fn reveal(&mut self, party: usize, value: ArrayView2<f64>) -> Result<&Array2<f64>> {
        let share = self.masked_share(party, value)?;
        self.record(party, share)
    }

    /// Sums all revealed shares. Fails if any party is missing.
    pub fn finish(self) -> Result<Array2<f64>> {
        let mut total = Array2::zeros(self.shape);
        for (party, share) in self.revealed.iter().enumerate() {
            match share {
                Some(share) => total += share,
                None => return Err(FedSpcaError::MissingContribution { party }),
            }
        }
        Ok(total)
    }
}

fn check_same_shape(matrices: &[Array2<f64>]) -> Result<(usize, usize)> {
    let first = matrices
        .first()
        .ok_or_else(|| FedSpcaError::EmptyInput("no matrices to aggregate".into()))?;
    let shape = first.dim();
    for (party, m) in matrices.iter().enumerate().skip(1) {
        if m.dim() != shape {
            return Err(FedSpcaError::shape(
                format!("contribution of party {}", party),
                shape,
                m.dim(),
            ));
        }
    }
    Ok(shape)
}

/// Runs a full secure round where party `i` holds `matrices[i]`.
pub fn secure_sum<R: Rng>(matrices: &[Array2<f64>], rng: &mut R) -> Result<Array2<f64>> {
    let shape = check_same_shape(matrices)?;
    let mut aggregator = SecureAggregator::new(matrices.len(), shape, rng)?;

    let shares = matrices
        .par_iter()
        .enumerate()
        .map(|(party, m)| aggregator.masked_share(party, m.view()))
        .collect::<Result<Vec<_>>>()?;

    for (party, share) in shares.into_iter().enumerate() {
        aggregator.record(party, share)?;
    }
    aggregator.finish()
}

/// Element-wise sum without any masking.
pub fn plain_sum(matrices: &[Array2<f64>]) -> Result<Array2<f64>> {
    let shape = check_same_shape(matrices)?;
    let mut total = Array2::zeros(shape);
    for m in matrices {
        total += m;
    }
    Ok(total)
}

/// How client contributions are combined on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Aggregation {
    #[default]
    Secure,
    Plain,
}

impl Aggregation {
    pub fn sum<R: Rng>(&self, matrices: &[Array2<f64>], rng: &mut R) -> Result<Array2<f64>> {
        match self {
            Aggregation::Secure => secure_sum(matrices, rng),
            Aggregation::Plain => plain_sum(matrices),
        }
    }
}
