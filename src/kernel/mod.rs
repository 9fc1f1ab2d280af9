//! # Pairwise Kernels
//!
//! Kernel (Gram) matrices between the rows of two matrices. Kernels are a
//! closed enum with their parameters attached, validated once before a fit
//! starts instead of being looked up from free-form arguments at use time.

use crate::error::{FedSpcaError, Result};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use num_traits::Float;
use rayon::prelude::*;

/// Supported kernels. A `gamma` of `None` resolves to `1 / n_features` when
/// the kernel is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Kernel {
    #[default]
    Linear,
    Rbf {
        gamma: Option<f64>,
    },
    Laplacian {
        gamma: Option<f64>,
    },
    Polynomial {
        degree: u32,
        gamma: Option<f64>,
        coef0: f64,
    },
    Sigmoid {
        gamma: Option<f64>,
        coef0: f64,
    },
    Cosine,
}

impl Kernel {
    /// Looks a kernel up by its conventional name, with default parameters.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "linear" => Ok(Kernel::Linear),
            "rbf" | "gaussian" => Ok(Kernel::Rbf { gamma: None }),
            "laplacian" => Ok(Kernel::Laplacian { gamma: None }),
            "poly" | "polynomial" => Ok(Kernel::Polynomial {
                degree: 3,
                gamma: None,
                coef0: 1.0,
            }),
            "sigmoid" => Ok(Kernel::Sigmoid {
                gamma: None,
                coef0: 1.0,
            }),
            "cosine" => Ok(Kernel::Cosine),
            _ => Err(FedSpcaError::UnrecognizedKernel(name.to_string())),
        }
    }

    pub fn rbf(gamma: f64) -> Self {
        Kernel::Rbf { gamma: Some(gamma) }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Kernel::Linear => "linear",
            Kernel::Rbf { .. } => "rbf",
            Kernel::Laplacian { .. } => "laplacian",
            Kernel::Polynomial { .. } => "polynomial",
            Kernel::Sigmoid { .. } => "sigmoid",
            Kernel::Cosine => "cosine",
        }
    }

    fn gamma(&self) -> Option<f64> {
        match *self {
            Kernel::Rbf { gamma }
            | Kernel::Laplacian { gamma }
            | Kernel::Polynomial { gamma, .. }
            | Kernel::Sigmoid { gamma, .. } => gamma,
            Kernel::Linear | Kernel::Cosine => None,
        }
    }

    /// Rejects parameters no evaluation could make sense of.
    pub fn validate(&self) -> Result<()> {
        if let Some(gamma) = self.gamma() {
            if !gamma.is_finite() || gamma <= 0.0 {
                return Err(FedSpcaError::InvalidConfiguration(format!(
                    "{} kernel needs a positive finite gamma, got {}",
                    self.name(),
                    gamma
                )));
            }
        }
        match *self {
            Kernel::Polynomial { degree: 0, .. } => Err(FedSpcaError::InvalidConfiguration(
                "polynomial kernel degree must be at least 1".into(),
            )),
            Kernel::Polynomial { coef0, .. } | Kernel::Sigmoid { coef0, .. }
                if !coef0.is_finite() =>
            {
                Err(FedSpcaError::InvalidConfiguration(format!(
                    "{} kernel needs a finite coef0",
                    self.name()
                )))
            }
            _ => Ok(()),
        }
    }

    fn evaluate(&self, a: ArrayView1<f64>, b: ArrayView1<f64>, default_gamma: f64) -> f64 {
        let gamma = self.gamma().unwrap_or(default_gamma);
        match *self {
            Kernel::Linear => a.dot(&b),
            Kernel::Rbf { .. } => (-gamma * squared_euclidean(a, b)).exp(),
            Kernel::Laplacian { .. } => (-gamma * manhattan(a, b)).exp(),
            Kernel::Polynomial { degree, coef0, .. } => {
                (gamma * a.dot(&b) + coef0).powi(degree as i32)
            }
            Kernel::Sigmoid { coef0, .. } => (gamma * a.dot(&b) + coef0).tanh(),
            Kernel::Cosine => {
                let norm = (a.dot(&a) * b.dot(&b)).sqrt();
                if norm > f64::EPSILON {
                    a.dot(&b) / norm
                } else {
                    0.0
                }
            }
        }
    }

    /// `K[i][j] = k(x_i, y_j)` for the rows of `x` and `y`.
    pub fn pairwise(&self, x: ArrayView2<f64>, y: ArrayView2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != y.ncols() {
            return Err(FedSpcaError::shape(
                format!("{} kernel operands", self.name()),
                (y.nrows(), x.ncols()),
                y.dim(),
            ));
        }
        self.validate()?;

        let default_gamma = 1.0 / x.ncols().max(1) as f64;
        let mut gram = Array2::zeros((x.nrows(), y.nrows()));
        gram.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(i, mut row)| {
                let xi = x.row(i);
                for (j, yj) in y.rows().into_iter().enumerate() {
                    row[j] = self.evaluate(xi, yj, default_gamma);
                }
            });
        Ok(gram)
    }

    /// Kernel of a matrix with itself.
    pub fn gram(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        self.pairwise(x, x)
    }
}

/// Sum of absolute differences.
pub fn manhattan<T: Float>(a: ArrayView1<T>, b: ArrayView1<T>) -> T {
    a.iter()
        .zip(b.iter())
        .fold(T::zero(), |acc, (&x, &y)| acc + (x - y).abs())
}

pub fn squared_euclidean<T: Float>(a: ArrayView1<T>, b: ArrayView1<T>) -> T {
    a.iter().zip(b.iter()).fold(T::zero(), |acc, (&x, &y)| {
        let diff = x - y;
        acc + diff * diff
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_linear_kernel_is_inner_product() {
        let x = array![[1.0, 2.0], [3.0, 4.0], [0.0, 1.0]];
        let gram = Kernel::Linear.gram(x.view()).unwrap();
        assert_eq!(gram, x.dot(&x.t()));
    }

    #[test]
    fn test_rbf_kernel() {
        let x = array![[0.0, 0.0], [1.0, 1.0]];
        let gram = Kernel::rbf(0.5).gram(x.view()).unwrap();

        assert_abs_diff_eq!(gram[[0, 0]], 1.0);
        assert_abs_diff_eq!(gram[[0, 1]], (-1.0_f64).exp(), epsilon = 1e-12);
        assert_abs_diff_eq!(gram[[1, 0]], gram[[0, 1]]);

        // default gamma is 1 / n_features
        let gram = Kernel::Rbf { gamma: None }.gram(x.view()).unwrap();
        assert_abs_diff_eq!(gram[[0, 1]], (-1.0_f64).exp(), epsilon = 1e-12);
    }

    #[test]
    fn test_other_kernels() {
        let x = array![[1.0, 0.0]];
        let y = array![[0.0, 2.0], [2.0, 0.0]];

        let lap = Kernel::Laplacian { gamma: Some(1.0) }.pairwise(x.view(), y.view()).unwrap();
        assert_abs_diff_eq!(lap[[0, 0]], (-3.0_f64).exp(), epsilon = 1e-12);

        let poly = Kernel::Polynomial {
            degree: 2,
            gamma: Some(1.0),
            coef0: 1.0,
        }
        .pairwise(x.view(), y.view())
        .unwrap();
        assert_abs_diff_eq!(poly[[0, 1]], 9.0);

        let sig = Kernel::Sigmoid {
            gamma: Some(1.0),
            coef0: 0.0,
        }
        .pairwise(x.view(), y.view())
        .unwrap();
        assert_abs_diff_eq!(sig[[0, 0]], 0.0);
        assert_abs_diff_eq!(sig[[0, 1]], 2.0_f64.tanh(), epsilon = 1e-12);

        let cos = Kernel::Cosine.pairwise(x.view(), y.view()).unwrap();
        assert_abs_diff_eq!(cos[[0, 0]], 0.0);
        assert_abs_diff_eq!(cos[[0, 1]], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_from_name() {
        assert_eq!(Kernel::from_name("linear").unwrap(), Kernel::Linear);
        assert_eq!(Kernel::from_name("RBF").unwrap(), Kernel::Rbf { gamma: None });
        assert!(matches!(
            Kernel::from_name("chi2"),
            Err(FedSpcaError::UnrecognizedKernel(name)) if name == "chi2"
        ));
    }

    #[test]
    fn test_validation() {
        assert!(Kernel::rbf(-1.0).validate().is_err());
        assert!(Kernel::rbf(f64::NAN).validate().is_err());
        assert!(Kernel::Polynomial {
            degree: 0,
            gamma: None,
            coef0: 1.0
        }
        .validate()
        .is_err());
        assert!(Kernel::rbf(2.0).validate().is_ok());
        assert!(Kernel::Linear.validate().is_ok());
    }

    #[test]
    fn test_pairwise_shape_mismatch() {
        let x = Array2::<f64>::zeros((2, 3));
        let y = Array2::<f64>::zeros((2, 2));
        assert!(matches!(
            Kernel::Linear.pairwise(x.view(), y.view()),
            Err(FedSpcaError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_distances() {
        let a = array![1.0, -2.0, 3.0];
        let b = array![0.0, 0.0, 1.0];
        assert_abs_diff_eq!(manhattan(a.view(), b.view()), 5.0);
        assert_abs_diff_eq!(squared_euclidean(a.view(), b.view()), 9.0);
    }
}
