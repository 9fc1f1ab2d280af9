use thiserror::Error;

/// Errors raised while running a federated fit or one of its rounds.
///
/// All of them are reported synchronously to the caller of `fit`. None are
/// retried: they describe configuration mistakes or data-quality faults.
#[derive(Debug, Error)]
pub enum FedSpcaError {
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("empty input: {0}")]
    EmptyInput(String),

    #[error("mask is not orthogonal: max |M·Mᵗ - I| = {deviation:e}")]
    NonOrthogonalMask { deviation: f64 },

    #[error("singular matrix: {0}")]
    SingularMatrix(String),

    #[error("party {party} did not contribute to the aggregation round")]
    MissingContribution { party: usize },

    #[error("unrecognized kernel '{0}'")]
    UnrecognizedKernel(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("model must be fitted first")]
    NotFitted,

    #[error("{routine} failed: {message}")]
    Backend {
        routine: &'static str,
        message: String,
    },
}

impl FedSpcaError {
    pub(crate) fn shape(
        context: impl Into<String>,
        expected: (usize, usize),
        actual: (usize, usize),
    ) -> Self {
        FedSpcaError::ShapeMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }

    pub(crate) fn backend(routine: &'static str, err: impl std::fmt::Display) -> Self {
        FedSpcaError::Backend {
            routine,
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FedSpcaError>;
