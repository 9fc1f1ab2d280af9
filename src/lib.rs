pub mod aggregation;
pub mod clustering;
pub mod eigen;
pub mod error;
pub mod kernel;
pub mod masking;
pub mod spca;
pub mod utils;

pub use aggregation::Aggregation;
pub use aggregation::SecureAggregator;
pub use eigen::EigenResult;
pub use error::FedSpcaError;
pub use error::Result;
pub use kernel::Kernel;
pub use masking::MaskSet;
pub use spca::FederatedSpca;
pub use spca::FederatedSpcaBuilder;
pub use spca::Formulation;
pub use spca::SpcaModel;
