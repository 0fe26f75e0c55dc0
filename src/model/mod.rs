pub mod diff_ssm;
pub mod dynamic;
pub mod embedding;
pub mod network;
pub mod pooling;
pub mod ssm;

pub use diff_ssm::DiffSsm;
pub use dynamic::DynamicEncoding;
pub use embedding::timestep_embedding;
pub use network::CamoDiff;
pub use pooling::BidirectionalPooling;
pub use ssm::{SsmKernel, causal_conv, reverse_seq};
