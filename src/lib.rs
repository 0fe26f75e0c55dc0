//! # camodiff
//!
//! **Camouflaged-object detection by diffusion denoising over state-space blocks.**
//!
//! camodiff predicts binary object masks for images whose foreground blends
//! into the background. Instead of scoring pixels in one pass, it denoises a
//! Gaussian state into a mask, conditioning every block on the diffusion
//! timestep. The backbone is a symmetric encoder/decoder of bidirectional
//! state-space blocks over a patch-token sequence.
//!
//! ## Design
//!
//! - **Diff-SSM blocks**: forward and backward state-space convolutions,
//!   blended by a timestep-dependent gate
//! - **Dynamic encoding**: quadrant-split positional re-encoding, refreshed
//!   against the current timestep
//! - **Bidirectional pooling**: an exactly invertible lifting transform in
//!   place of strided down/upsampling
//! - **Constant-alpha diffusion**: closed-form noising, with an
//!   early-terminating reverse sampler

pub mod config;
pub mod data;
pub mod diffusion;
pub mod error;
pub mod metrics;
pub mod model;
pub mod nn;
pub mod trainer;

pub use config::ModelConfig;
pub use diffusion::{NoiseSchedule, Sampler};
pub use error::{Error, Result};
pub use metrics::Metrics;
pub use model::CamoDiff;
pub use trainer::{Trainer, TrainerConfig};

// Re-export tensor types users will commonly need.
pub use candle_core::{DType, Device, Tensor};
