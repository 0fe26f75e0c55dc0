//! Model and diffusion hyperparameters.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Full configuration for the denoising network and its diffusion process.
///
/// The defaults reproduce the reference training setup: 256x256 RGB inputs,
/// 4x4 patches (64x64 token grid), 192-dim tokens, 1000 diffusion steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Input image side length in pixels (images are square)
    pub img_size: usize,

    /// Patch side length for the embedding stem; must divide `img_size`
    pub patch_size: usize,

    /// Input image channels
    pub in_channels: usize,

    /// Token dimension throughout the network
    pub hidden_dim: usize,

    /// Expanded token width, conventionally `2 * hidden_dim` (not enforced)
    pub expanded_dim: usize,

    /// State dimension of each SSM kernel
    pub ssm_dim: usize,

    /// Number of state-space blocks in the encoder
    pub num_encoder_blocks: usize,

    /// Number of state-space blocks in the decoder
    pub num_decoder_blocks: usize,

    /// Number of dynamic encoding layers at the head of encoder and decoder
    pub num_dynamic_layers: usize,

    /// Number of pooling stages shared between encoder and decoder
    pub num_pool_stages: usize,

    /// Length of the diffusion chain
    pub num_timesteps: usize,

    /// Noise level applied inside the object region
    pub beta1_start: f64,

    /// Noise level applied to the background
    pub beta2_start: f64,

    /// Reconstruction error below which reverse sampling stops early
    pub object_error_threshold: f64,

    /// Reconstruction error target for the background region
    pub background_error_threshold: f64,

    /// Balance between object-aware and region-aware structure scores
    pub smeasure_alpha: f64,

    /// Squared beta weighting precision against recall in the F-measure
    pub fmeasure_beta_sq: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            img_size: 256,
            patch_size: 4,
            in_channels: 3,
            hidden_dim: 192,
            expanded_dim: 384,
            ssm_dim: 16,
            num_encoder_blocks: 5,
            num_decoder_blocks: 8,
            num_dynamic_layers: 2,
            num_pool_stages: 4,
            num_timesteps: 1000,
            beta1_start: 0.5,
            beta2_start: 0.5,
            object_error_threshold: 0.1,
            background_error_threshold: 0.05,
            smeasure_alpha: 0.5,
            fmeasure_beta_sq: 0.3,
        }
    }
}

impl ModelConfig {
    pub fn with_img_size(mut self, img_size: usize) -> Self {
        self.img_size = img_size;
        self
    }

    pub fn with_patch_size(mut self, patch_size: usize) -> Self {
        self.patch_size = patch_size;
        self
    }

    pub fn with_hidden_dim(mut self, hidden_dim: usize) -> Self {
        self.hidden_dim = hidden_dim;
        self
    }

    pub fn with_expanded_dim(mut self, expanded_dim: usize) -> Self {
        self.expanded_dim = expanded_dim;
        self
    }

    pub fn with_ssm_dim(mut self, ssm_dim: usize) -> Self {
        self.ssm_dim = ssm_dim;
        self
    }

    pub fn with_num_encoder_blocks(mut self, n: usize) -> Self {
        self.num_encoder_blocks = n;
        self
    }

    pub fn with_num_decoder_blocks(mut self, n: usize) -> Self {
        self.num_decoder_blocks = n;
        self
    }

    pub fn with_num_dynamic_layers(mut self, n: usize) -> Self {
        self.num_dynamic_layers = n;
        self
    }

    pub fn with_num_pool_stages(mut self, n: usize) -> Self {
        self.num_pool_stages = n;
        self
    }

    pub fn with_num_timesteps(mut self, t: usize) -> Self {
        self.num_timesteps = t;
        self
    }

    pub fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.beta1_start = beta1;
        self.beta2_start = beta2;
        self
    }

    /// Side length of the token grid after patch embedding.
    pub fn grid_side(&self) -> usize {
        self.img_size / self.patch_size
    }

    /// Number of tokens after patch embedding.
    pub fn num_patches(&self) -> usize {
        self.grid_side() * self.grid_side()
    }

    /// Side length of the token grid at the encoder bottleneck.
    pub fn bottleneck_side(&self) -> usize {
        self.grid_side() >> self.num_pool_stages
    }

    /// Load a configuration from a JSON file and validate it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::ModelError {
            reason: format!("failed to read config {}: {e}", path.as_ref().display()),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| Error::ModelError {
            reason: format!("failed to parse config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration to a JSON file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| Error::ModelError {
            reason: format!("failed to serialize config: {e}"),
        })?;
        std::fs::write(path.as_ref(), json).map_err(|e| Error::ModelError {
            reason: format!("failed to write config {}: {e}", path.as_ref().display()),
        })
    }

    /// Check the structural constraints the network relies on.
    pub fn validate(&self) -> Result<()> {
        if self.hidden_dim < 4 || self.hidden_dim % 2 != 0 {
            return Err(Error::ModelError {
                reason: format!("hidden_dim must be even and >= 4, got {}", self.hidden_dim),
            });
        }
        if self.expanded_dim == 0 {
            return Err(Error::ModelError {
                reason: "expanded_dim must be > 0".into(),
            });
        }
        if self.ssm_dim == 0 {
            return Err(Error::ModelError {
                reason: "ssm_dim must be > 0".into(),
            });
        }
        if self.in_channels == 0 {
            return Err(Error::ModelError {
                reason: "in_channels must be > 0".into(),
            });
        }
        if self.patch_size == 0 || self.img_size % self.patch_size != 0 {
            return Err(Error::ModelError {
                reason: format!(
                    "patch_size ({}) must be > 0 and divide img_size ({})",
                    self.patch_size, self.img_size
                ),
            });
        }
        // Each pooling stage halves the grid side, and the dynamic encoding
        // layers need at least a 2x2 grid at the bottleneck.
        let side = self.grid_side();
        if side % (1 << self.num_pool_stages) != 0 {
            return Err(Error::ModelError {
                reason: format!(
                    "token grid side ({side}) must be divisible by 2^num_pool_stages ({})",
                    1 << self.num_pool_stages
                ),
            });
        }
        if side >> self.num_pool_stages < 2 {
            return Err(Error::ModelError {
                reason: format!(
                    "token grid side ({side}) collapses below 2x2 after {} pooling stages",
                    self.num_pool_stages
                ),
            });
        }
        if self.num_dynamic_layers > 0 && (side >> self.num_pool_stages) % 2 != 0 {
            return Err(Error::ModelError {
                reason: format!(
                    "bottleneck side ({}) must be even for the dynamic encoding layers",
                    side >> self.num_pool_stages
                ),
            });
        }
        if self.num_pool_stages > self.num_encoder_blocks {
            return Err(Error::ModelError {
                reason: format!(
                    "num_pool_stages ({}) must be <= num_encoder_blocks ({})",
                    self.num_pool_stages, self.num_encoder_blocks
                ),
            });
        }
        if self.num_pool_stages > self.num_decoder_blocks {
            return Err(Error::ModelError {
                reason: format!(
                    "num_pool_stages ({}) must be <= num_decoder_blocks ({})",
                    self.num_pool_stages, self.num_decoder_blocks
                ),
            });
        }
        if self.num_dynamic_layers > self.num_pool_stages {
            return Err(Error::ModelError {
                reason: format!(
                    "num_dynamic_layers ({}) must be <= num_pool_stages ({})",
                    self.num_dynamic_layers, self.num_pool_stages
                ),
            });
        }
        if self.num_timesteps == 0 {
            return Err(Error::ModelError {
                reason: "num_timesteps must be > 0".into(),
            });
        }
        for (name, value) in [
            ("beta1_start", self.beta1_start),
            ("beta2_start", self.beta2_start),
        ] {
            if !(0.0..1.0).contains(&value) || value == 0.0 {
                return Err(Error::ModelError {
                    reason: format!("{name} must lie in (0, 1), got {value}"),
                });
            }
        }
        if self.object_error_threshold < 0.0 || self.background_error_threshold < 0.0 {
            return Err(Error::ModelError {
                reason: "error thresholds must be non-negative".into(),
            });
        }
        Ok(())
    }
}
