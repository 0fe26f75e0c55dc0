//! Diffusion-conditioned bidirectional state-space block.
//!
//! Architecture: input_proj → norm → {local conv branch, forward/backward
//! SSM branches} → timestep-gated blend → output_proj → norm → residual.

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::model::embedding::timestep_embedding;
use crate::model::ssm::{causal_conv, reverse_seq, SsmKernel};
use candle_core::Tensor;
use candle_nn::{
    conv1d, layer_norm, linear, Conv1d, Conv1dConfig, LayerNorm, Linear, Module, VarBuilder,
};

/// One denoising block over a token sequence.
///
/// The local branch is a pair of width-3 convolutions along the sequence; the
/// global branches convolve with materialized SSM impulse responses, one in
/// reading order and one over the reversed sequence. A gate derived from the
/// diffusion timestep blends the global branches in, scaled by the two
/// region noise levels.
pub struct DiffSsm {
    input_proj: Linear,
    output_proj: Linear,
    conv1: Conv1d,
    conv2: Conv1d,
    norm1: LayerNorm,
    norm2: LayerNorm,
    fwd: SsmKernel,
    bwd: SsmKernel,
    hidden_dim: usize,
}

impl DiffSsm {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let d = config.hidden_dim;
        let conv_cfg = Conv1dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            input_proj: linear(d, d, vb.pp("input_proj"))?,
            output_proj: linear(d, d, vb.pp("output_proj"))?,
            conv1: conv1d(d, d, 3, conv_cfg, vb.pp("conv1"))?,
            conv2: conv1d(d, d, 3, conv_cfg, vb.pp("conv2"))?,
            norm1: layer_norm(d, 1e-5, vb.pp("norm1"))?,
            norm2: layer_norm(d, 1e-5, vb.pp("norm2"))?,
            fwd: SsmKernel::new(config.ssm_dim, vb.pp("fwd_ssm"))?,
            bwd: SsmKernel::new(config.ssm_dim, vb.pp("bwd_ssm"))?,
            hidden_dim: d,
        })
    }

    /// `x: [B, L, D]`, `t: [B]` integer timesteps. Returns `[B, L, D]`.
    pub fn forward(&self, x: &Tensor, t: &Tensor, beta1: f64, beta2: f64) -> Result<Tensor> {
        let (b, l, _) = x.dims3().map_err(|_| Error::ModelError {
            reason: format!("DiffSsm expects [B, L, D] input, got {:?}", x.dims()),
        })?;
        if t.dims() != [b] {
            return Err(Error::ModelError {
                reason: format!("timestep batch {:?} does not match input batch {b}", t.dims()),
            });
        }

        // 1. Project and normalize: [B, L, D]
        let h = self.norm1.forward(&self.input_proj.forward(x)?)?;

        // 2. Local branch: conv → SiLU → conv along the sequence axis.
        let h_cf = h.transpose(1, 2)?.contiguous()?; // [B, D, L]
        let local = self.conv1.forward(&h_cf)?.silu()?;
        let local = self.conv2.forward(&local)?.transpose(1, 2)?.contiguous()?;

        // 3. Global branches: full-length SSM impulse responses, one per
        //    direction. The backward branch runs on the reversed sequence and
        //    is reversed back so positions line up.
        let fwd_kernel = self.fwd.materialize(l)?;
        let fwd_branch = causal_conv(&h, &fwd_kernel)?;
        let bwd_kernel = self.bwd.materialize(l)?;
        let bwd_branch = reverse_seq(&causal_conv(&reverse_seq(&h, 1)?, &bwd_kernel)?, 1)?;

        // 4. Timestep gate, per channel: [B, 1, D]
        let emb = timestep_embedding(t, self.hidden_dim)?;
        let gate = candle_nn::ops::sigmoid(&emb)?.unsqueeze(1)?;
        let blend = (fwd_branch.broadcast_mul(&(gate.clone() * beta1)?)?
            + bwd_branch.broadcast_mul(&(gate * beta2)?)?)?;
        let blend = (blend + local)?;

        // 5. Output projection and norm, then the residual connection.
        let out = self.norm2.forward(&self.output_proj.forward(&blend)?)?;
        Ok((x + out)?)
    }
}
