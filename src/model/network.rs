//! Full denoising network: patch embedding, dynamic-encoded SSM encoder and
//! decoder around shared pooling stages, and the mask prediction head.

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::model::diff_ssm::DiffSsm;
use crate::model::dynamic::DynamicEncoding;
use crate::model::pooling::BidirectionalPooling;
use candle_core::Tensor;
use candle_nn::init::Init;
use candle_nn::{
    conv2d, conv_transpose2d, Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig,
    Module, VarBuilder,
};

/// Camouflaged-object denoiser over a patch-token grid.
///
/// The encoder halves the grid side once per pooling stage and pushes each
/// pooled tensor onto a skip stack; the decoder mirrors it with the lifting
/// inverse, consuming skips both as dynamic-encoding direct features and as
/// additive fusion after each upsample.
pub struct CamoDiff {
    patch_conv1: Conv2d,
    patch_conv2: Conv2d,
    pos_embed: Tensor,
    encoder_blocks: Vec<DiffSsm>,
    encoder_dynamic: Vec<DynamicEncoding>,
    decoder_blocks: Vec<DiffSsm>,
    decoder_dynamic: Vec<DynamicEncoding>,
    pool_layers: Vec<BidirectionalPooling>,
    head_deconv: ConvTranspose2d,
    head_conv: Conv2d,
    config: ModelConfig,
}

impl CamoDiff {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let d = config.hidden_dim;
        let patch = config.patch_size;

        let stem_cfg = Conv2dConfig {
            stride: patch,
            ..Default::default()
        };
        let patch_conv1 = conv2d(
            config.in_channels,
            d,
            patch,
            stem_cfg,
            vb.pp("patch_embed.conv1"),
        )?;
        let patch_conv2 = conv2d(d, d, 1, Default::default(), vb.pp("patch_embed.conv2"))?;

        let pos_embed = vb.get_with_hints(
            (1, config.num_patches(), d),
            "pos_embed",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;

        let mut encoder_blocks = Vec::with_capacity(config.num_encoder_blocks);
        for i in 0..config.num_encoder_blocks {
            encoder_blocks.push(DiffSsm::new(config, vb.pp("encoder_blocks").pp(i))?);
        }
        let mut encoder_dynamic = Vec::with_capacity(config.num_dynamic_layers);
        for i in 0..config.num_dynamic_layers {
            encoder_dynamic.push(DynamicEncoding::new(config, vb.pp("encoder_dynamic").pp(i))?);
        }
        let mut decoder_blocks = Vec::with_capacity(config.num_decoder_blocks);
        for i in 0..config.num_decoder_blocks {
            decoder_blocks.push(DiffSsm::new(config, vb.pp("decoder_blocks").pp(i))?);
        }
        let mut decoder_dynamic = Vec::with_capacity(config.num_dynamic_layers);
        for i in 0..config.num_dynamic_layers {
            decoder_dynamic.push(DynamicEncoding::new(config, vb.pp("decoder_dynamic").pp(i))?);
        }
        let mut pool_layers = Vec::with_capacity(config.num_pool_stages);
        for i in 0..config.num_pool_stages {
            pool_layers.push(BidirectionalPooling::new(config, vb.pp("pool_layers").pp(i))?);
        }

        let head_cfg = ConvTranspose2dConfig {
            stride: patch,
            ..Default::default()
        };
        let head_deconv = conv_transpose2d(d, d, patch, head_cfg, vb.pp("pred_head.deconv"))?;
        let head_conv = conv2d(d, 1, 1, Default::default(), vb.pp("pred_head.conv"))?;

        Ok(Self {
            patch_conv1,
            patch_conv2,
            pos_embed,
            encoder_blocks,
            encoder_dynamic,
            decoder_blocks,
            decoder_dynamic,
            pool_layers,
            head_deconv,
            head_conv,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Denoise one batch. `x: [B, C, H, W]` with `H == W == img_size`,
    /// `t: [B]` integer timesteps; `beta1`/`beta2` default to the configured
    /// region noise levels. Returns a probability mask `[B, 1, H, W]`.
    pub fn forward(
        &self,
        x: &Tensor,
        t: &Tensor,
        beta1: Option<f64>,
        beta2: Option<f64>,
    ) -> Result<Tensor> {
        let beta1 = beta1.unwrap_or(self.config.beta1_start);
        let beta2 = beta2.unwrap_or(self.config.beta2_start);
        let (b, c, h, w) = x.dims4().map_err(|_| Error::ModelError {
            reason: format!("network expects [B, C, H, W] input, got {:?}", x.dims()),
        })?;
        if c != self.config.in_channels || h != self.config.img_size || w != self.config.img_size {
            return Err(Error::ModelError {
                reason: format!(
                    "expected [{}, {}, {}] images, got [{c}, {h}, {w}]",
                    self.config.in_channels, self.config.img_size, self.config.img_size
                ),
            });
        }

        // Stem: [B, C, H, W] -> [B, D, g, g] -> [B, g*g, D]
        let emb = self.patch_conv2.forward(&self.patch_conv1.forward(x)?.silu()?)?;
        let mut feat = emb.flatten_from(2)?.transpose(1, 2)?.contiguous()?;
        let mut pe = self
            .pos_embed
            .expand((b, self.config.num_patches(), self.config.hidden_dim))?;

        let mut side = self.config.grid_side();
        let mut skips: Vec<Tensor> = Vec::with_capacity(self.config.num_pool_stages);

        // Encoder: dynamic encoding on the early stages, one block per stage,
        // then a pooling stage that records its output as a skip.
        for i in 0..self.config.num_encoder_blocks {
            if i < self.encoder_dynamic.len() {
                let (f, p) = self.encoder_dynamic[i].forward(&feat, &pe, t, None)?;
                feat = f;
                pe = p;
            }
            feat = self.encoder_blocks[i].forward(&feat, t, beta1, beta2)?;
            if i < self.pool_layers.len() {
                let (f, p) = self.pool_layers[i].downsample(&feat, &pe, side)?;
                feat = f;
                pe = p;
                side /= 2;
                skips.push(feat.clone());
            }
        }

        // Decoder: dynamic encoding consumes skips as direct features (last
        // first); after each upsample the matching earlier skip fuses in.
        for i in 0..self.config.num_decoder_blocks {
            if i < self.decoder_dynamic.len() {
                let direct = &skips[skips.len() - 1 - i];
                let (f, p) = self.decoder_dynamic[i].forward(&feat, &pe, t, Some(direct))?;
                feat = f;
                pe = p;
            }
            feat = self.decoder_blocks[i].forward(&feat, t, beta1, beta2)?;
            if i < self.pool_layers.len() {
                let (f, p) = self.pool_layers[i].upsample(&feat, &pe, side)?;
                feat = f;
                pe = p;
                side *= 2;
                if skips.len() >= i + 2 {
                    feat = (feat + &skips[skips.len() - 2 - i])?;
                }
            }
        }

        // Head: back onto the grid, upsample to pixels, single-channel mask.
        let grid = feat
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, self.config.hidden_dim, side, side))?;
        let logits = self
            .head_conv
            .forward(&self.head_deconv.forward(&grid)?.silu()?)?;
        Ok(candle_nn::ops::sigmoid(&logits)?)
    }
}
