//! Dynamic encoding: quadrant-partitioned state-space passes with
//! timestep-recalibrated positional encodings.

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::model::embedding::timestep_embedding;
use crate::model::ssm::{causal_conv, reverse_seq, SsmKernel};
use candle_core::Tensor;
use candle_nn::{linear, Linear, Module, VarBuilder};

/// Two-layer pointwise net with SiLU between, `in_dim -> dim -> dim`.
struct TwoLayer {
    fc1: Linear,
    fc2: Linear,
}

impl TwoLayer {
    fn new(in_dim: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(in_dim, dim, vb.pp("fc1"))?,
            fc2: linear(dim, dim, vb.pp("fc2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.fc2.forward(&self.fc1.forward(x)?.silu()?)?)
    }
}

/// Encoding layer that splits the token grid into four quadrants, runs a
/// forward and a backward state-space pass over each, and recombines them,
/// optionally together with a direct (skip) feature.
///
/// The positional encoding is refreshed from the diffusion timestep on every
/// call; each quadrant additionally gets a recalibrated encoding tagged with
/// a constant quadrant marker (0, 1/4, 1/2, 3/4).
pub struct DynamicEncoding {
    recal: TwoLayer,
    combine3: TwoLayer,
    combine2: TwoLayer,
    fwd: SsmKernel,
    bwd: SsmKernel,
    hidden_dim: usize,
}

impl DynamicEncoding {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let d = config.hidden_dim;
        Ok(Self {
            recal: TwoLayer::new(2 * d, d, vb.pp("recal"))?,
            combine3: TwoLayer::new(3 * d, d, vb.pp("combine3"))?,
            combine2: TwoLayer::new(2 * d, d, vb.pp("combine2"))?,
            fwd: SsmKernel::new(config.ssm_dim, vb.pp("fwd_ssm"))?,
            bwd: SsmKernel::new(config.ssm_dim, vb.pp("bwd_ssm"))?,
            hidden_dim: d,
        })
    }

    /// Side length of the token grid, or an error if `n` cannot form one.
    fn grid_side(n: usize) -> Result<usize> {
        let side = (n as f64).sqrt().round() as usize;
        if side * side != n {
            return Err(Error::ModelError {
                reason: format!(
                    "dynamic encoding requires a perfect-square token count, got {n}"
                ),
            });
        }
        if side < 2 || side % 2 != 0 {
            return Err(Error::ModelError {
                reason: format!("dynamic encoding requires an even grid side, got {side}"),
            });
        }
        Ok(side)
    }

    /// Split `z`/`pe` into TL, TR, BL, BR quadrant sequences. Each quadrant's
    /// positional encoding is recalibrated against its constant marker
    /// channel `i/4` broadcast to the full width.
    fn quad_split(&self, z: &Tensor, pe: &Tensor) -> Result<Vec<(Tensor, Tensor)>> {
        let (b, n, d) = z.dims3()?;
        let side = Self::grid_side(n)?;
        let mid = side / 2;
        let device = z.device();

        let zg = z.reshape((b, side, side, d))?;
        let pg = pe.reshape((b, side, side, d))?;
        // (row offset, column offset) in TL, TR, BL, BR order
        let offsets = [(0, 0), (0, mid), (mid, 0), (mid, mid)];

        let mut out = Vec::with_capacity(4);
        for (i, (row, col)) in offsets.iter().enumerate() {
            let qx = zg
                .narrow(1, *row, mid)?
                .narrow(2, *col, mid)?
                .contiguous()?
                .reshape((b, mid * mid, d))?;
            let qp = pg
                .narrow(1, *row, mid)?
                .narrow(2, *col, mid)?
                .contiguous()?
                .reshape((b, mid * mid, d))?;
            let marker = Tensor::full(i as f32 / 4.0, (b, mid * mid, d), device)?;
            let qp = self.recal.forward(&Tensor::cat(&[&qp, &marker], 2)?)?;
            out.push((qx, qp));
        }
        Ok(out)
    }

    /// `z, pe: [B, N, D]` with `N` a perfect square; `t: [B]`;
    /// `direct: [B, N, D]` when a skip connection feeds this layer.
    /// Returns the combined features and the refreshed positional encoding.
    pub fn forward(
        &self,
        z: &Tensor,
        pe: &Tensor,
        t: &Tensor,
        direct: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let (b, n, d) = z.dims3().map_err(|_| Error::ModelError {
            reason: format!("dynamic encoding expects [B, N, D] input, got {:?}", z.dims()),
        })?;
        if pe.dims() != z.dims() {
            return Err(Error::ModelError {
                reason: format!(
                    "positional encoding shape {:?} does not match features {:?}",
                    pe.dims(),
                    z.dims()
                ),
            });
        }

        let quads = self.quad_split(z, pe)?;
        let quad_len = quads[0].0.dim(1)?;
        let fwd_kernel = self.fwd.materialize(quad_len)?;
        let bwd_kernel = self.bwd.materialize(quad_len)?;

        let mut fwd_parts = Vec::with_capacity(4);
        let mut bwd_parts = Vec::with_capacity(4);
        for (qx, _qp) in &quads {
            fwd_parts.push(causal_conv(qx, &fwd_kernel)?);
            let rev = reverse_seq(qx, 1)?;
            bwd_parts.push(reverse_seq(&causal_conv(&rev, &bwd_kernel)?, 1)?);
        }
        let fwd_combined = Tensor::cat(&fwd_parts, 1)?;
        let bwd_combined = Tensor::cat(&bwd_parts, 1)?;

        let combined = match direct {
            Some(direct) => {
                if direct.dims() != z.dims() {
                    return Err(Error::ModelError {
                        reason: format!(
                            "direct feature shape {:?} does not match features {:?}",
                            direct.dims(),
                            z.dims()
                        ),
                    });
                }
                let cat = Tensor::cat(&[&fwd_combined, &bwd_combined, direct], 2)?;
                self.combine3.forward(&cat)?
            }
            None => {
                let cat = Tensor::cat(&[&fwd_combined, &bwd_combined], 2)?;
                self.combine2.forward(&cat)?
            }
        };

        // Whole-tensor refresh: the encoding tracks the diffusion time.
        let t_emb = timestep_embedding(t, self.hidden_dim)?
            .unsqueeze(1)?
            .expand((b, n, d))?;
        let new_pe = self.recal.forward(&Tensor::cat(&[pe, &t_emb], 2)?)?;

        Ok((combined, new_pe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn test_config() -> ModelConfig {
        ModelConfig::default()
            .with_img_size(32)
            .with_patch_size(2)
            .with_hidden_dim(8)
            .with_expanded_dim(16)
            .with_ssm_dim(4)
    }

    fn test_layer(dev: &Device) -> DynamicEncoding {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        DynamicEncoding::new(&test_config(), vb.pp("dyn")).unwrap()
    }

    #[test]
    fn test_fails_on_non_square_token_count() {
        let dev = Device::Cpu;
        let layer = test_layer(&dev);
        let z = Tensor::randn(0f32, 1.0, (1, 15, 8), &dev).unwrap();
        let pe = Tensor::randn(0f32, 1.0, (1, 15, 8), &dev).unwrap();
        let t = Tensor::new(&[0u32], &dev).unwrap();
        let err = layer.forward(&z, &pe, &t, None).unwrap_err();
        assert!(err.to_string().contains("15"));
    }

    #[test]
    fn test_fails_on_odd_grid_side() {
        let dev = Device::Cpu;
        let layer = test_layer(&dev);
        let z = Tensor::randn(0f32, 1.0, (1, 9, 8), &dev).unwrap();
        let pe = Tensor::randn(0f32, 1.0, (1, 9, 8), &dev).unwrap();
        let t = Tensor::new(&[0u32], &dev).unwrap();
        assert!(layer.forward(&z, &pe, &t, None).is_err());
    }

    #[test]
    fn test_output_shapes_without_direct() {
        let dev = Device::Cpu;
        let layer = test_layer(&dev);
        let z = Tensor::randn(0f32, 1.0, (2, 16, 8), &dev).unwrap();
        let pe = Tensor::randn(0f32, 1.0, (2, 16, 8), &dev).unwrap();
        let t = Tensor::new(&[5u32, 900], &dev).unwrap();
        let (out, new_pe) = layer.forward(&z, &pe, &t, None).unwrap();
        assert_eq!(out.dims(), &[2, 16, 8]);
        assert_eq!(new_pe.dims(), &[2, 16, 8]);
    }

    #[test]
    fn test_output_shapes_with_direct() {
        let dev = Device::Cpu;
        let layer = test_layer(&dev);
        let z = Tensor::randn(0f32, 1.0, (1, 16, 8), &dev).unwrap();
        let pe = Tensor::randn(0f32, 1.0, (1, 16, 8), &dev).unwrap();
        let direct = Tensor::randn(0f32, 1.0, (1, 16, 8), &dev).unwrap();
        let t = Tensor::new(&[100u32], &dev).unwrap();
        let (out, _) = layer.forward(&z, &pe, &t, Some(&direct)).unwrap();
        assert_eq!(out.dims(), &[1, 16, 8]);
    }

    #[test]
    fn test_rejects_mismatched_direct() {
        let dev = Device::Cpu;
        let layer = test_layer(&dev);
        let z = Tensor::randn(0f32, 1.0, (1, 16, 8), &dev).unwrap();
        let pe = Tensor::randn(0f32, 1.0, (1, 16, 8), &dev).unwrap();
        let direct = Tensor::randn(0f32, 1.0, (1, 4, 8), &dev).unwrap();
        let t = Tensor::new(&[0u32], &dev).unwrap();
        assert!(layer.forward(&z, &pe, &t, Some(&direct)).is_err());
    }

    #[test]
    fn test_quadrant_markers_separate_identical_encodings() {
        let dev = Device::Cpu;
        let layer = test_layer(&dev);
        // With a constant pe, the marker channel is the only thing that can
        // tell quadrants apart after recalibration.
        let z = Tensor::randn(0f32, 1.0, (1, 16, 8), &dev).unwrap();
        let pe = Tensor::ones((1, 16, 8), DType::F32, &dev).unwrap();
        let quads = layer.quad_split(&z, &pe).unwrap();
        let tl = &quads[0].1;
        let tr = &quads[1].1;
        let diff: f32 = (tl - tr)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff > 1e-7);
    }
}
