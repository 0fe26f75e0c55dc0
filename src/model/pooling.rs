//! Reversible lifting-scheme pooling over token sequences and grids.
//!
//! The 1-D transform splits a sequence at its midpoint, predicts the second
//! half from the first, and carries `(smooth, detail)` halves that invert
//! exactly. A pooling stage applies the transform once per grid axis, so a
//! square token grid keeps a square shape at every scale.

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use candle_core::Tensor;
use candle_nn::{conv1d, Conv1d, Conv1dConfig, Module, VarBuilder};

/// Conv → SiLU → Conv over channel-first sequences.
struct ConvNet {
    conv1: Conv1d,
    conv2: Conv1d,
}

impl ConvNet {
    fn new(
        in_c: usize,
        out_c: usize,
        kernel: usize,
        padding: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = Conv1dConfig {
            padding,
            ..Default::default()
        };
        Ok(Self {
            conv1: conv1d(in_c, out_c, kernel, cfg, vb.pp("conv1"))?,
            conv2: conv1d(out_c, out_c, kernel, cfg, vb.pp("conv2"))?,
        })
    }

    /// Apply to a `[B, L, C]` sequence, transposing around the convs.
    fn forward_seq(&self, x: &Tensor) -> Result<Tensor> {
        let h = x.transpose(1, 2)?.contiguous()?;
        let h = self.conv2.forward(&self.conv1.forward(&h)?.silu()?)?;
        Ok(h.transpose(1, 2)?.contiguous()?)
    }
}

/// Lifting-scheme pooling with learned predict/update/merge networks.
pub struct BidirectionalPooling {
    predict: ConvNet,
    update: ConvNet,
    merge: ConvNet,
}

impl BidirectionalPooling {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let d = config.hidden_dim;
        Ok(Self {
            predict: ConvNet::new(d, d, 3, 1, vb.pp("predict"))?,
            update: ConvNet::new(d, d, 3, 1, vb.pp("update"))?,
            merge: ConvNet::new(2 * d, d, 1, 0, vb.pp("merge"))?,
        })
    }

    /// Lifting split of `x: [B, L, D]` into `(smooth, detail)`, each
    /// `[B, L/2, D]`. `loc` offsets enter the detail half as
    /// `loc_first - loc_second`; odd `L` is rejected.
    pub fn lift(&self, x: &Tensor, loc: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let (_, l, _) = x.dims3().map_err(|_| Error::ModelError {
            reason: format!("pooling expects [B, L, D] input, got {:?}", x.dims()),
        })?;
        if l % 2 != 0 {
            return Err(Error::ModelError {
                reason: format!("pooling received odd sequence length {l}"),
            });
        }
        let mid = l / 2;
        let x_t = x.narrow(1, 0, mid)?;
        let x_0 = x.narrow(1, mid, mid)?;

        let pred = self.predict.forward_seq(&x_t)?;
        let mut detail = (x_0 - pred)?;
        if let Some(loc) = loc {
            if loc.dims() != x.dims() {
                return Err(Error::ModelError {
                    reason: format!(
                        "location shape {:?} does not match input {:?}",
                        loc.dims(),
                        x.dims()
                    ),
                });
            }
            let loc_t = loc.narrow(1, 0, mid)?;
            let loc_0 = loc.narrow(1, mid, mid)?;
            detail = (detail + (loc_t - loc_0)?)?;
        }
        let smooth = (x_t + self.update.forward_seq(&detail)?)?;
        Ok((smooth, detail))
    }

    /// Pooled representation `[B, L/2, D]`: the merged smooth/detail halves.
    pub fn forward(&self, x: &Tensor, loc: Option<&Tensor>) -> Result<Tensor> {
        let (smooth, detail) = self.lift(x, loc)?;
        self.merge.forward_seq(&Tensor::cat(&[&smooth, &detail], 2)?)
    }

    /// Exact inverse of [`lift`](Self::lift): recovers the first half before
    /// re-running `predict` on it, so `inverse(lift(x)) == x` when no
    /// location tensor was supplied.
    pub fn inverse(&self, smooth: &Tensor, detail: &Tensor) -> Result<Tensor> {
        if smooth.dims() != detail.dims() {
            return Err(Error::ModelError {
                reason: format!(
                    "smooth {:?} and detail {:?} halves disagree",
                    smooth.dims(),
                    detail.dims()
                ),
            });
        }
        let x_t = (smooth - self.update.forward_seq(detail)?)?;
        let pred = self.predict.forward_seq(&x_t)?;
        let x_0 = (pred + detail)?;
        Ok(Tensor::cat(&[&x_t, &x_0], 1)?)
    }

    /// Fold the trailing grid axis of `[B, H, W, D]` into the batch and apply
    /// `f` to the feature/encoding pair as `[B*W, H, D]` sequences, then
    /// unfold. `f` may change the sequence length.
    fn map_rows<F>(&self, gx: &Tensor, gp: &Tensor, f: F) -> Result<(Tensor, Tensor)>
    where
        F: Fn(&Tensor, &Tensor) -> Result<(Tensor, Tensor)>,
    {
        let (b, h, w, d) = gx.dims4()?;
        let fold = |g: &Tensor| -> Result<Tensor> {
            Ok(g.permute((0, 2, 1, 3))?.contiguous()?.reshape((b * w, h, d))?)
        };
        let (x_out, p_out) = f(&fold(gx)?, &fold(gp)?)?;
        let unfold = |g: &Tensor| -> Result<Tensor> {
            let h_out = g.dim(1)?;
            Ok(g.reshape((b, w, h_out, d))?
                .permute((0, 2, 1, 3))?
                .contiguous()?)
        };
        Ok((unfold(&x_out)?, unfold(&p_out)?))
    }

    /// One pooling stage down: `[B, side^2, D] -> [B, (side/2)^2, D]` for both
    /// features and positional encoding. The transform runs once per grid
    /// axis with the folded encoding as its location tensor; the encoding
    /// itself is averaged rather than lifted.
    pub fn downsample(&self, x: &Tensor, pe: &Tensor, side: usize) -> Result<(Tensor, Tensor)> {
        let (b, n, d) = x.dims3()?;
        if n != side * side {
            return Err(Error::ModelError {
                reason: format!("downsample expected {side}x{side} grid, got {n} tokens"),
            });
        }
        let mut gx = x.reshape((b, side, side, d))?;
        let mut gp = pe.reshape((b, side, side, d))?;
        for _ in 0..2 {
            let (nx, np) = self.map_rows(&gx, &gp, |xs, ps| {
                Ok((self.forward(xs, Some(ps))?, halve_avg(ps)?))
            })?;
            gx = nx.transpose(1, 2)?.contiguous()?;
            gp = np.transpose(1, 2)?.contiguous()?;
        }
        let half = side / 2;
        Ok((
            gx.reshape((b, half * half, d))?,
            gp.reshape((b, half * half, d))?,
        ))
    }

    /// One pooling stage up: `[B, side^2, D] -> [B, (2*side)^2, D]`, the
    /// mirror of [`downsample`](Self::downsample). Features run through the
    /// lifting inverse with a zero detail half; the encoding is duplicated.
    pub fn upsample(&self, x: &Tensor, pe: &Tensor, side: usize) -> Result<(Tensor, Tensor)> {
        let (b, n, d) = x.dims3()?;
        if n != side * side {
            return Err(Error::ModelError {
                reason: format!("upsample expected {side}x{side} grid, got {n} tokens"),
            });
        }
        let mut gx = x.reshape((b, side, side, d))?;
        let mut gp = pe.reshape((b, side, side, d))?;
        for _ in 0..2 {
            gx = gx.transpose(1, 2)?.contiguous()?;
            gp = gp.transpose(1, 2)?.contiguous()?;
            let (nx, np) = self.map_rows(&gx, &gp, |xs, ps| {
                let zeros = xs.zeros_like()?;
                Ok((self.inverse(xs, &zeros)?, duplicate(ps)?))
            })?;
            gx = nx;
            gp = np;
        }
        let double = side * 2;
        Ok((
            gx.reshape((b, double * double, d))?,
            gp.reshape((b, double * double, d))?,
        ))
    }
}

fn halve_avg(seq: &Tensor) -> Result<Tensor> {
    let l = seq.dim(1)?;
    if l % 2 != 0 {
        return Err(Error::ModelError {
            reason: format!("pooling received odd sequence length {l}"),
        });
    }
    let mid = l / 2;
    let first = seq.narrow(1, 0, mid)?;
    let second = seq.narrow(1, mid, mid)?;
    Ok(((first + second)? * 0.5)?)
}

fn duplicate(seq: &Tensor) -> Result<Tensor> {
    Ok(Tensor::cat(&[seq, seq], 1)?)
}
