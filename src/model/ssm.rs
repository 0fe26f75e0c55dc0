//! Learned state-space kernels and the causal convolutions that apply them.

use crate::error::{Error, Result};
use candle_core::Tensor;
use candle_nn::init::Init;
use candle_nn::VarBuilder;

/// A linear state-space system `x' = A x + B u, y = C x + D u` whose impulse
/// response is materialized as an explicit convolution kernel.
///
/// `A` is stored as a full `[n, n]` matrix but acts through its diagonal only:
/// the transition applied at step `k` is `diag(exp(diag(A)))^k`. Off-diagonal
/// entries carry no signal. Exponentiating raw entries does not guarantee a
/// contraction, so long kernels can grow; the learned values keep this in
/// check.
#[derive(Debug, Clone)]
pub struct SsmKernel {
    a: Tensor,
    b: Tensor,
    c: Tensor,
    d: Tensor,
    state_dim: usize,
}

impl SsmKernel {
    pub fn new(state_dim: usize, vb: VarBuilder) -> Result<Self> {
        if state_dim == 0 {
            return Err(Error::InvalidArgument {
                arg: "state_dim",
                reason: "state dimension must be > 0".into(),
            });
        }
        let init = Init::Randn {
            mean: 0.0,
            stdev: 0.01,
        };
        let a = vb.get_with_hints((state_dim, state_dim), "a", init)?;
        let b = vb.get_with_hints((state_dim, 1), "b", init)?;
        let c = vb.get_with_hints((1, state_dim), "c", init)?;
        let d = vb.get_with_hints(1, "d", init)?;
        Ok(Self {
            a,
            b,
            c,
            d,
            state_dim,
        })
    }

    /// Impulse response of the system over `len` steps:
    /// `kernel[k] = sum_i C[0,i] * exp(A[i,i])^k * B[i,0] + D`.
    pub fn materialize(&self, len: usize) -> Result<Tensor> {
        if len == 0 {
            return Err(Error::InvalidArgument {
                arg: "len",
                reason: "kernel length must be > 0".into(),
            });
        }
        let device = self.a.device();
        let n = self.state_dim;

        // Pull the diagonal out of the flattened matrix.
        let diag_idx: Vec<u32> = (0..n).map(|i| (i * (n + 1)) as u32).collect();
        let diag_idx = Tensor::from_vec(diag_idx, n, device)?;
        let diag_a = self.a.flatten_all()?.index_select(&diag_idx, 0)?;

        // exp(A_ii)^k == exp(k * A_ii); build [len, n] in one shot.
        let steps = Tensor::arange(0f32, len as f32, device)?;
        let powers = steps
            .unsqueeze(1)?
            .broadcast_mul(&diag_a.unsqueeze(0)?)?
            .exp()?;

        // [len, n] @ [n, 1] -> [len, 1], then the D passthrough.
        let bc = (self.b.flatten_all()? * self.c.flatten_all()?)?;
        let kernel = powers.matmul(&bc.unsqueeze(1)?)?;
        Ok(kernel.squeeze(1)?.broadcast_add(&self.d)?)
    }
}

/// Causal depthwise convolution of `x: [B, L, D]` with a shared `kernel: [K]`.
///
/// Left-pads by `K - 1` and keeps the first `L` outputs, so position `t` only
/// sees inputs at `t` and earlier. The kernel is broadcast across channels.
pub fn causal_conv(x: &Tensor, kernel: &Tensor) -> Result<Tensor> {
    let (_, l, d) = x.dims3()?;
    let k = kernel.dim(0)?;
    if k == 0 {
        return Err(Error::InvalidArgument {
            arg: "kernel",
            reason: "kernel must not be empty".into(),
        });
    }
    let weight = kernel.reshape((1, 1, k))?.expand((d, 1, k))?.contiguous()?;
    let h = x.transpose(1, 2)?.contiguous()?;
    let y = h.conv1d(&weight, k - 1, 1, 1, d)?;
    let y = y.narrow(2, 0, l)?;
    Ok(y.transpose(1, 2)?.contiguous()?)
}

/// Reverse a tensor along `dim` by index-selecting descending positions.
pub fn reverse_seq(x: &Tensor, dim: usize) -> Result<Tensor> {
    let n = x.dim(dim)?;
    let idx: Vec<u32> = (0..n as u32).rev().collect();
    let idx = Tensor::from_vec(idx, n, x.device())?;
    Ok(x.index_select(&idx, dim)?)
}
