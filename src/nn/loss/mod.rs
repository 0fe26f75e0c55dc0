//! Loss terms for denoising training.
//!
//! | Function | Use case |
//! |---|---|
//! | [`region_weighted_mse`] | Noise reconstruction, weighted per mask region |
//! | [`variational_bound_loss`] | KL surrogate on the noisy state |
//! | [`difference_loss`] | Pushes object and background predictions apart |
//! | [`total_loss`] | Sum of the three, with per-term breakdown |

pub mod difference;
pub mod region;
pub mod vlb;

pub use difference::difference_loss;
pub use region::region_weighted_mse;
pub use vlb::variational_bound_loss;

use candle_core::Tensor;

use crate::error::{Error, Result};

/// Per-term values of the composite training loss.
#[derive(Debug, Clone, Copy)]
pub struct LossBreakdown {
    pub sample: f32,
    pub vlb: f32,
    pub diff: f32,
}

/// Pointwise KL divergence between two diagonal Gaussians with scalar
/// spreads: `ln(s2/s1) + (s1^2 + (m1 - m2)^2) / (2 s2^2) - 1/2`.
pub fn gaussian_kl(mean1: &Tensor, std1: f64, mean2: &Tensor, std2: f64) -> Result<Tensor> {
    let shift = (std2 / std1).ln() - 0.5;
    let diff = mean1.broadcast_sub(mean2)?;
    let scaled = ((diff.sqr()? + std1 * std1)? * (1.0 / (2.0 * std2 * std2)))?;
    Ok((scaled + shift)?)
}

/// Composite loss over one denoising step.
///
/// - `pred`: `[B, 1, H, W]` predicted noise
/// - `target`: `[B, C, H, W]` target noise (broadcast against `pred`)
/// - `mask`: `[B, 1, H, W]` binary object mask
/// - `noisy`: `[B, C, H, W]` the diffused input the prediction was made from
///
/// Returns the differentiable total together with the detached per-term
/// values.
pub fn total_loss(
    pred: &Tensor,
    target: &Tensor,
    mask: &Tensor,
    beta1: f64,
    beta2: f64,
    noisy: &Tensor,
) -> Result<(Tensor, LossBreakdown)> {
    if beta1 <= 0.0 || beta2 <= 0.0 {
        return Err(Error::InvalidArgument {
            arg: "beta",
            reason: format!("noise levels must be positive, got {beta1} and {beta2}"),
        });
    }
    let (b, _, h, w) = pred.dims4()?;
    for (name, t) in [("target", target), ("mask", mask), ("noisy", noisy)] {
        let (tb, _, th, tw) = t.dims4()?;
        if tb != b || th != h || tw != w {
            return Err(Error::InvalidArgument {
                arg: "shapes",
                reason: format!(
                    "{name} shape {:?} does not line up with prediction shape {:?}",
                    t.dims(),
                    pred.dims()
                ),
            });
        }
    }

    let sample = region_weighted_mse(pred, target, mask, beta1, beta2)?;
    let vlb = variational_bound_loss(noisy, beta1, beta2)?;
    let diff = difference_loss(pred, mask, beta1, beta2)?;

    let breakdown = LossBreakdown {
        sample: sample.to_scalar::<f32>()?,
        vlb: vlb.to_scalar::<f32>()?,
        diff: diff.to_scalar::<f32>()?,
    };
    let total = ((sample + vlb)? + diff)?;
    Ok((total, breakdown))
}

/// Scalar mean over every element, kept as a graph node.
fn mean_all(t: &Tensor) -> Result<Tensor> {
    let count: usize = t.dims().iter().product();
    Ok((t.sum_all()? * (1.0 / count as f64))?)
}

/// `1 - mask`, selecting the background region.
fn complement(mask: &Tensor) -> Result<Tensor> {
    Ok(((mask * -1.0)? + 1.0)?)
}
