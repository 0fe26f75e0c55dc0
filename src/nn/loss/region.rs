//! Region-weighted noise reconstruction loss.

use candle_core::Tensor;

use super::{complement, mean_all};
use crate::error::Result;

/// Mean squared error between predicted and target noise, split into object
/// and background regions by a binary mask and weighted by the per-region
/// noise levels.
///
/// - `pred`: `[B, 1, H, W]` predicted noise
/// - `target`: `[B, C, H, W]` target noise (broadcast against `pred`)
/// - `mask`: `[B, 1, H, W]` binary object mask
///
/// Returns `beta1 * mse(pred * mask, target * mask) + beta2 *
/// mse(pred * (1 - mask), target * (1 - mask))`. Both means run over every
/// element, so an empty region contributes exactly zero.
pub fn region_weighted_mse(
    pred: &Tensor,
    target: &Tensor,
    mask: &Tensor,
    beta1: f64,
    beta2: f64,
) -> Result<Tensor> {
    let background = complement(mask)?;
    let object_loss = masked_mse(pred, target, mask)?;
    let background_loss = masked_mse(pred, target, &background)?;
    Ok(((object_loss * beta1)? + (background_loss * beta2)?)?)
}

fn masked_mse(pred: &Tensor, target: &Tensor, region: &Tensor) -> Result<Tensor> {
    let p = pred.broadcast_mul(region)?;
    let t = target.broadcast_mul(region)?;
    let diff = t.broadcast_sub(&p)?;
    mean_all(&diff.sqr()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_zero_when_prediction_matches() {
        let device = Device::Cpu;
        let pred = Tensor::from_vec(vec![0.1f32, 0.7, -0.3, 0.4], (1, 1, 2, 2), &device).unwrap();
        let mask = Tensor::from_vec(vec![1f32, 0.0, 1.0, 0.0], (1, 1, 2, 2), &device).unwrap();

        let loss = region_weighted_mse(&pred, &pred, &mask, 0.5, 0.5).unwrap();
        let val = loss.to_scalar::<f32>().unwrap();
        assert!(val.abs() < 1e-7, "matching prediction should cost 0, got {val}");
    }

    #[test]
    fn test_all_ones_mask_drops_background_term() {
        let device = Device::Cpu;
        let pred = Tensor::from_vec(vec![1f32, 0.0, 1.0, 0.0], (1, 1, 2, 2), &device).unwrap();
        let target = Tensor::zeros((1, 1, 2, 2), candle_core::DType::F32, &device).unwrap();
        let mask = Tensor::from_vec(vec![1f32; 4], (1, 1, 2, 2), &device).unwrap();

        let loss = region_weighted_mse(&pred, &target, &mask, 0.5, 0.7).unwrap();
        let val = loss.to_scalar::<f32>().unwrap();
        // Object term: 0.5 * mean([1, 0, 1, 0]) = 0.25; background is empty.
        assert!(val.is_finite());
        assert!((val - 0.25).abs() < 1e-6, "loss={val}, expected 0.25");
    }

    #[test]
    fn test_regions_weighted_separately() {
        let device = Device::Cpu;
        let pred = Tensor::from_vec(vec![1f32; 4], (1, 1, 2, 2), &device).unwrap();
        let target = Tensor::zeros((1, 1, 2, 2), candle_core::DType::F32, &device).unwrap();
        let mask = Tensor::from_vec(vec![1f32, 1.0, 0.0, 0.0], (1, 1, 2, 2), &device).unwrap();

        let loss = region_weighted_mse(&pred, &target, &mask, 0.8, 0.2).unwrap();
        let val = loss.to_scalar::<f32>().unwrap();
        // Each region keeps two of four ones: 0.8 * 0.5 + 0.2 * 0.5 = 0.5.
        assert!((val - 0.5).abs() < 1e-6, "loss={val}, expected 0.5");
    }
}
