//! Inverse divergence between object and background predictions.

use candle_core::{DType, Tensor};

use super::{complement, gaussian_kl, mean_all};
use crate::error::Result;

const EPSILON: f64 = 1e-6;

/// Reciprocal of the mean KL divergence between the predicted-noise
/// distributions restricted to the object and background regions.
///
/// Treats `pred * mask` and `pred * (1 - mask)` as Gaussian means with
/// spreads `sqrt(beta1)` and `sqrt(beta2)`. Minimizing the reciprocal drives
/// the two regions apart; an epsilon keeps it finite when they agree.
pub fn difference_loss(pred: &Tensor, mask: &Tensor, beta1: f64, beta2: f64) -> Result<Tensor> {
    let object = pred.broadcast_mul(mask)?;
    let background = pred.broadcast_mul(&complement(mask)?)?;
    let kl = mean_all(&gaussian_kl(&object, beta1.sqrt(), &background, beta2.sqrt())?)?;
    let denom = (kl + EPSILON)?;
    let one = (Tensor::zeros((), DType::F32, denom.device())? + 1.0)?;
    Ok((one / denom)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_agreeing_regions_hit_the_epsilon_cap() {
        let device = Device::Cpu;
        let pred = Tensor::zeros((1, 1, 2, 2), DType::F32, &device).unwrap();
        let mask = Tensor::from_vec(vec![1f32, 0.0, 1.0, 0.0], (1, 1, 2, 2), &device).unwrap();

        // Equal spreads and identical zero means: the divergence vanishes and
        // only the epsilon keeps the reciprocal finite.
        let loss = difference_loss(&pred, &mask, 0.5, 0.5).unwrap();
        let val = loss.to_scalar::<f32>().unwrap();
        assert!((val - 1e6).abs() / 1e6 < 1e-3, "loss={val}, expected 1e6");
    }

    #[test]
    fn test_unequal_spreads() {
        let device = Device::Cpu;
        let pred = Tensor::zeros((1, 1, 2, 2), DType::F32, &device).unwrap();
        let mask = Tensor::from_vec(vec![1f32, 0.0, 1.0, 0.0], (1, 1, 2, 2), &device).unwrap();

        let loss = difference_loss(&pred, &mask, 0.18, 0.5).unwrap();
        let val = loss.to_scalar::<f32>().unwrap();
        // kl = 0.5 ln(0.5/0.18) + 0.18/(2 * 0.5) - 0.5 = 0.190826
        let expected = 1.0 / (0.190826 + 1e-6);
        assert!(
            (val - expected as f32).abs() < 1e-2,
            "loss={val}, expected {expected}"
        );
    }

    #[test]
    fn test_separated_regions_cost_less() {
        let device = Device::Cpu;
        let mask = Tensor::from_vec(vec![1f32, 1.0, 0.0, 0.0], (1, 1, 2, 2), &device).unwrap();
        let close = Tensor::from_vec(vec![0.1f32, 0.1, 0.1, 0.1], (1, 1, 2, 2), &device).unwrap();
        let apart = Tensor::from_vec(vec![2f32, 2.0, -2.0, -2.0], (1, 1, 2, 2), &device).unwrap();

        let close_loss = difference_loss(&close, &mask, 0.5, 0.5)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let apart_loss = difference_loss(&apart, &mask, 0.5, 0.5)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(
            apart_loss < close_loss,
            "separated regions should cost less: {apart_loss} vs {close_loss}"
        );
    }
}
