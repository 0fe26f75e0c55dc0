//! Variational bound surrogate on the noisy state.

use candle_core::{DType, Tensor};

use super::{gaussian_kl, mean_all};
use crate::error::Result;

/// Mean KL divergence between the noisy state, treated as a Gaussian with
/// spread `sqrt(beta1 + beta2)`, and the standard normal.
pub fn variational_bound_loss(noisy: &Tensor, beta1: f64, beta2: f64) -> Result<Tensor> {
    let zero = Tensor::zeros(noisy.dims(), DType::F32, noisy.device())?;
    let kl = gaussian_kl(noisy, (beta1 + beta2).sqrt(), &zero, 1.0)?;
    mean_all(&kl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_standard_normal_state_costs_nothing() {
        let device = Device::Cpu;
        let noisy = Tensor::zeros((1, 3, 2, 2), DType::F32, &device).unwrap();
        let loss = variational_bound_loss(&noisy, 0.5, 0.5).unwrap();
        let val = loss.to_scalar::<f32>().unwrap();
        // Spread sqrt(0.5 + 0.5) = 1 and mean 0 match the reference exactly.
        assert!(val.abs() < 1e-6, "vlb={val}, expected 0");
    }

    #[test]
    fn test_wider_spread_is_penalized() {
        let device = Device::Cpu;
        let noisy = Tensor::zeros((1, 3, 2, 2), DType::F32, &device).unwrap();
        let loss = variational_bound_loss(&noisy, 0.9, 0.9).unwrap();
        let val = loss.to_scalar::<f32>().unwrap();
        // ln(1/sqrt(1.8)) + 1.8/2 - 0.5 = 0.106106
        assert!((val - 0.106106).abs() < 1e-5, "vlb={val}");
    }

    #[test]
    fn test_shifted_mean_is_penalized() {
        let device = Device::Cpu;
        let noisy = Tensor::from_vec(vec![1f32; 12], (1, 3, 2, 2), &device).unwrap();
        let loss = variational_bound_loss(&noisy, 0.5, 0.5).unwrap();
        let val = loss.to_scalar::<f32>().unwrap();
        // ln(1) + (1 + 1)/2 - 0.5 = 0.5
        assert!((val - 0.5).abs() < 1e-6, "vlb={val}, expected 0.5");
    }
}
