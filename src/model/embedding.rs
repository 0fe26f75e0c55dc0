//! Sinusoidal timestep embedding for diffusion conditioning.

use crate::error::{Error, Result};
use candle_core::{DType, Tensor};

/// Embed integer timesteps `t: [B]` into `[B, dim]` sinusoidal features.
///
/// Half the features are `sin(t * freq_i)`, half `cos(t * freq_i)`, with
/// log-spaced frequencies from 1 down to 1/10000. At `t = 0` the output is
/// `[0, .., 0, 1, .., 1]`. Odd `dim` gets one trailing zero column.
pub fn timestep_embedding(t: &Tensor, dim: usize) -> Result<Tensor> {
    if dim == 0 {
        return Err(Error::InvalidArgument {
            arg: "dim",
            reason: "embedding dimension must be > 0".into(),
        });
    }
    let device = t.device();
    let t = t.to_dtype(DType::F32)?;
    let b = t.dim(0)?;
    let half = dim / 2;
    if half == 0 {
        // dim == 1 leaves no room for a sin/cos pair, only the zero pad.
        let zeros = Tensor::zeros((b, 1), DType::F32, device)?;
        return Ok(zeros);
    }

    // freqs[i] = exp(-ln(10000) * i / (half - 1)); a single frequency stays 1.
    let denom = (half - 1).max(1) as f64;
    let freqs: Vec<f32> = (0..half)
        .map(|i| (-(10000f64.ln()) * i as f64 / denom).exp() as f32)
        .collect();
    let freqs = Tensor::new(freqs.as_slice(), device)?;

    // args = t[:, None] * freqs[None, :] -> [B, half]
    let args = t.unsqueeze(1)?.broadcast_mul(&freqs.unsqueeze(0)?)?;
    let emb = Tensor::cat(&[&args.sin()?, &args.cos()?], 1)?;

    if dim % 2 == 1 {
        let pad = Tensor::zeros((b, 1), DType::F32, device)?;
        Ok(Tensor::cat(&[&emb, &pad], 1)?)
    } else {
        Ok(emb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_zero_timestep_is_zeros_then_ones() {
        let dev = Device::Cpu;
        let t = Tensor::new(&[0u32], &dev).unwrap();
        let emb = timestep_embedding(&t, 6).unwrap();
        let values: Vec<f32> = emb.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_batch_shape() {
        let dev = Device::Cpu;
        let t = Tensor::new(&[0u32, 5, 99, 640], &dev).unwrap();
        let emb = timestep_embedding(&t, 192).unwrap();
        assert_eq!(emb.dims(), &[4, 192]);
    }

    #[test]
    fn test_odd_dim_pads_last_column_with_zero() {
        let dev = Device::Cpu;
        let t = Tensor::new(&[3u32, 17], &dev).unwrap();
        let emb = timestep_embedding(&t, 5).unwrap();
        assert_eq!(emb.dims(), &[2, 5]);
        let last: Vec<f32> = emb
            .narrow(1, 4, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(last, vec![0.0, 0.0]);
    }

    #[test]
    fn test_dim_two_uses_unit_frequency() {
        let dev = Device::Cpu;
        let t = Tensor::new(&[1u32], &dev).unwrap();
        let emb = timestep_embedding(&t, 2).unwrap();
        let values: Vec<f32> = emb.flatten_all().unwrap().to_vec1().unwrap();
        assert!((values[0] - 1f32.sin()).abs() < 1e-6);
        assert!((values[1] - 1f32.cos()).abs() < 1e-6);
    }

    #[test]
    fn test_zero_dim_is_rejected() {
        let dev = Device::Cpu;
        let t = Tensor::new(&[1u32], &dev).unwrap();
        assert!(timestep_embedding(&t, 0).is_err());
    }

    #[test]
    fn test_distinct_timesteps_produce_distinct_embeddings() {
        let dev = Device::Cpu;
        let a = timestep_embedding(&Tensor::new(&[10u32], &dev).unwrap(), 32).unwrap();
        let b = timestep_embedding(&Tensor::new(&[900u32], &dev).unwrap(), 32).unwrap();
        let diff: f32 = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff > 0.1);
    }
}
