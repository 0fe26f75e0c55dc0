//! Iterative reverse-process sampling with cooperative early termination.

use candle_core::Tensor;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::model::CamoDiff;

use super::schedule::NoiseSchedule;

/// Reverse-process sampler that refines Gaussian noise into a mask.
#[derive(Debug, Clone)]
pub struct Sampler {
    schedule: NoiseSchedule,
    beta1_start: f64,
    object_error_threshold: f64,
}

impl Sampler {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        Ok(Self {
            schedule: NoiseSchedule::new(config)?,
            beta1_start: config.beta1_start,
            object_error_threshold: config.object_error_threshold,
        })
    }

    /// Denoises pure Gaussian noise into a probability mask for `image`.
    ///
    /// Walks the timesteps from `num_timesteps - 1` down to 0. Each step
    /// predicts a mask from the current state; while `t > 0` the loop stops
    /// as soon as the mean squared error between the prediction and the
    /// reference image drops below `object_error_threshold`, otherwise the
    /// state takes a reparameterized Gaussian reverse step. At `t == 0` the
    /// prediction replaces the state outright. Returns
    /// `sigmoid(final state)` with shape `(B, 1, H, W)`.
    pub fn sample(&self, model: &CamoDiff, image: &Tensor) -> Result<Tensor> {
        let (b, _c, _h, _w) = image.dims4()?;
        let device = image.device();
        let mut x = Tensor::randn(0f32, 1.0, image.dims(), device)?;

        for t in (0..self.schedule.num_timesteps()).rev() {
            let t_batch = Tensor::from_vec(vec![t as u32; b], b, device)?;
            let pred = model.forward(&x, &t_batch, None, None)?.detach();

            if t > 0 {
                let err = mean_squared_error(&pred, image)?;
                if f64::from(err) < self.object_error_threshold {
                    tracing::debug!("early termination at t={t}, mse={err:.6}");
                    x = pred;
                    break;
                }
                x = self.reverse_step(&x, &pred, t)?.detach();
            } else {
                x = pred;
            }
        }

        Ok(candle_nn::ops::sigmoid(&x)?)
    }

    /// One reverse diffusion step from `t` to `t - 1`, for `t >= 1`.
    fn reverse_step(&self, x: &Tensor, pred: &Tensor, t: usize) -> Result<Tensor> {
        let alpha = self.schedule.alpha();
        let alpha_prev = if t > 1 { alpha } else { 1.0 };
        let alpha_bar = self.schedule.alpha_bar(t);
        let alpha_bar_prev = alpha_prev.powi(t as i32 - 1);

        let sigma = ((1.0 - alpha_bar_prev) / (1.0 - alpha_bar) * self.beta1_start).sqrt();
        let state_coeff = alpha_bar_prev.sqrt() * self.beta1_start / (1.0 - alpha_bar);
        let pred_coeff = (1.0 - alpha_bar).sqrt() * (1.0 - alpha_bar_prev) / (1.0 - alpha_bar);

        let mean = (x * state_coeff)?.broadcast_add(&(pred * pred_coeff)?)?;
        let noise = Tensor::randn(0f32, 1.0, mean.dims(), mean.device())?;
        Ok((mean + (noise * sigma)?)?)
    }
}

/// Mean squared error between `pred` and `reference`, broadcast over the
/// channel axis when the two disagree there.
fn mean_squared_error(pred: &Tensor, reference: &Tensor) -> Result<f32> {
    let diff = reference.broadcast_sub(pred)?;
    let count: usize = diff.dims().iter().product();
    let total = diff.sqr()?.sum_all()?.to_scalar::<f32>()?;
    Ok(total / count as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn small_config() -> ModelConfig {
        ModelConfig::default()
            .with_img_size(16)
            .with_patch_size(2)
            .with_hidden_dim(8)
            .with_expanded_dim(16)
            .with_ssm_dim(4)
            .with_num_encoder_blocks(3)
            .with_num_decoder_blocks(4)
            .with_num_dynamic_layers(2)
            .with_num_pool_stages(2)
            .with_num_timesteps(4)
    }

    fn build_model(config: &ModelConfig, device: &Device) -> CamoDiff {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        CamoDiff::new(config, vb).unwrap()
    }

    #[test]
    fn test_sample_shape_and_range() {
        let device = Device::Cpu;
        let config = small_config();
        let model = build_model(&config, &device);
        let sampler = Sampler::new(&config).unwrap();

        let image = Tensor::randn(0f32, 1.0, (2, 3, 16, 16), &device).unwrap();
        let mask = sampler.sample(&model, &image).unwrap();
        assert_eq!(mask.dims(), &[2, 1, 16, 16]);

        let values: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();
        for v in values {
            assert!((0.0..=1.0).contains(&v), "mask value {v} outside [0, 1]");
        }
    }

    #[test]
    fn test_sample_early_termination() {
        let device = Device::Cpu;
        // A huge threshold terminates on the very first step.
        let mut config = small_config();
        config.object_error_threshold = 1e9;
        let model = build_model(&config, &device);
        let sampler = Sampler::new(&config).unwrap();

        let image = Tensor::randn(0f32, 1.0, (1, 3, 16, 16), &device).unwrap();
        let mask = sampler.sample(&model, &image).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 16, 16]);
    }

    #[test]
    fn test_single_timestep_takes_prediction() {
        let device = Device::Cpu;
        let config = small_config().with_num_timesteps(1);
        let model = build_model(&config, &device);
        let sampler = Sampler::new(&config).unwrap();

        let image = Tensor::randn(0f32, 1.0, (1, 3, 16, 16), &device).unwrap();
        let mask = sampler.sample(&model, &image).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 16, 16]);
    }

    #[test]
    fn test_mean_squared_error_broadcasts_channels() {
        let device = Device::Cpu;
        let pred = Tensor::zeros((1, 1, 2, 2), DType::F32, &device).unwrap();
        let reference = Tensor::from_vec(vec![1f32; 12], (1, 3, 2, 2), &device).unwrap();
        let err = mean_squared_error(&pred, &reference).unwrap();
        assert!((err - 1.0).abs() < 1e-6, "mse={err}, expected 1");
    }
}
