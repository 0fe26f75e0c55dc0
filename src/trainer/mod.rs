//! Single-device training loop for the denoising network.
//!
//! The trainer owns the model parameters, the optimizer and the noise
//! schedule. Callers drive it with batches (or whole datasets) and decide
//! when to validate and checkpoint.

pub mod checkpoint;
pub mod config;

pub use checkpoint::{CHECKPOINT_VERSION, TrainingState, load_checkpoint, save_checkpoint};
pub use config::{StepMetrics, TrainerConfig};

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::Rng;

use crate::config::ModelConfig;
use crate::data::{Batch, Dataset, collate};
use crate::diffusion::{NoiseSchedule, Sampler};
use crate::error::{Error, Result};
use crate::metrics::{Metrics, evaluate};
use crate::model::CamoDiff;
use crate::nn::total_loss;

/// Owns a model and trains it by denoising score matching.
///
/// One training step draws a timestep per sample, diffuses the images to
/// those timesteps, predicts the injected noise and applies one AdamW
/// update. The optimizer update completes before the next step reads the
/// parameters.
pub struct Trainer {
    model: CamoDiff,
    varmap: VarMap,
    optimizer: AdamW,
    schedule: NoiseSchedule,
    sampler: Sampler,
    model_config: ModelConfig,
    config: TrainerConfig,
    device: Device,
    epoch: u64,
}

impl Trainer {
    pub fn new(model_config: ModelConfig, config: TrainerConfig, device: Device) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::InvalidArgument {
                arg: "batch_size",
                reason: "batch size must be at least 1".to_string(),
            });
        }
        if !config.learning_rate.is_finite() || config.learning_rate <= 0.0 {
            return Err(Error::InvalidArgument {
                arg: "learning_rate",
                reason: format!("learning rate must be positive, got {}", config.learning_rate),
            });
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = CamoDiff::new(&model_config, vb)?;
        let optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: config.learning_rate,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;
        let schedule = NoiseSchedule::new(&model_config)?;
        let sampler = Sampler::new(&model_config)?;

        Ok(Self {
            model,
            varmap,
            optimizer,
            schedule,
            sampler,
            model_config,
            config,
            device,
            epoch: 0,
        })
    }

    /// One optimization step over a batch of images and their masks.
    pub fn train_step(&mut self, images: &Tensor, masks: &Tensor) -> Result<StepMetrics> {
        let (b, _c, _h, _w) = images.dims4()?;

        let mut rng = rand::thread_rng();
        let steps: Vec<u32> = (0..b)
            .map(|_| rng.gen_range(0..self.model_config.num_timesteps as u32))
            .collect();
        let t = Tensor::from_vec(steps, b, &self.device)?;
        let noise = Tensor::randn(0f32, 1.0, images.dims(), &self.device)?;

        let noisy = self.schedule.add_noise(images, &noise, &t)?;
        let pred = self.model.forward(&noisy, &t, None, None)?;
        let (loss, breakdown) = total_loss(
            &pred,
            &noise,
            masks,
            self.model_config.beta1_start,
            self.model_config.beta2_start,
            &noisy,
        )?;
        self.optimizer.backward_step(&loss)?;

        Ok(StepMetrics {
            loss: loss.to_scalar::<f32>()?,
            breakdown,
        })
    }

    /// Trains over every sample of `dataset` once, in index order.
    ///
    /// Returns the mean step loss of the epoch.
    pub fn train_epoch(&mut self, dataset: &dyn Dataset) -> Result<f32> {
        if dataset.is_empty() {
            return Err(Error::DataError {
                reason: "cannot train on an empty dataset".to_string(),
            });
        }

        let mut total = 0f64;
        let mut steps = 0usize;
        let mut start = 0;
        while start < dataset.len() {
            let batch = self.next_batch(dataset, start)?;
            let metrics = self.train_step(&batch.images, &batch.masks)?;
            tracing::debug!(
                "epoch {} step {}: loss={:.4}",
                self.epoch,
                steps,
                metrics.loss
            );
            total += f64::from(metrics.loss);
            steps += 1;
            start += batch.paths.len();
        }

        self.epoch += 1;
        let mean = (total / steps as f64) as f32;
        tracing::info!("epoch {} finished: mean loss={:.4}", self.epoch, mean);
        Ok(mean)
    }

    /// Runs sampler inference over `dataset` and averages the mask metrics.
    ///
    /// No gradients are computed and no parameters change.
    pub fn validate(&self, dataset: &dyn Dataset) -> Result<Metrics> {
        if dataset.is_empty() {
            return Err(Error::DataError {
                reason: "cannot validate on an empty dataset".to_string(),
            });
        }

        let mut sums = Metrics::default();
        let mut batches = 0usize;
        let mut start = 0;
        while start < dataset.len() {
            let batch = self.next_batch(dataset, start)?;
            let pred = self.sampler.sample(&self.model, &batch.images)?;
            let metrics = evaluate(&pred, &batch.masks, &self.model_config)?;
            sums.s_measure += metrics.s_measure;
            sums.f_measure += metrics.f_measure;
            sums.mae += metrics.mae;
            batches += 1;
            start += batch.paths.len();
        }

        Ok(Metrics {
            s_measure: sums.s_measure / batches as f32,
            f_measure: sums.f_measure / batches as f32,
            mae: sums.mae / batches as f32,
        })
    }

    /// Persists the model parameters and training metadata.
    pub fn save_checkpoint<P: AsRef<Path>>(&self, dir: P, metrics: Option<Metrics>) -> Result<()> {
        let state = TrainingState {
            version: CHECKPOINT_VERSION,
            epoch: self.epoch,
            learning_rate: self.config.learning_rate,
            metrics,
            metadata: HashMap::new(),
        };
        checkpoint::save_checkpoint(dir, &self.varmap, &state)
    }

    /// Restores parameters and resumes the epoch counter.
    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, dir: P) -> Result<TrainingState> {
        let state = checkpoint::load_checkpoint(dir, &mut self.varmap)?;
        self.epoch = state.epoch;
        Ok(state)
    }

    pub fn model(&self) -> &CamoDiff {
        &self.model
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn next_batch(&self, dataset: &dyn Dataset, start: usize) -> Result<Batch> {
        let end = (start + self.config.batch_size).min(dataset.len());
        let mut samples = Vec::with_capacity(end - start);
        for idx in start..end {
            samples.push(dataset.get(idx, &self.device)?);
        }
        collate(&samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn test_train_step_produces_finite_loss() {
        let device = Device::Cpu;
        let trainer_config = TrainerConfig::default().with_batch_size(2);
        let mut trainer = Trainer::new(small_config(), trainer_config, device.clone()).unwrap();

        let images = Tensor::randn(0f32, 1.0, (2, 3, 16, 16), &device).unwrap();
        let masks = Tensor::zeros((2, 1, 16, 16), candle_core::DType::F32, &device).unwrap();

        let metrics = trainer.train_step(&images, &masks).unwrap();
        assert!(metrics.loss.is_finite());
        assert!(metrics.breakdown.sample.is_finite());
        assert!(metrics.breakdown.vlb.is_finite());
        assert!(metrics.breakdown.diff.is_finite());
    }

    #[test]
    fn test_new_rejects_zero_batch_size() {
        let config = TrainerConfig::default().with_batch_size(0);
        assert!(Trainer::new(small_config(), config, Device::Cpu).is_err());
    }

    #[test]
    fn test_new_rejects_bad_learning_rate() {
        let config = TrainerConfig::default().with_lr(0.0);
        assert!(Trainer::new(small_config(), config, Device::Cpu).is_err());
    }
}
