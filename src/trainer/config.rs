//! Training configuration and per-step metrics.

use crate::nn::LossBreakdown;

/// Training loop configuration.
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub num_epochs: usize,
    pub batch_size: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-5,
            weight_decay: 0.01,
            num_epochs: 100,
            batch_size: 6,
        }
    }
}

impl TrainerConfig {
    pub fn with_lr(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_weight_decay(mut self, wd: f64) -> Self {
        self.weight_decay = wd;
        self
    }

    pub fn with_num_epochs(mut self, epochs: usize) -> Self {
        self.num_epochs = epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Metrics from one optimization step.
#[derive(Debug, Clone, Copy)]
pub struct StepMetrics {
    pub loss: f32,
    pub breakdown: LossBreakdown,
}
