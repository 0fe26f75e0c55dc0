//! Closed-form forward noising process.

use candle_core::Tensor;

use crate::config::ModelConfig;
use crate::error::{Error, Result};

/// Noise schedule with a constant per-step retention factor.
///
/// Every step retains the fraction `alpha = 1 - beta1_start` of the signal,
/// so the cumulative product over `t` steps collapses to `alpha^t`. The
/// factor deliberately does not vary with `t`.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    alpha: f64,
    num_timesteps: usize,
}

impl NoiseSchedule {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            alpha: 1.0 - config.beta1_start,
            num_timesteps: config.num_timesteps,
        })
    }

    /// Signal fraction retained by a single noising step.
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn num_timesteps(&self) -> usize {
        self.num_timesteps
    }

    /// Cumulative signal fraction after `t` noising steps.
    pub fn alpha_bar(&self, t: usize) -> f64 {
        self.alpha.powi(t as i32)
    }

    /// Diffuses `x` to the per-sample timesteps in `t`.
    ///
    /// Computes `sqrt(alpha_bar) * x + sqrt(1 - alpha_bar) * noise` with
    /// `alpha_bar` broadcast per sample over the channel and spatial axes.
    /// At `t = 0` the noise coefficient is zero and the input passes through
    /// unchanged.
    pub fn add_noise(&self, x: &Tensor, noise: &Tensor, t: &Tensor) -> Result<Tensor> {
        let (b, _c, _h, _w) = x.dims4()?;
        if noise.dims() != x.dims() {
            return Err(Error::DiffusionError {
                reason: format!(
                    "noise shape {:?} does not match image shape {:?}",
                    noise.dims(),
                    x.dims()
                ),
            });
        }
        let steps = t.dims1()?;
        if steps != b {
            return Err(Error::DiffusionError {
                reason: format!("timestep batch {steps} does not match image batch {b}"),
            });
        }

        let ts = t.to_vec1::<u32>()?;
        let mut signal = Vec::with_capacity(b);
        let mut spread = Vec::with_capacity(b);
        for &step in &ts {
            let alpha_bar = self.alpha_bar(step as usize);
            signal.push(alpha_bar.sqrt() as f32);
            spread.push((1.0 - alpha_bar).sqrt() as f32);
        }
        let signal = Tensor::from_vec(signal, (b, 1, 1, 1), x.device())?;
        let spread = Tensor::from_vec(spread, (b, 1, 1, 1), x.device())?;

        let noisy = (x.broadcast_mul(&signal)? + noise.broadcast_mul(&spread)?)?;
        Ok(noisy)
    }
}
