//! Evaluation metrics for predicted masks.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::error::{Error, Result};

/// Scalar quality measures for one batch of predictions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub s_measure: f32,
    pub f_measure: f32,
    pub mae: f32,
}

/// Structure measure between a soft prediction and a binary ground truth.
///
/// Degenerate masks short-circuit: an all-background truth scores
/// `1 - mean(pred)` and an all-object truth scores `mean(pred)`. Otherwise
/// the object and background region scores are blended by `alpha`.
pub fn s_measure(pred: &Tensor, gt: &Tensor, alpha: f64) -> Result<f32> {
    check_same_shape(pred, gt)?;
    let p = values(pred)?;
    let g = values(gt)?;

    let y = mean(&g);
    let q = if y == 0.0 {
        1.0 - mean(&p)
    } else if y == 1.0 {
        mean(&p)
    } else {
        let object: Vec<f32> = p
            .iter()
            .zip(&g)
            .map(|(&pv, &gv)| if gv == 1.0 { pv } else { 0.0 })
            .collect();
        let background: Vec<f32> = p
            .iter()
            .zip(&g)
            .map(|(&pv, &gv)| if gv == 0.0 { pv } else { 0.0 })
            .collect();
        let object_count = g.iter().filter(|&&gv| gv == 1.0).count() as f64;
        let background_count = g.iter().filter(|&&gv| gv == 0.0).count() as f64;

        let o_score = object_region(&object, object_count);
        let b_score = background_region(&background, background_count);
        alpha * o_score + (1.0 - alpha) * b_score
    };
    Ok(q as f32)
}

fn object_region(masked: &[f32], region_count: f64) -> f64 {
    let x = sum(masked) / (region_count + 1e-8);
    let sigma = sample_std(masked);
    2.0 * x / (x * x + 1.0 + sigma + 1e-8)
}

fn background_region(masked: &[f32], region_count: f64) -> f64 {
    let x = sum(masked) / (region_count + 1e-8);
    let sigma = sample_std(masked);
    2.0 * (1.0 - x) / ((1.0 - x) * (1.0 - x) + 1.0 + sigma + 1e-8)
}

/// Weighted harmonic mean of precision and recall with the prediction
/// binarized at 0.5.
pub fn f_measure(pred: &Tensor, gt: &Tensor, beta_sq: f64) -> Result<f32> {
    check_same_shape(pred, gt)?;
    let p = values(pred)?;
    let g = values(gt)?;

    let mut true_pos = 0f64;
    let mut false_pos = 0f64;
    let mut false_neg = 0f64;
    for (&pv, &gv) in p.iter().zip(&g) {
        let bin = if pv > 0.5 { 1f64 } else { 0f64 };
        let gv = f64::from(gv);
        true_pos += bin * gv;
        false_pos += bin * (1.0 - gv);
        false_neg += (1.0 - bin) * gv;
    }

    let precision = true_pos / (true_pos + false_pos + 1e-8);
    let recall = true_pos / (true_pos + false_neg + 1e-8);
    let f = (1.0 + beta_sq) * precision * recall / (beta_sq * precision + recall + 1e-8);
    Ok(f as f32)
}

/// Mean absolute error between prediction and ground truth.
pub fn mae(pred: &Tensor, gt: &Tensor) -> Result<f32> {
    check_same_shape(pred, gt)?;
    let count: usize = pred.dims().iter().product();
    let total = (pred - gt)?.abs()?.sum_all()?.to_scalar::<f32>()?;
    Ok(total / count as f32)
}

/// All three measures with the blend weights taken from the configuration.
pub fn evaluate(pred: &Tensor, gt: &Tensor, config: &ModelConfig) -> Result<Metrics> {
    Ok(Metrics {
        s_measure: s_measure(pred, gt, config.smeasure_alpha)?,
        f_measure: f_measure(pred, gt, config.fmeasure_beta_sq)?,
        mae: mae(pred, gt)?,
    })
}

fn check_same_shape(pred: &Tensor, gt: &Tensor) -> Result<()> {
    if pred.dims() != gt.dims() {
        return Err(Error::InvalidArgument {
            arg: "gt",
            reason: format!(
                "ground truth shape {:?} does not match prediction shape {:?}",
                gt.dims(),
                pred.dims()
            ),
        });
    }
    Ok(())
}

fn values(t: &Tensor) -> Result<Vec<f32>> {
    Ok(t.flatten_all()?.to_vec1::<f32>()?)
}

fn sum(v: &[f32]) -> f64 {
    v.iter().map(|&x| f64::from(x)).sum()
}

fn mean(v: &[f32]) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    sum(v) / v.len() as f64
}

/// Sample standard deviation (n - 1 denominator), 0 for fewer than two values.
fn sample_std(v: &[f32]) -> f64 {
    if v.len() < 2 {
        return 0.0;
    }
    let m = mean(v);
    let var = v
        .iter()
        .map(|&x| (f64::from(x) - m).powi(2))
        .sum::<f64>()
        / (v.len() - 1) as f64;
    var.sqrt()
}
