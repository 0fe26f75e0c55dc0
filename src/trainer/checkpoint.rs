//! Checkpoint save/load for training resumption.
//!
//! A checkpoint consists of:
//! - `model.safetensors` — model parameters
//! - `training_state.json` — epoch, learning rate, metrics snapshot, version

use std::collections::HashMap;
use std::path::Path;

use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::metrics::Metrics;

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

fn default_version() -> u32 {
    1
}

/// Training metadata saved alongside the model parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingState {
    #[serde(default = "default_version")]
    pub version: u32,
    pub epoch: u64,
    #[serde(default)]
    pub learning_rate: f64,
    /// Validation metrics at save time, if any were computed.
    #[serde(default)]
    pub metrics: Option<Metrics>,
    /// Arbitrary key-value metadata (dataset name, run id, etc.)
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Save a checkpoint to a directory.
///
/// Creates:
/// - `{dir}/model.safetensors`
/// - `{dir}/training_state.json`
pub fn save_checkpoint<P: AsRef<Path>>(
    dir: P,
    varmap: &VarMap,
    training_state: &TrainingState,
) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir).map_err(|e| Error::TrainingError {
        reason: format!("failed to create checkpoint dir: {e}"),
    })?;

    varmap.save(dir.join("model.safetensors"))?;

    // Always stamp the current version.
    let mut state = training_state.clone();
    state.version = CHECKPOINT_VERSION;
    let json = serde_json::to_string_pretty(&state).map_err(|e| Error::TrainingError {
        reason: format!("failed to serialize training state: {e}"),
    })?;
    std::fs::write(dir.join("training_state.json"), json).map_err(|e| Error::TrainingError {
        reason: format!("failed to write training state: {e}"),
    })?;

    Ok(())
}

/// Load a checkpoint from a directory into an existing variable map.
///
/// The map must already hold variables with the saved names, which is the
/// case once the model has been built on it. A missing checkpoint surfaces
/// as an error; nothing is retried.
pub fn load_checkpoint<P: AsRef<Path>>(dir: P, varmap: &mut VarMap) -> Result<TrainingState> {
    let dir = dir.as_ref();
    let model_path = dir.join("model.safetensors");
    if !model_path.exists() {
        return Err(Error::TrainingError {
            reason: format!("checkpoint not found at {}", model_path.display()),
        });
    }
    varmap.load(&model_path)?;

    let state_path = dir.join("training_state.json");
    let json = std::fs::read_to_string(&state_path).map_err(|e| Error::TrainingError {
        reason: format!("failed to read training state: {e}"),
    })?;
    let training_state: TrainingState =
        serde_json::from_str(&json).map_err(|e| Error::TrainingError {
            reason: format!("failed to parse training state: {e}"),
        })?;

    Ok(training_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;
    use candle_nn::init::Init;
    use tempfile::TempDir;

    fn state(epoch: u64) -> TrainingState {
        TrainingState {
            version: CHECKPOINT_VERSION,
            epoch,
            learning_rate: 1e-5,
            metrics: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let device = Device::Cpu;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _w = vb.get_with_hints((2, 2), "w", Init::Const(1.0)).unwrap();

        save_checkpoint(dir.path(), &varmap, &state(3)).unwrap();
        assert!(dir.path().join("model.safetensors").exists());
        assert!(dir.path().join("training_state.json").exists());

        // A fresh map with the same layout starts from zeros and picks up
        // the saved values.
        let mut fresh = VarMap::new();
        let vb = VarBuilder::from_varmap(&fresh, DType::F32, &device);
        let _w = vb.get_with_hints((2, 2), "w", Init::Const(0.0)).unwrap();

        let loaded = load_checkpoint(dir.path(), &mut fresh).unwrap();
        assert_eq!(loaded.epoch, 3);
        assert!((loaded.learning_rate - 1e-5).abs() < 1e-12);

        let data = fresh.data().lock().unwrap();
        let w = data.get("w").unwrap().as_tensor();
        let values: Vec<f32> = w.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_version_stamped_on_save() {
        let dir = TempDir::new().unwrap();
        let device = Device::Cpu;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _w = vb.get_with_hints(1, "w", Init::Const(0.5)).unwrap();

        let mut old = state(7);
        old.version = 0;
        save_checkpoint(dir.path(), &varmap, &old).unwrap();

        let mut fresh = VarMap::new();
        let vb = VarBuilder::from_varmap(&fresh, DType::F32, &device);
        let _w = vb.get_with_hints(1, "w", Init::Const(0.0)).unwrap();
        let loaded = load_checkpoint(dir.path(), &mut fresh).unwrap();
        assert_eq!(loaded.version, CHECKPOINT_VERSION);
    }

    #[test]
    fn test_missing_checkpoint_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut varmap = VarMap::new();
        let err = load_checkpoint(dir.path().join("nowhere"), &mut varmap).unwrap_err();
        assert!(err.to_string().contains("checkpoint not found"));
    }

    #[test]
    fn test_metrics_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let device = Device::Cpu;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _w = vb.get_with_hints(1, "w", Init::Const(0.5)).unwrap();

        let mut with_metrics = state(2);
        with_metrics.metrics = Some(Metrics {
            s_measure: 0.8,
            f_measure: 0.75,
            mae: 0.05,
        });
        save_checkpoint(dir.path(), &varmap, &with_metrics).unwrap();

        let mut fresh = VarMap::new();
        let vb = VarBuilder::from_varmap(&fresh, DType::F32, &device);
        let _w = vb.get_with_hints(1, "w", Init::Const(0.0)).unwrap();
        let loaded = load_checkpoint(dir.path(), &mut fresh).unwrap();
        let metrics = loaded.metrics.unwrap();
        assert!((metrics.f_measure - 0.75).abs() < 1e-6);
    }
}
