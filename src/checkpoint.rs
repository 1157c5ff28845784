use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};

/// Writes `weights` next to `path` and renames into place, so a reader
/// never sees a half-written file.
pub fn atomic_save(weights: &HashMap<String, Tensor>, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let file_name = path
        .file_name()
        .ok_or_else(|| OrchestratorError::configuration(format!("{} is not a file path", path.display())))?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut partial = file_name.to_os_string();
    partial.push(".partial");
    let tmp = path.with_file_name(partial);

    candle_core::safetensors::save(weights, &tmp)?;
    File::open(&tmp)?.sync_all()?;
    fs::rename(&tmp, path)?;
    debug!("saved {} tensors to {}", weights.len(), path.display());
    Ok(())
}

pub fn load_weights(path: impl AsRef<Path>, device: &Device) -> Result<HashMap<String, Tensor>> {
    Ok(candle_core::safetensors::load(path, device)?)
}

pub trait CheckpointTracker: Send {
    fn best_model_path(&self) -> Option<&str>;
    fn set_best_model_path(&mut self, path: Option<String>);
    /// Records `score` for `epoch` (lower is better), persisting `weights`
    /// when it improves on the best so far and this is global rank 0.
    fn on_epoch_end(
        &mut self,
        epoch: usize,
        score: f64,
        weights: &HashMap<String, Tensor>,
        is_global_zero: bool,
    ) -> Result<()>;
}

/// Keeps the checkpoint with the lowest monitored score.
#[derive(Debug, Clone)]
pub struct ModelCheckpoint {
    dirpath: PathBuf,
    best_score: Option<f64>,
    best_model_path: Option<String>,
}

impl ModelCheckpoint {
    pub fn new(dirpath: impl Into<PathBuf>) -> Self {
        Self {
            dirpath: dirpath.into(),
            best_score: None,
            best_model_path: None,
        }
    }

    pub fn dirpath(&self) -> &Path {
        &self.dirpath
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best_score
    }

    pub fn format_checkpoint_name(&self, epoch: usize) -> PathBuf {
        self.dirpath.join(format!("epoch={epoch}.ckpt"))
    }
}

impl CheckpointTracker for ModelCheckpoint {
    fn best_model_path(&self) -> Option<&str> {
        self.best_model_path.as_deref()
    }

    fn set_best_model_path(&mut self, path: Option<String>) {
        self.best_model_path = path;
    }

    fn on_epoch_end(
        &mut self,
        epoch: usize,
        score: f64,
        weights: &HashMap<String, Tensor>,
        is_global_zero: bool,
    ) -> Result<()> {
        if self.best_score.is_some_and(|best| score >= best) {
            return Ok(());
        }
        let path = self.format_checkpoint_name(epoch);
        if is_global_zero {
            atomic_save(weights, &path)?;
            info!("💾 epoch {}: new best score {:.6}, saved {}", epoch, score, path.display());
        }
        self.best_score = Some(score);
        self.best_model_path = Some(path.to_string_lossy().into_owned());
        Ok(())
    }
}
