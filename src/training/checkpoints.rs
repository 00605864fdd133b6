//! Per-revision checkpoint artifacts
//!
//! A checkpoint directory holds the EMA model weights (`model.safetensors`)
//! and the training vocabularies (`dataset.json`). Every epoch overwrites the
//! previous artifact, so only the latest one is retained.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::model::UdModel;
use crate::training::data::DatasetState;
use crate::utils::revision_slug;

/// Weights file inside a checkpoint directory
pub const MODEL_FILE: &str = "model.safetensors";
/// Vocabulary snapshot inside a checkpoint directory
pub const DATASET_FILE: &str = "dataset.json";

/// Writes and reads the checkpoint of one (language, model, revision) run
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Manager for `{root}/ud-{language}-{model}-{revision}`
    pub fn new(root: impl AsRef<Path>, language: &str, model: &str, revision: &str) -> Self {
        let dir = root
            .as_ref()
            .join(format!("ud-{}-{}-{}", language, model, revision_slug(revision)));
        Self { dir }
    }

    /// Checkpoint directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the weights file
    pub fn model_path(&self) -> PathBuf {
        self.dir.join(MODEL_FILE)
    }

    /// Path of the vocabulary snapshot
    pub fn dataset_path(&self) -> PathBuf {
        self.dir.join(DATASET_FILE)
    }

    /// Whether a complete checkpoint exists
    pub fn exists(&self) -> bool {
        self.model_path().is_file() && self.dataset_path().is_file()
    }

    /// Overwrite the checkpoint with `model` and `state`
    pub fn save(&self, model: &UdModel, state: &DatasetState) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create checkpoint directory {}", self.dir.display()))?;
        model
            .save(self.model_path())
            .with_context(|| format!("Failed to write {}", self.model_path().display()))?;
        state.to_file(self.dataset_path())?;
        debug!("Saved checkpoint to {}", self.dir.display());
        Ok(self.dir.clone())
    }

    /// Load the weights into `model` and return the stored vocabularies
    pub fn load(&self, model: &mut UdModel) -> Result<DatasetState> {
        model
            .load(self.model_path())
            .with_context(|| format!("Failed to read {}", self.model_path().display()))?;
        let state = DatasetState::from_file(self.dataset_path())?;
        info!("Loaded checkpoint from {}", self.dir.display());
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_layout() {
        let manager = CheckpointManager::new("checkpoints", "en", "hplt", "step1000");
        assert_eq!(manager.dir(), Path::new("checkpoints/ud-en-hplt-step1000"));
        assert_eq!(
            manager.model_path(),
            PathBuf::from("checkpoints/ud-en-hplt-step1000/model.safetensors")
        );
        assert!(!manager.exists());
    }
}
