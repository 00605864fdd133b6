//! Training configuration for UD fine-tuning runs
//!
//! Defaults match the command-line defaults of the training tool. A JSON file
//! may replace any subset of fields; language overrides are applied once
//! after the file and flags have been merged.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::HeadConfig;
use crate::treebank::{LanguageTreebankMapping, TreebankLayout};

/// Main training configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// What to train
    pub run: RunConfig,

    /// Optimization settings
    pub optimizer: OptimizerConfig,

    /// Learning rate schedule
    pub scheduler: SchedulerConfig,

    /// Training loop parameters
    pub training: TrainingParams,

    /// Where data is read from and artifacts are written to
    pub paths: PathsConfig,
}

/// Run identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Language code
    pub language: String,

    /// Encoder family name
    pub model: String,

    /// Iterate the fixed list of intermediate checkpoints instead of hub branches
    pub fine_grained: bool,

    /// Read the full UD release instead of the size-normalized subsets
    pub use_full_ud: bool,

    /// Use the reduced-deprel subset variant
    pub reduced_deprel: bool,

    /// Seed for shuffling and initialization
    pub seed: u64,

    /// Emit experiment tracking records
    pub log_tracking: bool,

    /// Experiment tracking project
    pub project: String,
}

/// Optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Peak learning rate of the task heads
    pub learning_rate: f64,

    /// Weight decay of decayed head parameters
    pub weight_decay: f64,

    /// Weight decay of decayed encoder parameters
    pub encoder_weight_decay: f64,

    /// Encoder learning rate as a fraction of the head learning rate
    pub encoder_lr_multiplier: f64,

    /// First moment decay
    pub beta1: f64,

    /// Second moment decay
    pub beta2: f64,

    /// Denominator epsilon
    pub epsilon: f64,

    /// Global gradient norm ceiling
    pub max_grad_norm: f64,
}

/// Warmup-then-cosine schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Linear warmup steps
    pub warmup_steps: usize,

    /// Floor of the decay as a fraction of the peak
    pub min_factor: f64,
}

/// Training loop parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    /// Sentences per batch
    pub batch_size: usize,

    /// Epochs per revision
    pub epochs: usize,

    /// Label smoothing of every cross-entropy term
    pub label_smoothing: f64,

    /// Dropout on pooled word vectors
    pub dropout: f32,

    /// EMA shadow decay
    pub ema_decay: f64,

    /// Minimum training count for forms and lemma rules
    pub min_count: usize,

    /// Width of the arc scorer projections
    pub arc_hidden_size: usize,
}

/// Filesystem layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of the UD release
    pub ud_treebanks_dir: PathBuf,

    /// Language to treebank mapping file
    pub treebank_mapping: PathBuf,

    /// Root of the size-normalized subsets
    pub subsets_dir: PathBuf,

    /// Checkpoint root
    pub checkpoint_dir: PathBuf,

    /// Prediction files written for the evaluator
    pub prediction_dir: PathBuf,

    /// Results logs
    pub results_dir: PathBuf,

    /// Experiment tracking logs
    pub tracking_dir: PathBuf,

    /// Local fine-grained checkpoints
    pub fine_grained_root: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            language: String::new(),
            model: "hplt".to_string(),
            fine_grained: false,
            use_full_ud: false,
            reduced_deprel: true,
            seed: 42,
            log_tracking: false,
            project: "MSc-v2".to_string(),
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 5e-4,
            weight_decay: 1e-3,
            encoder_weight_decay: 0.1,
            encoder_lr_multiplier: 0.1,
            beta1: 0.9,
            beta2: 0.99,
            epsilon: 1e-8,
            max_grad_norm: 10.0,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            warmup_steps: 250,
            min_factor: 0.1 / 3.0,
        }
    }
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            batch_size: 32,
            epochs: 20,
            label_smoothing: 0.1,
            dropout: 0.3,
            ema_decay: 0.995,
            min_count: 3,
            arc_hidden_size: 512,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            ud_treebanks_dir: PathBuf::from("ud-treebanks-v2.14"),
            treebank_mapping: PathBuf::from("language_treebank_mapping.json"),
            subsets_dir: PathBuf::from("subsets"),
            checkpoint_dir: PathBuf::from("checkpoints"),
            prediction_dir: PathBuf::from("tmp"),
            results_dir: PathBuf::from("results"),
            tracking_dir: PathBuf::from("tracking"),
            fine_grained_root: PathBuf::from(crate::encoder::registry::FINE_GRAINED_ROOT),
        }
    }
}

impl TrainingConfig {
    /// Default configuration for `language`
    pub fn for_language(language: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.run.language = language.into();
        config
    }

    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .context("Failed to read configuration file")?;
        let config = serde_json::from_str(&content).context("Failed to parse JSON configuration")?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;
        std::fs::write(path.as_ref(), content).context("Failed to write configuration file")?;
        Ok(())
    }

    /// Adjust batch size, learning rate, dropout and epochs for languages
    /// with small or morphologically complex treebanks
    pub fn apply_language_overrides(&mut self) {
        match self.run.language.as_str() {
            "mr" | "ta" => {
                self.training.batch_size /= 4;
                self.optimizer.learning_rate /= 2.0;
            }
            "kk" | "ky" => {
                self.training.batch_size /= 8;
                self.optimizer.learning_rate = 1e-4;
                self.training.dropout = 0.5;
                self.training.epochs = 60;
            }
            _ => {}
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.run.language.is_empty() {
            return Err(anyhow::anyhow!("Language must be set"));
        }

        if self.training.epochs == 0 {
            return Err(anyhow::anyhow!("Number of epochs must be greater than 0"));
        }

        if self.training.batch_size == 0 {
            return Err(anyhow::anyhow!("Batch size must be greater than 0"));
        }

        if self.optimizer.learning_rate <= 0.0 {
            return Err(anyhow::anyhow!("Learning rate must be positive"));
        }

        if self.optimizer.weight_decay < 0.0 || self.optimizer.encoder_weight_decay < 0.0 {
            return Err(anyhow::anyhow!("Weight decay must be non-negative"));
        }

        if !(0.0..1.0).contains(&self.training.dropout) {
            return Err(anyhow::anyhow!("Dropout must be in [0.0, 1.0)"));
        }

        if !(0.0..1.0).contains(&self.training.label_smoothing) {
            return Err(anyhow::anyhow!("Label smoothing must be in [0.0, 1.0)"));
        }

        if !(0.0..=1.0).contains(&self.training.ema_decay) {
            return Err(anyhow::anyhow!("EMA decay must be in [0.0, 1.0]"));
        }

        if self.optimizer.max_grad_norm <= 0.0 {
            return Err(anyhow::anyhow!("Gradient norm ceiling must be positive"));
        }

        Ok(())
    }

    /// Head hyperparameters of the model
    pub fn head_config(&self) -> HeadConfig {
        HeadConfig {
            dropout: self.training.dropout,
            arc_hidden_size: self.training.arc_hidden_size,
        }
    }

    /// Where this run's treebank files live
    pub fn treebank_layout(&self) -> crate::Result<TreebankLayout> {
        if self.run.use_full_ud {
            Ok(TreebankLayout::Full {
                root: self.paths.ud_treebanks_dir.clone(),
                mapping: LanguageTreebankMapping::from_file(&self.paths.treebank_mapping)?,
            })
        } else {
            Ok(TreebankLayout::Subset {
                root: self.paths.subsets_dir.clone(),
                reduced_deprel: self.run.reduced_deprel,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = TrainingConfig::for_language("en");
        assert!(config.validate().is_ok());
        assert_eq!(config.training.batch_size, 32);
        assert_eq!(config.optimizer.learning_rate, 5e-4);
        assert_eq!(config.run.project, "MSc-v2");

        assert!(TrainingConfig::default().validate().is_err());
    }

    #[test]
    fn test_language_overrides() {
        let mut config = TrainingConfig::for_language("ta");
        config.apply_language_overrides();
        assert_eq!(config.training.batch_size, 8);
        assert_eq!(config.optimizer.learning_rate, 2.5e-4);

        let mut config = TrainingConfig::for_language("kk");
        config.apply_language_overrides();
        assert_eq!(config.training.batch_size, 4);
        assert_eq!(config.optimizer.learning_rate, 1e-4);
        assert_eq!(config.training.dropout, 0.5);
        assert_eq!(config.training.epochs, 60);

        let mut config = TrainingConfig::for_language("en");
        config.apply_language_overrides();
        assert_eq!(config.training.batch_size, 32);
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = TrainingConfig::for_language("fi");
        config.training.epochs = 3;
        let file = NamedTempFile::new().unwrap();
        let path = file.path().with_extension("json");
        config.to_file(&path).unwrap();
        let loaded = TrainingConfig::from_file(&path).unwrap();
        assert_eq!(loaded.training.epochs, 3);
        assert_eq!(loaded.run.language, "fi");
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: TrainingConfig =
            serde_json::from_str(r#"{"training": {"batch_size": 16}}"#).unwrap();
        assert_eq!(config.training.batch_size, 16);
        assert_eq!(config.training.epochs, 20);
        assert_eq!(config.scheduler.warmup_steps, 250);
    }

    #[test]
    fn test_config_validation() {
        let mut config = TrainingConfig::for_language("en");
        config.training.dropout = 1.0;
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::for_language("en");
        config.optimizer.learning_rate = -0.1;
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::for_language("en");
        config.training.batch_size = 0;
        assert!(config.validate().is_err());
    }
}
