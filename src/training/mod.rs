//! Training infrastructure for UD taggers/parsers
//!
//! This module provides data featurization and batching, the joint loss over
//! every task head, AdamW with a warmup-cosine schedule, the EMA shadow model,
//! checkpointing, experiment tracking and the per-revision training controller.
//!
//! # Main Components
//!
//! - **Configuration**: run, optimizer, schedule and path settings
//! - **Data**: vocabularies, lemma rules, sentence featurization, batching
//! - **Loss**: label-smoothed cross-entropy composed over all tasks
//! - **Optimizers**: grouped AdamW and the cosine schedule
//! - **Trainer**: the epoch loop with EMA, checkpoints and early stopping
//! - **Runner**: the outer loop over pretraining revisions
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use udtrain::training::{runner, TrainingConfig};
//! use candle_core::Device;
//!
//! let mut config = TrainingConfig::for_language("en");
//! config.apply_language_overrides();
//! let outcomes = runner::run(config, Device::Cpu)?;
//! ```

pub mod checkpoints;
pub mod config;
pub mod data;
pub mod ema;
pub mod loss;
pub mod optimizers;
pub mod results;
pub mod runner;
pub mod stopping;
pub mod tracking;
pub mod trainer;

// Tests module
#[cfg(test)]
pub mod tests;

// Configuration re-exports
pub use config::{OptimizerConfig, PathsConfig, RunConfig, SchedulerConfig, TrainingConfig, TrainingParams};

// Trainer re-exports
pub use trainer::{RevisionOutcome, TrainingContext, TrainingPhase, TrainingState, UdTrainer};

// Data re-exports
pub use data::{
    Batch, BatchCollator, DataLoader, DataLoaderConfig, DatasetState, RunDatasets, SentenceRecord, UdDataset,
    Vocabulary,
};

// Optimizer re-exports
pub use optimizers::{create_optimizer, create_scheduler, AdamWOptimizer, CosineScheduler, Optimizer, Scheduler};

pub use checkpoints::CheckpointManager;
pub use ema::ExponentialMovingAverage;
pub use loss::{LossBreakdown, LossComposer};
pub use results::ResultsLog;
pub use stopping::{EarlyStopping, StopDecision};
pub use tracking::{ExperimentTracker, RunIdentity};

/// Training result type alias
pub type Result<T> = anyhow::Result<T>;

/// Training error type alias
pub type Error = anyhow::Error;
