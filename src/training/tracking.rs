//! Experiment tracking
//!
//! Records go to the `tracking` tracing target and, for enabled runs, to a
//! JSON-lines file named after the run. Disabled trackers accept every call
//! and do nothing.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::training::loss::LossBreakdown;
use crate::utils::revision_slug;

/// Identity of a tracked run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    /// Project the run belongs to
    pub project: String,
    /// `{model}_{language}_{revision}`
    pub name: String,
    /// `{model}_{language}`
    pub group: String,
}

impl RunIdentity {
    /// Identity of one revision's run
    pub fn new(project: &str, model: &str, language: &str, revision: &str) -> Self {
        Self {
            project: project.to_string(),
            name: format!("{}_{}_{}", model, language, revision_slug(revision)),
            group: format!("{}_{}", model, language),
        }
    }
}

/// One tracked record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrackingRecord {
    /// Run header written once
    Start {
        /// Run identity
        run: RunIdentity,
        /// Hyperparameters of the run
        config: serde_json::Value,
        /// Wall-clock time
        timestamp: DateTime<Utc>,
    },
    /// One optimizer step
    Step {
        /// Global step
        step: usize,
        /// Per-task losses
        loss: LossBreakdown,
        /// Gradient norm before clipping
        grad_norm: f64,
        /// Learning rate of the first group
        learning_rate: f64,
    },
    /// One evaluation
    Evaluation {
        /// Epoch, 0-based
        epoch: usize,
        /// Split name
        split: String,
        /// Metric name to aligned accuracy
        metrics: BTreeMap<String, f64>,
    },
}

/// Tracks the records of one run
pub struct ExperimentTracker {
    run: RunIdentity,
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
}

impl ExperimentTracker {
    /// Tracker that records nothing
    pub fn disabled(run: RunIdentity) -> Self {
        Self {
            run,
            writer: None,
            path: None,
        }
    }

    /// Tracker appending to `{dir}/{name}.jsonl`
    pub fn create(dir: impl AsRef<Path>, run: RunIdentity, config: serde_json::Value) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create tracking directory {}", dir.display()))?;
        let path = dir.join(format!("{}.jsonl", run.name.replace('/', "_")));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open tracking file {}", path.display()))?;
        info!(
            target: "tracking",
            project = %run.project,
            group = %run.group,
            "Tracking run {} in {}",
            run.name,
            path.display()
        );

        let mut tracker = Self {
            run: run.clone(),
            writer: Some(BufWriter::new(file)),
            path: Some(path),
        };
        tracker.record(&TrackingRecord::Start {
            run,
            config,
            timestamp: Utc::now(),
        })?;
        Ok(tracker)
    }

    /// Whether records are persisted
    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    /// Run identity
    pub fn run(&self) -> &RunIdentity {
        &self.run
    }

    /// Tracking file, when enabled
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record one optimizer step
    pub fn log_step(&mut self, step: usize, loss: &LossBreakdown, grad_norm: f64, learning_rate: f64) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        tracing::debug!(
            target: "tracking",
            run = %self.run.name,
            step,
            loss = loss.total,
            grad_norm,
            learning_rate
        );
        self.record(&TrackingRecord::Step {
            step,
            loss: *loss,
            grad_norm,
            learning_rate,
        })
    }

    /// Record one evaluation
    pub fn log_evaluation(&mut self, epoch: usize, split: &str, metrics: &BTreeMap<String, f64>) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        info!(target: "tracking", run = %self.run.name, epoch, split, ?metrics);
        self.record(&TrackingRecord::Evaluation {
            epoch,
            split: split.to_string(),
            metrics: metrics.clone(),
        })
    }

    /// Flush pending records
    pub fn finish(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().context("Failed to flush tracking file")?;
        }
        Ok(())
    }

    fn record(&mut self, record: &TrackingRecord) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            serde_json::to_writer(&mut *writer, record)?;
            writer.write_all(b"\n")?;
        }
        Ok(())
    }
}

impl Drop for ExperimentTracker {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            tracing::warn!("{:#}", e);
        }
    }
}
