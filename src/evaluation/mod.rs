//! Scoring predicted treebanks against gold annotation
//!
//! [`Evaluator`] is the seam the training controller scores through. The
//! bundled [`Conll18Evaluator`] computes the shared-task metrics for files with
//! identical tokenization; [`PredictionWriter`] turns model output back into a
//! treebank file to score.

pub mod adapter;
pub mod metrics;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::treebank::Treebank;

pub use adapter::PredictionWriter;
pub use metrics::Conll18Evaluator;

/// Metrics reported by every evaluation, in report order
pub const METRICS: [&str; 10] = [
    "UPOS", "XPOS", "UFeats", "AllTags", "Lemmas", "UAS", "LAS", "CLAS", "MLAS", "BLEX",
];

/// Failure to score a prediction file
#[derive(Error, Debug)]
pub enum EvaluationError {
    /// A file could not be read or parsed
    #[error("Cannot read {path}: {reason}")]
    Parse {
        /// File that failed
        path: PathBuf,
        /// Parser message
        reason: String,
    },

    /// Gold and system words differ
    #[error("Words differ at word {index}: gold '{gold}', system '{system}'")]
    WordMismatch {
        /// Word position over the whole file
        index: usize,
        /// Gold form, empty past the end
        gold: String,
        /// System form, empty past the end
        system: String,
    },

    /// A head is missing or points outside its sentence
    #[error("Invalid head in sentence {sentence}, word {word}: {reason}")]
    InvalidHead {
        /// Sentence position
        sentence: usize,
        /// Word identifier
        word: usize,
        /// What is wrong
        reason: String,
    },

    /// More than one word attaches to the root
    #[error("Multiple roots in sentence {sentence}")]
    MultipleRoots {
        /// Sentence position
        sentence: usize,
    },

    /// The head relation is not a tree
    #[error("Cycle in sentence {sentence}")]
    Cycle {
        /// Sentence position
        sentence: usize,
    },
}

/// Counts and ratios of one metric
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Score {
    /// Words counted in the gold file
    pub gold_total: usize,
    /// Words counted in the system file
    pub system_total: usize,
    /// Gold words with a system counterpart
    pub aligned_total: usize,
    /// Correct words
    pub correct: usize,
    /// `correct / system_total`
    pub precision: f64,
    /// `correct / gold_total`
    pub recall: f64,
    /// Harmonic mean of precision and recall
    pub f1: f64,
    /// `correct / aligned_total`
    pub aligned_accuracy: f64,
}

impl Score {
    /// Score from raw counts
    pub fn new(gold_total: usize, system_total: usize, correct: usize, aligned_total: usize) -> Self {
        let ratio = |num: usize, den: usize| if den > 0 { num as f64 / den as f64 } else { 0.0 };
        Self {
            gold_total,
            system_total,
            aligned_total,
            correct,
            precision: ratio(correct, system_total),
            recall: ratio(correct, gold_total),
            f1: ratio(2 * correct, system_total + gold_total),
            aligned_accuracy: ratio(correct, aligned_total),
        }
    }
}

/// Scores by metric name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    scores: BTreeMap<String, Score>,
}

impl EvaluationReport {
    /// Add or replace a metric
    pub fn insert(&mut self, metric: impl Into<String>, score: Score) {
        self.scores.insert(metric.into(), score);
    }

    /// Score of `metric`
    pub fn get(&self, metric: &str) -> Option<&Score> {
        self.scores.get(metric)
    }

    /// Aligned accuracy of `metric`, 0 when absent
    pub fn aligned_accuracy(&self, metric: &str) -> f64 {
        self.get(metric).map_or(0.0, |score| score.aligned_accuracy)
    }

    /// Aligned accuracy of every metric
    pub fn aligned_accuracies(&self) -> BTreeMap<String, f64> {
        self.scores
            .iter()
            .map(|(name, score)| (name.clone(), score.aligned_accuracy))
            .collect()
    }

    /// Metrics in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Score)> {
        self.scores.iter().map(|(name, score)| (name.as_str(), score))
    }

    /// One-line summary for logs
    pub fn summary(&self) -> String {
        METRICS
            .iter()
            .filter_map(|metric| {
                self.get(metric)
                    .map(|score| format!("{} {:.2}", metric, 100.0 * score.aligned_accuracy))
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Scores a system treebank against a gold treebank
pub trait Evaluator {
    /// Score parsed treebanks
    fn evaluate(&self, gold: &Treebank, system: &Treebank) -> Result<EvaluationReport, EvaluationError>;

    /// Read both files and score them
    fn evaluate_files(&self, gold: &Path, system: &Path) -> Result<EvaluationReport, EvaluationError> {
        let read = |path: &Path| {
            Treebank::from_file(path).map_err(|e| EvaluationError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        };
        self.evaluate(&read(gold)?, &read(system)?)
    }
}
