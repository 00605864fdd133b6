//! Append-only results log
//!
//! One file per (language, model); each line maps the run key
//! `{language}_{model}-{revision}` to its test metrics as percentages.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::info;

use crate::evaluation::{EvaluationReport, METRICS};

/// Results log of one (language, model) pair
#[derive(Debug, Clone)]
pub struct ResultsLog {
    path: PathBuf,
    language: String,
    model: String,
}

impl ResultsLog {
    /// Log at `{dir}/{language}_{model}.jsonl`
    pub fn new(dir: impl AsRef<Path>, language: &str, model: &str) -> Self {
        Self {
            path: dir.as_ref().join(format!("{}_{}.jsonl", language, model)),
            language: language.to_string(),
            model: model.to_string(),
        }
    }

    /// Log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Key of a revision's line
    pub fn run_key(&self, revision: &str) -> String {
        format!("{}_{}-{}", self.language, self.model, revision)
    }

    /// Every reported metric as a percentage
    pub fn percentages(report: &EvaluationReport) -> BTreeMap<String, f64> {
        METRICS
            .iter()
            .map(|metric| (metric.to_string(), 100.0 * report.aligned_accuracy(metric)))
            .collect()
    }

    /// Append one line for `revision`
    pub fn append(&self, revision: &str, report: &EvaluationReport) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create results directory {}", parent.display()))?;
        }

        let metrics: Map<String, Value> = Self::percentages(report)
            .into_iter()
            .map(|(metric, value)| (metric, Value::from(value)))
            .collect();
        let mut line = Map::new();
        line.insert(self.run_key(revision), Value::Object(metrics));

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open results log {}", self.path.display()))?;
        writeln!(file, "{}", Value::Object(line))
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        info!("Appended results of {} to {}", self.run_key(revision), self.path.display());
        Ok(())
    }

    /// Every line of the log, in append order
    pub fn read(&self) -> Result<Vec<BTreeMap<String, BTreeMap<String, f64>>>> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read results log {}", self.path.display()))?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("Malformed results line"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::Score;
    use approx::assert_relative_eq;
    use tempfile::TempDir;

    #[test]
    fn test_append_writes_one_line_per_revision() {
        let dir = TempDir::new().unwrap();
        let log = ResultsLog::new(dir.path(), "en", "hplt");
        let mut report = EvaluationReport::default();
        report.insert("LAS", Score::new(4, 4, 3, 4));

        log.append("step100", &report).unwrap();
        log.append("main", &report).unwrap();

        assert_eq!(log.path(), dir.path().join("en_hplt.jsonl"));
        let lines = log.read().unwrap();
        assert_eq!(lines.len(), 2);
        let first = &lines[0]["en_hplt-step100"];
        assert_relative_eq!(first["LAS"], 75.0);
        assert_eq!(first.len(), METRICS.len());
        assert!(lines[1].contains_key("en_hplt-main"));
    }
}
