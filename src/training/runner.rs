//! Outer loop over pretraining revisions
//!
//! Data is located, read and featurized once with the tokenizer of the
//! registry's reference revision. Each revision then gets a freshly built
//! encoder and a fresh [`UdTrainer`], strictly one after another.

use anyhow::{Context, Result};
use candle_core::Device;
use tracing::{info, instrument};

use crate::encoder::{BertFactory, HfSubwordTokenizer, ModelFamily, RevisionRegistry, SubwordTokenizer};
use crate::training::config::TrainingConfig;
use crate::training::data::RunDatasets;
use crate::training::trainer::{RevisionOutcome, TrainingContext, UdTrainer};

/// Train every revision of the configured model for the configured language
#[instrument(skip_all, fields(language = %config.run.language, model = %config.run.model))]
pub fn run(config: TrainingConfig, device: Device) -> Result<Vec<RevisionOutcome>> {
    config.validate()?;
    let family: ModelFamily = config.run.model.parse()?;
    let registry = RevisionRegistry::new(family, config.run.language.clone(), config.run.fine_grained)
        .with_fine_grained_root(config.paths.fine_grained_root.clone());

    let files = config
        .treebank_layout()?
        .locate(&config.run.language)
        .context("Failed to locate treebank files")?;
    let revisions = registry.revisions()?;
    info!("Training {} revisions of {}", revisions.len(), registry.repository());

    let tokenizer_snapshot = registry.snapshot(&registry.tokenizer_revision()?)?;
    let tokenizer = HfSubwordTokenizer::from_file(&tokenizer_snapshot.tokenizer)?;
    let datasets = RunDatasets::load(&files, &tokenizer, config.training.min_count)?;
    let context = TrainingContext::new(config, device, datasets, tokenizer.pad_id());

    let mut outcomes = Vec::with_capacity(revisions.len());
    for revision in &revisions {
        let name = revision.name();
        info!("Starting revision {}", name);
        let snapshot = registry.snapshot(revision)?;
        let factory = BertFactory::from_files(&snapshot.config, snapshot.weights.clone(), &context.device)?;
        let trainer = UdTrainer::new(&context, &name, &factory)?;
        let outcome = trainer.train()?;
        info!(
            "Revision {} done: {:?}, {} epochs, best dev MLAS+BLEX {:.4}",
            outcome.revision, outcome.phase, outcome.epochs_trained, outcome.best_dev_score
        );
        outcomes.push(outcome);
    }
    Ok(outcomes)
}
