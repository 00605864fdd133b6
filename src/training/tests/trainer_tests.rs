//! Tests for the per-revision training controller

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use approx::assert_relative_eq;

use crate::evaluation::{EvaluationError, EvaluationReport, Evaluator, Score};
use crate::training::data::{BatchCollator, DataLoader, DataLoaderConfig};
use crate::training::results::ResultsLog;
use crate::training::stopping::StopDecision;
use crate::training::trainer::{TrainingPhase, UdTrainer};
use crate::treebank::Treebank;

use super::test_utils::{create_test_device, variable_values, TinyEncoderFactory, TrainingFixture, PAD_ID};

/// Returns queued MLAS/BLEX percentages; `None` fails the evaluation
struct ScriptedEvaluator {
    script: Mutex<VecDeque<Option<usize>>>,
}

impl ScriptedEvaluator {
    fn new(script: &[Option<usize>]) -> Box<Self> {
        Box::new(Self {
            script: Mutex::new(script.iter().copied().collect()),
        })
    }
}

impl Evaluator for ScriptedEvaluator {
    fn evaluate(&self, _gold: &Treebank, _system: &Treebank) -> Result<EvaluationReport, EvaluationError> {
        let next = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .expect("evaluation past end of script");
        match next {
            Some(percent) => {
                let mut report = EvaluationReport::default();
                report.insert("MLAS", Score::new(100, 100, percent, 100));
                report.insert("BLEX", Score::new(100, 100, percent, 100));
                Ok(report)
            }
            None => Err(EvaluationError::Cycle { sentence: 0 }),
        }
    }
}

#[test]
fn test_trainer_initialization() -> Result<()> {
    let fixture = TrainingFixture::new()?;
    let trainer = UdTrainer::new(&fixture.context, "main", &TinyEncoderFactory::default())?;

    assert_eq!(trainer.steps_per_epoch(), 3);
    assert_eq!(trainer.state().global_step, 0);
    assert_eq!(trainer.state().phase, TrainingPhase::Warmup);
    for name in ["heads.upos.weight", "encoder.embeddings.weight"] {
        assert_eq!(
            variable_values(trainer.model(), name)?,
            variable_values(trainer.ema_model(), name)?,
            "{}",
            name
        );
    }
    Ok(())
}

#[test]
fn test_invalid_config_rejected() -> Result<()> {
    let mut fixture = TrainingFixture::new()?;
    fixture.context.config.training.epochs = 0;
    assert!(UdTrainer::new(&fixture.context, "main", &TinyEncoderFactory::default()).is_err());
    Ok(())
}

#[test]
fn test_ema_tracks_live_model_after_each_step() -> Result<()> {
    let fixture = TrainingFixture::new()?;
    let mut trainer = UdTrainer::new(&fixture.context, "main", &TinyEncoderFactory::default())?;
    let decay = fixture.context.config.training.ema_decay;
    let mut loader = DataLoader::new(
        Arc::clone(&fixture.context.train),
        DataLoaderConfig::eval(4),
        BatchCollator::new(PAD_ID, create_test_device()),
    );
    let batches: Vec<_> = loader.epoch().collect::<Result<_, _>>()?;
    let name = "heads.upos.weight";

    // warmup starts at a zero learning rate
    trainer.train_step(&batches[0])?;
    assert_eq!(trainer.state().phase, TrainingPhase::Warmup);
    let live_before = variable_values(trainer.model(), name)?;
    let shadow_before = variable_values(trainer.ema_model(), name)?;

    let breakdown = trainer.train_step(&batches[1])?;
    assert!(breakdown.total.is_finite());
    assert_eq!(trainer.state().global_step, 2);

    let live_after = variable_values(trainer.model(), name)?;
    let shadow_after = variable_values(trainer.ema_model(), name)?;
    assert_ne!(live_before, live_after);
    for ((&shadow, &previous), &live) in shadow_after.iter().zip(&shadow_before).zip(&live_after) {
        let expected = decay * previous as f64 + (1.0 - decay) * live as f64;
        assert_relative_eq!(shadow as f64, expected, epsilon = 1e-5);
    }
    Ok(())
}

#[test]
fn test_dev_regression_stops_revision() -> Result<()> {
    let mut fixture = TrainingFixture::new()?;
    fixture.context.config.training.epochs = 4;
    // epoch 1: dev 30 + 30, test 50 + 50; epoch 2: dev 20 + 20
    let evaluator = ScriptedEvaluator::new(&[Some(30), Some(50), Some(20)]);
    let trainer =
        UdTrainer::new(&fixture.context, "step100", &TinyEncoderFactory::default())?.with_evaluator(evaluator);
    let outcome = trainer.train()?;

    assert_eq!(outcome.phase, TrainingPhase::EarlyStopped);
    assert_eq!(outcome.epochs_trained, 2);
    assert_eq!(outcome.global_step, 6);
    assert_relative_eq!(outcome.best_dev_score, 0.6);
    let metrics = outcome.test_metrics.expect("test evaluated once");
    assert_relative_eq!(metrics["MLAS"], 50.0);
    assert_relative_eq!(metrics["LAS"], 0.0);
    assert!(outcome.checkpoint_dir.ends_with("ud-xx-tiny-step100"));

    let config = &fixture.context.config;
    let log = ResultsLog::new(&config.paths.results_dir, "xx", "tiny");
    let lines = log.read()?;
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains_key("xx_tiny-step100"));
    Ok(())
}

#[test]
fn test_equal_dev_score_continues() -> Result<()> {
    let fixture = TrainingFixture::new()?;
    let evaluator = ScriptedEvaluator::new(&[Some(30), Some(40), Some(30), Some(45)]);
    let trainer = UdTrainer::new(&fixture.context, "main", &TinyEncoderFactory::default())?.with_evaluator(evaluator);
    let outcome = trainer.train()?;

    assert_eq!(outcome.phase, TrainingPhase::Completed);
    assert_eq!(outcome.epochs_trained, 2);
    let metrics = outcome.test_metrics.expect("test evaluated");
    assert_relative_eq!(metrics["BLEX"], 45.0);
    Ok(())
}

#[test]
fn test_evaluator_failure_stops_revision() -> Result<()> {
    let fixture = TrainingFixture::new()?;
    let evaluator = ScriptedEvaluator::new(&[None]);
    let trainer = UdTrainer::new(&fixture.context, "main", &TinyEncoderFactory::default())?.with_evaluator(evaluator);
    let outcome = trainer.train()?;

    assert_eq!(outcome.phase, TrainingPhase::EarlyStopped);
    assert_eq!(outcome.epochs_trained, 1);
    assert_eq!(outcome.best_dev_score, 0.0);
    assert!(outcome.test_metrics.is_none());
    // the checkpoint is written before evaluation
    assert!(outcome.checkpoint_dir.join("model.safetensors").is_file());
    Ok(())
}

#[test]
fn test_evaluate_epoch_without_dev_goes_to_test() -> Result<()> {
    let fixture = TrainingFixture::with_splits(8, None, 4)?;
    let evaluator = ScriptedEvaluator::new(&[Some(10)]);
    let mut trainer =
        UdTrainer::new(&fixture.context, "main", &TinyEncoderFactory::default())?.with_evaluator(evaluator);

    assert_eq!(trainer.evaluate_epoch(0)?, StopDecision::Continue);
    let prediction = fixture
        .context
        .config
        .paths
        .prediction_dir
        .join("xx_tiny_1.conllu");
    let written = Treebank::from_file(&prediction)?;
    assert_eq!(written.len(), 4);
    assert_eq!(
        written.token_count(),
        fixture.context.test.treebank().token_count()
    );
    Ok(())
}
