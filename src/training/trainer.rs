//! Training controller for one pretraining revision
//!
//! A [`UdTrainer`] owns a live model, its EMA shadow, the optimizer and the
//! schedule for exactly one revision. Every optimizer step is followed by the
//! EMA update; every epoch checkpoints the shadow, scores it on the dev and
//! test splits and decides whether to continue.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::Device;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::encoder::EncoderFactory;
use crate::evaluation::{Conll18Evaluator, EvaluationError, EvaluationReport, Evaluator, PredictionWriter};
use crate::model::{UdModel, ENCODER_PREFIX};
use crate::training::checkpoints::CheckpointManager;
use crate::training::config::TrainingConfig;
use crate::training::data::{Batch, BatchCollator, DataLoader, DataLoaderConfig, DatasetState, RunDatasets, UdDataset};
use crate::training::ema::ExponentialMovingAverage;
use crate::training::loss::{LossBreakdown, LossComposer};
use crate::training::optimizers::{create_optimizer, create_scheduler, AdamWOptimizer, CosineScheduler, Optimizer, Scheduler};
use crate::training::results::ResultsLog;
use crate::training::stopping::{EarlyStopping, StopDecision};
use crate::training::tracking::{ExperimentTracker, RunIdentity};

/// Everything a revision's trainer reads but never mutates
pub struct TrainingContext {
    /// Run configuration
    pub config: TrainingConfig,
    /// Device tensors live on
    pub device: Device,
    /// Training vocabularies
    pub state: Arc<DatasetState>,
    /// Training split
    pub train: Arc<UdDataset>,
    /// Development split
    pub dev: Option<Arc<UdDataset>>,
    /// Test split
    pub test: Arc<UdDataset>,
    /// Subword padding id
    pub pad_id: u32,
}

impl TrainingContext {
    /// Context over loaded datasets
    pub fn new(config: TrainingConfig, device: Device, datasets: RunDatasets, pad_id: u32) -> Self {
        Self {
            config,
            device,
            state: Arc::new(datasets.state),
            train: Arc::new(datasets.train),
            dev: datasets.dev.map(Arc::new),
            test: Arc::new(datasets.test),
            pad_id,
        }
    }

    fn loader(&self, dataset: &Arc<UdDataset>, config: DataLoaderConfig) -> DataLoader {
        DataLoader::new(
            Arc::clone(dataset),
            config,
            BatchCollator::new(self.pad_id, self.device.clone()),
        )
    }
}

/// Where a revision's training currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingPhase {
    /// Learning rate still ramping up
    Warmup,
    /// Past warmup
    Training,
    /// Scoring the shadow model between epochs
    Evaluating,
    /// Stopped by a dev regression or an evaluator failure
    EarlyStopped,
    /// All epochs ran
    Completed,
}

/// Training state of one revision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingState {
    /// Current epoch, 0-based
    pub epoch: usize,
    /// Optimizer steps taken
    pub global_step: usize,
    /// Current phase
    pub phase: TrainingPhase,
    /// Mean training loss of every finished epoch
    pub epoch_losses: Vec<f64>,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            epoch: 0,
            global_step: 0,
            phase: TrainingPhase::Warmup,
            epoch_losses: Vec::new(),
        }
    }
}

/// What a revision's training produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionOutcome {
    /// Revision name
    pub revision: String,
    /// Final phase, `Completed` or `EarlyStopped`
    pub phase: TrainingPhase,
    /// Epochs whose training pass finished
    pub epochs_trained: usize,
    /// Optimizer steps taken
    pub global_step: usize,
    /// Best dev MLAS + BLEX
    pub best_dev_score: f64,
    /// Test metrics of the last evaluated epoch, as percentages
    pub test_metrics: Option<BTreeMap<String, f64>>,
    /// Checkpoint directory
    pub checkpoint_dir: PathBuf,
}

/// Trains one revision from a fresh model
pub struct UdTrainer<'a> {
    context: &'a TrainingContext,
    revision: String,
    model: UdModel,
    ema_model: UdModel,
    ema: ExponentialMovingAverage,
    optimizer: AdamWOptimizer,
    scheduler: CosineScheduler,
    composer: LossComposer,
    /// Taken out for the duration of an epoch
    train_loader: Option<DataLoader>,
    dev_loader: Option<DataLoader>,
    test_loader: DataLoader,
    checkpoints: CheckpointManager,
    results: ResultsLog,
    tracker: ExperimentTracker,
    evaluator: Box<dyn Evaluator>,
    stopping: EarlyStopping,
    state: TrainingState,
    test_metrics: Option<BTreeMap<String, f64>>,
}

impl<'a> UdTrainer<'a> {
    /// Build fresh live and shadow models for `revision`
    ///
    /// The live encoder is initialized from the factory's pretrained weights
    /// and the shadow starts as an exact copy of the live model.
    #[instrument(skip(context, factory), fields(language = %context.config.run.language))]
    pub fn new(context: &'a TrainingContext, revision: &str, factory: &dyn EncoderFactory) -> Result<Self> {
        let config = &context.config;
        config.validate().context("Training configuration validation failed")?;
        if let Err(e) = context.device.set_seed(config.run.seed) {
            debug!("Device RNG not seeded: {}", e);
        }

        let sizes = context.state.head_sizes();
        let model = UdModel::new(factory, &sizes, config.head_config(), &context.device)?;
        let loaded = factory.load_pretrained(model.varmap(), ENCODER_PREFIX)?;
        debug!("Loaded {} pretrained encoder tensors", loaded);
        let ema_model = UdModel::new(factory, &sizes, config.head_config(), &context.device)?;
        ema_model.copy_from(&model)?;
        let ema = ExponentialMovingAverage::new(&ema_model, &model, config.training.ema_decay)?;

        let train_loader = context.loader(
            &context.train,
            DataLoaderConfig::train(config.training.batch_size, config.run.seed),
        );
        let eval_config = DataLoaderConfig::eval(config.training.batch_size);
        let dev_loader = context
            .dev
            .as_ref()
            .map(|dev| context.loader(dev, eval_config.clone()));
        let test_loader = context.loader(&context.test, eval_config);

        let total_steps = config.training.epochs * train_loader.num_batches();
        let optimizer = create_optimizer(model.parameters()?, &config.optimizer);
        let scheduler = create_scheduler(&config.scheduler, total_steps);

        let run = &config.run;
        let checkpoints = CheckpointManager::new(&config.paths.checkpoint_dir, &run.language, &run.model, revision);
        let results = ResultsLog::new(&config.paths.results_dir, &run.language, &run.model);
        let identity = RunIdentity::new(&run.project, &run.model, &run.language, revision);
        let tracker = if run.log_tracking {
            ExperimentTracker::create(&config.paths.tracking_dir, identity, serde_json::to_value(config)?)?
        } else {
            ExperimentTracker::disabled(identity)
        };

        info!(
            "Revision {}: {} parameters, {} steps over {} epochs",
            revision,
            model.parameter_count(),
            total_steps,
            config.training.epochs
        );

        Ok(Self {
            context,
            revision: revision.to_string(),
            model,
            ema_model,
            ema,
            optimizer,
            scheduler,
            composer: LossComposer::new(config.training.label_smoothing),
            train_loader: Some(train_loader),
            dev_loader,
            test_loader,
            checkpoints,
            results,
            tracker,
            evaluator: Box::new(Conll18Evaluator),
            stopping: EarlyStopping::new(),
            state: TrainingState::default(),
            test_metrics: None,
        })
    }

    /// Score with `evaluator` instead of the bundled one
    pub fn with_evaluator(mut self, evaluator: Box<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Current training state
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// The EMA shadow model
    pub fn ema_model(&self) -> &UdModel {
        &self.ema_model
    }

    /// The live model
    pub fn model(&self) -> &UdModel {
        &self.model
    }

    /// Optimizer steps per epoch
    pub fn steps_per_epoch(&self) -> usize {
        self.train_loader.as_ref().map_or(0, DataLoader::num_batches)
    }

    /// Run every epoch until completion or early stop
    #[instrument(skip(self), fields(revision = %self.revision))]
    pub fn train(mut self) -> Result<RevisionOutcome> {
        let start = Instant::now();
        let epochs = self.context.config.training.epochs;

        for epoch in 0..epochs {
            self.state.epoch = epoch;
            let mean_loss = self.train_epoch()?;
            self.state.epoch_losses.push(mean_loss);
            info!("Epoch {}/{}: mean loss {:.4}", epoch + 1, epochs, mean_loss);

            self.checkpoints.save(&self.ema_model, &self.context.state)?;

            self.state.phase = TrainingPhase::Evaluating;
            if self.evaluate_epoch(epoch)? == StopDecision::Stop {
                self.state.phase = TrainingPhase::EarlyStopped;
                break;
            }
            self.state.phase = self.step_phase();
        }

        if self.state.phase != TrainingPhase::EarlyStopped {
            self.state.phase = TrainingPhase::Completed;
        }
        self.tracker.finish()?;
        info!(
            "Revision {} finished as {:?} after {} steps in {:.1?}",
            self.revision,
            self.state.phase,
            self.state.global_step,
            start.elapsed()
        );

        Ok(RevisionOutcome {
            revision: self.revision.clone(),
            phase: self.state.phase,
            epochs_trained: self.state.epoch_losses.len(),
            global_step: self.state.global_step,
            best_dev_score: self.stopping.best(),
            test_metrics: self.test_metrics.take(),
            checkpoint_dir: self.checkpoints.dir().to_path_buf(),
        })
    }

    fn step_phase(&self) -> TrainingPhase {
        if self.state.global_step < self.context.config.scheduler.warmup_steps {
            TrainingPhase::Warmup
        } else {
            TrainingPhase::Training
        }
    }

    /// One pass over the shuffled training split; returns the mean loss
    pub fn train_epoch(&mut self) -> Result<f64> {
        let mut loader = self
            .train_loader
            .take()
            .context("Training loader is already iterating")?;
        let result = self.run_batches(&mut loader);
        self.train_loader = Some(loader);
        result
    }

    fn run_batches(&mut self, loader: &mut DataLoader) -> Result<f64> {
        let progress = ProgressBar::new(loader.num_batches() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            progress.set_style(style);
        }

        let mut total = 0.0;
        let mut steps = 0usize;
        for batch in loader.epoch() {
            let breakdown = self.train_step(&batch?)?;
            total += breakdown.total;
            steps += 1;
            progress.set_message(format!("loss {:.4}", breakdown.total));
            progress.inc(1);
        }
        progress.finish_and_clear();

        Ok(if steps == 0 { 0.0 } else { total / steps as f64 })
    }

    /// Forward, loss, backward, clipped update, schedule, EMA
    pub fn train_step(&mut self, batch: &Batch) -> Result<LossBreakdown> {
        self.state.phase = self.step_phase();
        let output = self.model.forward(&batch.model_input(true), true)?;
        let (loss, breakdown) = self.composer.compute(&output, batch)?;
        let gradients = loss.backward()?;

        self.optimizer.set_lr_factor(self.scheduler.factor());
        let stats = self.optimizer.step(&gradients)?;
        self.scheduler.step();
        self.ema.update()?;
        self.state.global_step += 1;

        self.tracker
            .log_step(self.state.global_step, &breakdown, stats.grad_norm, stats.learning_rate)?;
        Ok(breakdown)
    }

    /// Score the shadow model on dev then test
    ///
    /// A dev regression or an evaluator failure stops the revision; test
    /// results are appended to the results log whenever test is reached.
    pub fn evaluate_epoch(&mut self, epoch: usize) -> Result<StopDecision> {
        if self.dev_loader.is_some() {
            let report = match self.evaluate_split(0)? {
                Ok(report) => report,
                Err(e) => {
                    info!("Stopping revision {}: dev evaluation failed: {}", self.revision, e);
                    return Ok(StopDecision::Stop);
                }
            };
            let metrics = report.aligned_accuracies();
            self.tracker.log_evaluation(epoch, "dev", &metrics)?;
            info!("Dev: {}", report.summary());

            let score = EarlyStopping::compound(report.aligned_accuracy("MLAS"), report.aligned_accuracy("BLEX"));
            if self.stopping.observe(score) == StopDecision::Stop {
                info!(
                    "Stopping revision {}: dev MLAS+BLEX {:.4} below best {:.4}",
                    self.revision,
                    score,
                    self.stopping.best()
                );
                return Ok(StopDecision::Stop);
            }
        }

        let report = match self.evaluate_split(1)? {
            Ok(report) => report,
            Err(e) => {
                info!("Stopping revision {}: test evaluation failed: {}", self.revision, e);
                return Ok(StopDecision::Stop);
            }
        };
        info!("Test: {}", report.summary());
        self.results.append(&self.revision, &report)?;
        self.test_metrics = Some(ResultsLog::percentages(&report));
        Ok(StopDecision::Continue)
    }

    /// Write predictions for split `index` (0 dev, 1 test) and score them
    ///
    /// The outer error is a failure of the run; the inner one only means the
    /// prediction file could not be scored.
    fn evaluate_split(&mut self, index: usize) -> Result<Result<EvaluationReport, EvaluationError>> {
        let run = &self.context.config.run;
        let path = self
            .context
            .config
            .paths
            .prediction_dir
            .join(format!("{}_{}_{}.conllu", run.language, run.model, index));

        let loader = match index {
            0 => match self.dev_loader.as_mut() {
                Some(loader) => loader,
                None => return Err(anyhow::anyhow!("No dev split to evaluate")),
            },
            _ => &mut self.test_loader,
        };
        let writer = PredictionWriter::new(&self.context.state);
        writer.write(&self.ema_model, loader, &path)?;

        let dataset = loader.dataset();
        let outcome = match dataset.path() {
            Some(gold) => self.evaluator.evaluate_files(gold, &path),
            None => crate::treebank::Treebank::from_file(&path)
                .map_err(|e| EvaluationError::Parse {
                    path: path.clone(),
                    reason: e.to_string(),
                })
                .and_then(|system| self.evaluator.evaluate(dataset.treebank(), &system)),
        };
        if let Err(e) = &outcome {
            warn!("Evaluation of {} failed: {}", path.display(), e);
        }
        Ok(outcome)
    }
}
