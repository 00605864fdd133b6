use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use udtrain::config::{LanguageSet, NormalizeConfig};
use udtrain::training::{runner, TrainingConfig};
use udtrain::utils::init_logging;

#[derive(Parser)]
#[command(name = "udtrain")]
#[command(about = "Universal Dependencies tagger/parser fine-tuning over encoder revisions", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cut every language of a set down to the smallest split sizes
    Normalize {
        /// Language set to normalize
        #[arg(long, default_value = "primary")]
        language_set: LanguageSet,

        /// Directory receiving the subsets
        #[arg(long, default_value = "subsets")]
        out_dir: PathBuf,

        /// JSON file mapping language codes to treebank directories
        #[arg(long, default_value = "language_treebank_mapping.json")]
        treebank_mapping: PathBuf,

        /// Root of the UD release
        #[arg(long, env = "UD_TREEBANKS_DIR", default_value = "ud-treebanks-v2.14")]
        ud_treebanks_dir: PathBuf,

        /// Shuffle seed
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },

    /// Train every revision of an encoder on one language
    Train(TrainArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// Language code
    language: String,

    /// JSON configuration; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Encoder family
    #[arg(long)]
    model: Option<String>,

    /// Train the intermediate checkpoints instead of the hub branches
    #[arg(short, long)]
    fine_grained: bool,

    /// Sentences per batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Peak learning rate
    #[arg(long)]
    lr: Option<f64>,

    /// Weight decay of the task heads
    #[arg(long)]
    weight_decay: Option<f64>,

    /// Dropout on word vectors
    #[arg(long)]
    dropout: Option<f32>,

    /// Label smoothing
    #[arg(long)]
    label_smoothing: Option<f64>,

    /// Epochs per revision
    #[arg(long)]
    epochs: Option<usize>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Minimum count of forms and lemma rules
    #[arg(long)]
    min_count: Option<usize>,

    /// EMA decay
    #[arg(long)]
    ema_decay: Option<f64>,

    /// Record experiment tracking logs
    #[arg(long)]
    log_tracking: bool,

    /// Experiment tracking project
    #[arg(long)]
    project: Option<String>,

    /// Read the full UD release instead of the normalized subsets
    #[arg(long)]
    use_full_ud: bool,

    /// Run on the CPU even when a GPU is available
    #[arg(long)]
    cpu: bool,
}

impl TrainArgs {
    fn into_config(self) -> Result<TrainingConfig> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::from_file(path)
                .with_context(|| format!("Failed to load configuration {}", path.display()))?,
            None => TrainingConfig::default(),
        };
        config.run.language = self.language;

        if let Some(model) = self.model {
            config.run.model = model;
        }
        config.run.fine_grained |= self.fine_grained;
        config.run.log_tracking |= self.log_tracking;
        config.run.use_full_ud |= self.use_full_ud;
        if let Some(project) = self.project {
            config.run.project = project;
        }
        if let Some(seed) = self.seed {
            config.run.seed = seed;
        }
        if let Some(batch_size) = self.batch_size {
            config.training.batch_size = batch_size;
        }
        if let Some(lr) = self.lr {
            config.optimizer.learning_rate = lr;
        }
        if let Some(weight_decay) = self.weight_decay {
            config.optimizer.weight_decay = weight_decay;
        }
        if let Some(dropout) = self.dropout {
            config.training.dropout = dropout;
        }
        if let Some(label_smoothing) = self.label_smoothing {
            config.training.label_smoothing = label_smoothing;
        }
        if let Some(epochs) = self.epochs {
            config.training.epochs = epochs;
        }
        if let Some(min_count) = self.min_count {
            config.training.min_count = min_count;
        }
        if let Some(ema_decay) = self.ema_decay {
            config.training.ema_decay = ema_decay;
        }

        config.apply_language_overrides();
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet, cli.json_logs)?;

    match cli.command {
        Commands::Normalize {
            language_set,
            out_dir,
            treebank_mapping,
            ud_treebanks_dir,
            seed,
        } => {
            let config = NormalizeConfig {
                language_set,
                out_dir,
                treebank_mapping,
                ud_treebanks_dir,
                seed,
            };
            let statistics = udtrain::normalize::run(&config).context("Dataset normalization failed")?;
            info!("Normalized {} languages", statistics.len());
        }

        Commands::Train(args) => {
            let cpu = args.cpu;
            let config = args.into_config()?;
            let device = select_device(cpu)?;
            info!(
                "Training {} on {} ({:?})",
                config.run.model, config.run.language, device
            );
            let outcomes = runner::run(config, device)?;
            for outcome in &outcomes {
                match &outcome.test_metrics {
                    Some(metrics) => info!(
                        "{}: {:?} after {} epochs, test LAS {:.2} MLAS {:.2} BLEX {:.2}",
                        outcome.revision,
                        outcome.phase,
                        outcome.epochs_trained,
                        metrics.get("LAS").copied().unwrap_or_default(),
                        metrics.get("MLAS").copied().unwrap_or_default(),
                        metrics.get("BLEX").copied().unwrap_or_default()
                    ),
                    None => warn!("{}: no test evaluation completed", outcome.revision),
                }
            }
        }
    }

    Ok(())
}

fn select_device(cpu: bool) -> Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    Ok(Device::cuda_if_available(0)?)
}
