//! Common utilities for testing the training pipeline

use std::path::{Path, PathBuf};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{embedding, Embedding, Module, VarBuilder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use crate::encoder::{Encoder, EncoderFactory, SubwordTokenizer};
use crate::model::UdModel;
use crate::training::config::TrainingConfig;
use crate::training::data::{DatasetState, RunDatasets, UdDataset};
use crate::training::trainer::TrainingContext;
use crate::treebank::Treebank;

/// Create a test device (CPU for CI compatibility)
pub fn create_test_device() -> Device {
    Device::Cpu
}

/// Padding, unknown, boundary and separator ids of [`CharTokenizer`]
pub const PAD_ID: u32 = 0;
const UNK_ID: u32 = 1;
const CLS_ID: u32 = 2;
const SEP_ID: u32 = 3;
const FIRST_PIECE_ID: u32 = 4;

/// Vocabulary size of [`CharTokenizer`]
pub const CHAR_VOCAB_SIZE: usize = 32;

/// Splits words into three-character pieces hashed into a small vocabulary
#[derive(Debug, Clone, Copy, Default)]
pub struct CharTokenizer;

impl SubwordTokenizer for CharTokenizer {
    fn encode_word(&self, word: &str) -> crate::Result<Vec<u32>> {
        let chars: Vec<char> = word.chars().collect();
        Ok(chars
            .chunks(3)
            .map(|piece| {
                let sum: u32 = piece.iter().map(|&c| c as u32).sum();
                FIRST_PIECE_ID + sum % (CHAR_VOCAB_SIZE as u32 - FIRST_PIECE_ID)
            })
            .collect())
    }

    fn cls_id(&self) -> u32 {
        CLS_ID
    }

    fn sep_id(&self) -> u32 {
        SEP_ID
    }

    fn pad_id(&self) -> u32 {
        PAD_ID
    }

    fn unk_id(&self) -> u32 {
        UNK_ID
    }
}

/// Non-contextual encoder: a lookup table masked by attention
pub struct TinyEncoder {
    embeddings: Embedding,
    hidden_size: usize,
}

impl Encoder for TinyEncoder {
    fn forward(&self, subwords: &Tensor, attention_mask: &Tensor, _train: bool) -> crate::Result<Tensor> {
        let hidden = self.embeddings.forward(subwords)?;
        let mask = attention_mask.to_dtype(hidden.dtype())?.unsqueeze(2)?;
        Ok(hidden.broadcast_mul(&mask)?)
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}

/// Builds [`TinyEncoder`]s over the [`CharTokenizer`] vocabulary
#[derive(Debug, Clone, Copy)]
pub struct TinyEncoderFactory {
    /// Width of the embeddings
    pub hidden_size: usize,
}

impl Default for TinyEncoderFactory {
    fn default() -> Self {
        Self { hidden_size: 16 }
    }
}

impl EncoderFactory for TinyEncoderFactory {
    fn build(&self, vb: VarBuilder) -> crate::Result<Box<dyn Encoder>> {
        Ok(Box::new(TinyEncoder {
            embeddings: embedding(CHAR_VOCAB_SIZE, self.hidden_size, vb.pp("embeddings"))?,
            hidden_size: self.hidden_size,
        }))
    }

    fn dtype(&self) -> DType {
        DType::F32
    }
}

/// (form, lemma, upos, xpos, feats, deprel)
const LEXICON: &[(&str, &str, &str, &str, &str, &str)] = &[
    ("the", "the", "DET", "DT", "Definite=Def|PronType=Art", "det"),
    ("a", "a", "DET", "DT", "Definite=Ind|PronType=Art", "det"),
    ("dogs", "dog", "NOUN", "NNS", "Number=Plur", "nsubj"),
    ("dog", "dog", "NOUN", "NN", "Number=Sing", "obj"),
    ("Cats", "cat", "NOUN", "NNS", "Number=Plur", "nsubj"),
    ("ran", "run", "VERB", "VBD", "Tense=Past|VerbForm=Fin", "conj"),
    ("walked", "walk", "VERB", "VBD", "Tense=Past|VerbForm=Fin", "conj"),
    ("quickly", "quickly", "ADV", "RB", "_", "advmod"),
    ("big", "big", "ADJ", "JJ", "Degree=Pos", "amod"),
    ("in", "in", "ADP", "IN", "_", "case"),
];

/// Random well-formed treebank; word 1 is the root and every other word
/// attaches to an earlier one
pub fn synthetic_treebank(sentences: usize, seed: u64) -> Treebank {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut content = String::new();

    for s in 0..sentences {
        content.push_str(&format!("# sent_id = synthetic-{}\n", s + 1));
        let length = rng.random_range(2..=6);
        for position in 1..=length {
            let (form, lemma, upos, xpos, feats, deprel) = LEXICON[rng.random_range(0..LEXICON.len())];
            let (head, deprel) = if position == 1 {
                (0, "root")
            } else {
                (rng.random_range(1..position), deprel)
            };
            content.push_str(&format!(
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t_\t_\n",
                position, form, lemma, upos, xpos, feats, head, deprel
            ));
        }
        content.push('\n');
    }

    Treebank::parse_str(&content).expect("synthetic treebank is well formed")
}

/// Write a synthetic treebank to `dir/name`
pub fn write_treebank(dir: &Path, name: &str, sentences: usize, seed: u64) -> Result<PathBuf> {
    let path = dir.join(name);
    synthetic_treebank(sentences, seed).write_to(&path)?;
    Ok(path)
}

/// Small, fast configuration whose artifacts all land under `root`
pub fn create_test_config(root: &Path) -> TrainingConfig {
    let mut config = TrainingConfig::for_language("xx");
    config.run.model = "tiny".to_string();
    config.training.batch_size = 4;
    config.training.epochs = 2;
    config.training.min_count = 1;
    config.training.arc_hidden_size = 8;
    config.training.dropout = 0.1;
    config.scheduler.warmup_steps = 2;
    config.optimizer.learning_rate = 1e-2;
    config.paths.subsets_dir = root.join("subsets");
    config.paths.checkpoint_dir = root.join("checkpoints");
    config.paths.prediction_dir = root.join("predictions");
    config.paths.results_dir = root.join("results");
    config.paths.tracking_dir = root.join("tracking");
    config
}

/// In-memory splits over synthetic treebanks
pub fn synthetic_datasets(train: usize, dev: Option<usize>, test: usize) -> Result<RunDatasets> {
    let train_treebank = synthetic_treebank(train, 1);
    let state = DatasetState::build(&train_treebank.sentences, 1);
    let dev = dev
        .map(|n| UdDataset::new(synthetic_treebank(n, 2), &state, &CharTokenizer))
        .transpose()?;
    let test = UdDataset::new(synthetic_treebank(test, 3), &state, &CharTokenizer)?;
    let train = UdDataset::new(train_treebank, &state, &CharTokenizer)?;
    Ok(RunDatasets {
        state,
        train,
        dev,
        test,
    })
}

/// Temporary workspace with a ready training context
pub struct TrainingFixture {
    /// Keeps the workspace alive
    pub temp_dir: TempDir,
    /// Context over synthetic data
    pub context: TrainingContext,
}

impl TrainingFixture {
    /// Fixture with a dev split
    pub fn new() -> Result<Self> {
        Self::with_splits(12, Some(6), 6)
    }

    /// Fixture with the given split sizes
    pub fn with_splits(train: usize, dev: Option<usize>, test: usize) -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let config = create_test_config(temp_dir.path());
        let datasets = synthetic_datasets(train, dev, test)?;
        let context = TrainingContext::new(config, create_test_device(), datasets, PAD_ID);
        Ok(Self { temp_dir, context })
    }

    /// Workspace root
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }
}

/// Flattened values of the variable `name` of `model`
pub fn variable_values(model: &UdModel, name: &str) -> Result<Vec<f32>> {
    let data = model
        .varmap()
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?;
    let var = data
        .get(name)
        .ok_or_else(|| anyhow::anyhow!("no variable {}", name))?;
    Ok(var.as_tensor().flatten_all()?.to_vec1::<f32>()?)
}

/// Assert two slices are close within tolerance
pub fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= tolerance, "index {}: {} vs {}", i, a, e);
    }
}
