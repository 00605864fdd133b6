//! Joint tagger/parser over a pretrained encoder
//!
//! Subword vectors are pooled into word vectors through the batch's one-hot
//! alignment map (position 0 is the sentence boundary standing in for the
//! root, positions `1..=n` are words). Every task gets its own classifier;
//! arcs are scored with a bilinear form over (dependent, candidate head)
//! pairs, and dependency labels are predicted from the dependent and its
//! head, gold during training and decoded at inference.

pub mod decoding;
pub mod params;

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{layer_norm, linear, LayerNorm, Linear, Module, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::encoder::{Encoder, EncoderFactory};
use crate::error::{Error, Result};

pub use decoding::{chu_liu_edmonds, decode_single_root};
pub use params::{describe, no_decay, ParamDescriptor, ParamKind, ParamOwner};

/// Variable prefix of the encoder
pub const ENCODER_PREFIX: &str = "encoder";
/// Variable prefix of the task heads
pub const HEADS_PREFIX: &str = "heads";

/// Output classes per task, taken from the training vocabularies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadSizes {
    /// Lemma rule classes per rule type
    pub lemma: BTreeMap<String, usize>,
    /// Universal POS classes
    pub upos: usize,
    /// Language-specific POS classes
    pub xpos: usize,
    /// Full feature-string classes
    pub feats: usize,
    /// Dependency label classes
    pub deprel: usize,
    /// Value classes per auxiliary feature
    pub aux_feats: BTreeMap<String, usize>,
}

/// Head hyperparameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeadConfig {
    /// Dropout on pooled word vectors during training
    pub dropout: f32,
    /// Width of the arc scorer projections
    pub arc_hidden_size: usize,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            dropout: 0.3,
            arc_hidden_size: 512,
        }
    }
}

/// Model inputs for one batch
#[derive(Debug)]
pub struct ModelInput<'a> {
    /// `[batch, seq]` u32 subword ids
    pub subwords: &'a Tensor,
    /// `[batch, seq]` u32, 1 on real subwords
    pub attention_mask: &'a Tensor,
    /// `[batch, seq, words + 2]` f32 one-hot alignment
    pub alignment: &'a Tensor,
    /// Words per sentence, root excluded
    pub word_counts: &'a [usize],
    /// `[batch, words]` i64 gold heads, -1 on padding; `None` at inference
    pub gold_heads: Option<&'a Tensor>,
}

/// Per-task logits for one batch
#[derive(Debug)]
pub struct ModelOutput {
    /// `[batch, words, classes]` per lemma rule type
    pub lemma: BTreeMap<String, Tensor>,
    /// `[batch, words, classes]`
    pub upos: Tensor,
    /// `[batch, words, classes]`
    pub xpos: Tensor,
    /// `[batch, words, classes]`
    pub feats: Tensor,
    /// `[batch, words, classes]` per auxiliary feature
    pub aux_feats: BTreeMap<String, Tensor>,
    /// `[batch, words, words + 1]`, `-inf` on invalid candidate heads
    pub head_scores: Tensor,
    /// `[batch, words, labels]`
    pub deprel: Tensor,
    /// Decoded heads per sentence, only at inference
    pub predicted_heads: Option<Vec<Vec<usize>>>,
}

struct TaskHeads {
    word_norm: LayerNorm,
    lemma: BTreeMap<String, Linear>,
    upos: Linear,
    xpos: Linear,
    feats: Linear,
    aux_feats: BTreeMap<String, Linear>,
    arc_dep: Linear,
    arc_head: Linear,
    arc_bilinear: Tensor,
    arc_head_bias: Linear,
    deprel: Linear,
}

impl TaskHeads {
    fn new(vb: VarBuilder, hidden: usize, sizes: &HeadSizes, config: &HeadConfig) -> Result<Self> {
        let arc = config.arc_hidden_size;
        let classifiers = |vb: VarBuilder, sizes: &BTreeMap<String, usize>| {
            sizes
                .iter()
                .map(|(name, &classes)| Ok((name.clone(), linear(hidden, classes, vb.pp(name))?)))
                .collect::<Result<BTreeMap<_, _>>>()
        };

        Ok(Self {
            word_norm: layer_norm(hidden, 1e-5, vb.pp("word_norm"))?,
            lemma: classifiers(vb.pp("lemma"), &sizes.lemma)?,
            upos: linear(hidden, sizes.upos, vb.pp("upos"))?,
            xpos: linear(hidden, sizes.xpos, vb.pp("xpos"))?,
            feats: linear(hidden, sizes.feats, vb.pp("feats"))?,
            aux_feats: classifiers(vb.pp("aux_feats"), &sizes.aux_feats)?,
            arc_dep: linear(hidden, arc, vb.pp("arc_dep"))?,
            arc_head: linear(hidden, arc, vb.pp("arc_head"))?,
            arc_bilinear: vb
                .pp("arc_bilinear")
                .get_with_hints((arc, arc), "weight", candle_nn::init::ZERO)?,
            arc_head_bias: linear(arc, 1, vb.pp("arc_head_bias"))?,
            deprel: linear(2 * hidden, sizes.deprel, vb.pp("deprel"))?,
        })
    }
}

/// Encoder plus task heads over one [`VarMap`]
pub struct UdModel {
    encoder: Box<dyn Encoder>,
    heads: TaskHeads,
    varmap: VarMap,
    config: HeadConfig,
    device: Device,
}

impl UdModel {
    /// Build a freshly initialized model over a new variable map
    pub fn new(
        factory: &dyn EncoderFactory,
        sizes: &HeadSizes,
        config: HeadConfig,
        device: &Device,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, factory.dtype(), device);
        let encoder = factory.build(vb.pp(ENCODER_PREFIX))?;
        let heads = TaskHeads::new(vb.pp(HEADS_PREFIX), encoder.hidden_size(), sizes, &config)?;
        debug!(
            "Built model with {} variables ({} parameters)",
            varmap.all_vars().len(),
            count_parameters(&varmap)
        );

        Ok(Self {
            encoder,
            heads,
            varmap,
            config,
            device: device.clone(),
        })
    }

    /// Variables of this model
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Every parameter with its descriptor, sorted by name
    pub fn parameters(&self) -> Result<Vec<(ParamDescriptor, Var)>> {
        describe(&self.varmap, ENCODER_PREFIX)
    }

    /// Total number of scalar parameters
    pub fn parameter_count(&self) -> usize {
        count_parameters(&self.varmap)
    }

    /// Device the variables live on
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Overwrite every variable with the same-named variable of `other`
    pub fn copy_from(&self, other: &UdModel) -> Result<()> {
        let source = other
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::config("variable map lock poisoned"))?;
        let target = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::config("variable map lock poisoned"))?;
        for (name, var) in target.iter() {
            let value = source
                .get(name)
                .ok_or_else(|| Error::config(format!("variable {} missing from source model", name)))?;
            var.set(&value.as_tensor().copy()?)?;
        }
        Ok(())
    }

    /// Write all variables as safetensors
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.varmap.save(path)?;
        Ok(())
    }

    /// Load all variables from safetensors written by [`UdModel::save`]
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.varmap.load(path)?;
        Ok(())
    }

    /// Run every head over one batch
    pub fn forward(&self, input: &ModelInput<'_>, train: bool) -> Result<ModelOutput> {
        let hidden = self.encoder.forward(input.subwords, input.attention_mask, train)?;

        let alignment = input.alignment.to_dtype(hidden.dtype())?.transpose(1, 2)?.contiguous()?;
        let summed = alignment.matmul(&hidden.contiguous()?)?;
        let counts = alignment.sum_keepdim(2)?.maximum(1.0)?;
        let pooled = summed.broadcast_div(&counts)?;
        let pooled = self.heads.word_norm.forward(&pooled)?;
        let pooled = if train && self.config.dropout > 0.0 {
            candle_nn::ops::dropout(&pooled, self.config.dropout)?
        } else {
            pooled
        };

        let (batch, positions, width) = pooled.dims3()?;
        let n_words = positions.saturating_sub(2);
        let words = pooled.narrow(1, 1, n_words)?.contiguous()?;
        let nodes = pooled.narrow(1, 0, n_words + 1)?.contiguous()?;

        let lemma = self
            .heads
            .lemma
            .iter()
            .map(|(name, head)| Ok((name.clone(), head.forward(&words)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        let aux_feats = self
            .heads
            .aux_feats
            .iter()
            .map(|(name, head)| Ok((name.clone(), head.forward(&words)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        let upos = self.heads.upos.forward(&words)?;
        let xpos = self.heads.xpos.forward(&words)?;
        let feats = self.heads.feats.forward(&words)?;

        let head_scores = self.arc_scores(&words, &nodes, input.word_counts)?;

        let (head_index, predicted_heads) = match input.gold_heads {
            Some(gold) => (gold.maximum(0i64)?.to_dtype(DType::U32)?, None),
            None => {
                let decoded = decode_heads(&head_scores, input.word_counts)?;
                (heads_tensor(&decoded, batch, n_words, &self.device)?, Some(decoded))
            }
        };
        let index = head_index
            .unsqueeze(2)?
            .broadcast_as((batch, n_words, width))?
            .contiguous()?;
        let head_vectors = nodes.gather(&index, 1)?;
        let pairs = Tensor::cat(&[&words, &head_vectors], D::Minus1)?;
        let deprel = self.heads.deprel.forward(&pairs)?;

        Ok(ModelOutput {
            lemma,
            upos,
            xpos,
            feats,
            aux_feats,
            head_scores,
            deprel,
            predicted_heads,
        })
    }

    fn arc_scores(&self, words: &Tensor, nodes: &Tensor, word_counts: &[usize]) -> Result<Tensor> {
        let dep = self.heads.arc_dep.forward(words)?;
        let head = self.heads.arc_head.forward(nodes)?;
        let scores = dep
            .broadcast_matmul(&self.heads.arc_bilinear)?
            .matmul(&head.transpose(1, 2)?.contiguous()?)?;
        let bias = self.heads.arc_head_bias.forward(&head)?.transpose(1, 2)?;
        let scores = scores.broadcast_add(&bias)?;
        mask_arc_scores(&scores, word_counts)
    }
}

fn count_parameters(varmap: &VarMap) -> usize {
    varmap.all_vars().iter().map(|v| v.elem_count()).sum()
}

/// Set invalid candidate heads of real words to `-inf`
///
/// Candidates beyond the sentence and self-attachments are invalid. Rows of
/// padding words are left finite so that no row is entirely `-inf`.
pub fn mask_arc_scores(scores: &Tensor, word_counts: &[usize]) -> Result<Tensor> {
    let (batch, rows, cols) = scores.dims3()?;
    let mut mask = vec![1u8; batch * rows * cols];
    for (b, &n) in word_counts.iter().enumerate().take(batch) {
        for i in 0..n.min(rows) {
            for j in 0..cols {
                if j > n || j == i + 1 {
                    mask[(b * rows + i) * cols + j] = 0;
                }
            }
        }
    }
    let mask = Tensor::from_vec(mask, (batch, rows, cols), scores.device())?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, (batch, rows, cols), scores.device())?
        .to_dtype(scores.dtype())?;
    Ok(mask.where_cond(scores, &neg_inf)?)
}

/// Maximum spanning tree heads for every sentence of a batch
pub fn decode_heads(head_scores: &Tensor, word_counts: &[usize]) -> Result<Vec<Vec<usize>>> {
    let scores = head_scores.to_dtype(DType::F64)?.to_vec3::<f64>()?;
    Ok(scores
        .iter()
        .zip(word_counts)
        .map(|(sentence, &n)| {
            let mut matrix = vec![vec![0.0; n + 1]; n + 1];
            for d in 1..=n {
                matrix[d].copy_from_slice(&sentence[d - 1][..=n]);
            }
            decode_single_root(&matrix)
        })
        .collect())
}

fn heads_tensor(heads: &[Vec<usize>], batch: usize, width: usize, device: &Device) -> Result<Tensor> {
    let mut flat = vec![0u32; batch * width];
    for (b, sentence) in heads.iter().enumerate() {
        for (i, &h) in sentence.iter().enumerate().take(width) {
            flat[b * width + i] = h as u32;
        }
    }
    Ok(Tensor::from_vec(flat, (batch, width), device)?)
}
