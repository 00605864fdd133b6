//! Turning model output back into annotated sentences
//!
//! Every task's logits are reduced with argmax and looked up in the training
//! vocabularies. Predictions are written over a copy of the gold sentence, word
//! by word; multi-word ranges and empty nodes keep their gold lines.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{Tensor, D};
use tracing::{debug, instrument};

use crate::model::{ModelOutput, UdModel};
use crate::training::data::{apply_lemma_rule, DataLoader, DatasetState, LemmaRule};
use crate::treebank::{write_sentences, Sentence};

/// Class indices predicted for one sentence's words
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SentencePrediction {
    /// Lemma rule class per rule type
    pub lemma: BTreeMap<String, Vec<usize>>,
    /// UPOS classes
    pub upos: Vec<usize>,
    /// XPOS classes
    pub xpos: Vec<usize>,
    /// Feature string classes
    pub feats: Vec<usize>,
    /// Dependency label classes
    pub deprel: Vec<usize>,
    /// Decoded heads, 0 for the root
    pub heads: Vec<usize>,
}

fn argmax(logits: &Tensor) -> Result<Vec<Vec<usize>>> {
    let classes = logits.argmax(D::Minus1)?.to_vec2::<u32>()?;
    Ok(classes
        .into_iter()
        .map(|row| row.into_iter().map(|c| c as usize).collect())
        .collect())
}

/// Split batch output into per-sentence predictions trimmed to each length
pub fn split_predictions(output: &ModelOutput, word_counts: &[usize]) -> Result<Vec<SentencePrediction>> {
    let heads = output
        .predicted_heads
        .as_ref()
        .context("Model output carries no decoded heads")?;
    let lemma = output
        .lemma
        .iter()
        .map(|(rule_type, logits)| Ok((rule_type.clone(), argmax(logits)?)))
        .collect::<Result<BTreeMap<_, _>>>()?;
    let upos = argmax(&output.upos)?;
    let xpos = argmax(&output.xpos)?;
    let feats = argmax(&output.feats)?;
    let deprel = argmax(&output.deprel)?;

    let trim = |rows: &[Vec<usize>], b: usize, n: usize| rows[b][..n].to_vec();
    Ok(word_counts
        .iter()
        .enumerate()
        .map(|(b, &n)| SentencePrediction {
            lemma: lemma
                .iter()
                .map(|(rule_type, rows)| (rule_type.clone(), trim(rows, b, n)))
                .collect(),
            upos: trim(&upos, b, n),
            xpos: trim(&xpos, b, n),
            feats: trim(&feats, b, n),
            deprel: trim(&deprel, b, n),
            heads: heads[b][..n].to_vec(),
        })
        .collect())
}

/// Writes a model's predictions over a dataset's gold sentences
#[derive(Debug, Clone, Copy)]
pub struct PredictionWriter<'a> {
    state: &'a DatasetState,
}

impl<'a> PredictionWriter<'a> {
    /// Writer decoding classes with the vocabularies of `state`
    pub fn new(state: &'a DatasetState) -> Self {
        Self { state }
    }

    /// Overwrite the word fields of a copy of `gold` with `prediction`
    pub fn annotate(&self, gold: &Sentence, prediction: &SentencePrediction) -> Sentence {
        let mut sentence = gold.clone();
        let words = sentence.tokens.iter_mut().filter(|token| token.id.is_word());
        for (i, token) in words.enumerate().take(prediction.upos.len()) {
            let rule: LemmaRule = prediction
                .lemma
                .iter()
                .filter_map(|(rule_type, classes)| {
                    let vocab = self.state.lemma.get(rule_type)?;
                    Some((rule_type.clone(), vocab.label_or_last(classes[i]).to_string()))
                })
                .collect();
            token.lemma = apply_lemma_rule(&token.form, &rule);
            token.upos = self.state.upos.label_or_last(prediction.upos[i]).to_string();
            token.xpos = self.state.xpos.label_or_last(prediction.xpos[i]).to_string();
            token.feats = self.state.feats.label_or_last(prediction.feats[i]).to_string();
            token.head = Some(prediction.heads[i]);
            token.deprel = self.state.deprel.label_or_last(prediction.deprel[i]).to_string();
        }
        sentence
    }

    /// Run `model` in inference mode over every batch of `loader` and return
    /// the annotated sentences in dataset order
    pub fn predict(&self, model: &UdModel, loader: &mut DataLoader) -> Result<Vec<Sentence>> {
        let gold = loader.dataset().treebank().sentences.clone();
        let mut predicted: Vec<Option<Sentence>> = vec![None; gold.len()];

        for batch in loader.epoch() {
            let batch = batch?;
            let output = model.forward(&batch.model_input(false), false)?;
            let predictions = split_predictions(&output, batch.word_counts())?;
            for (&index, prediction) in batch.indices.iter().zip(&predictions) {
                predicted[index] = Some(self.annotate(&gold[index], prediction));
            }
        }

        Ok(predicted
            .into_iter()
            .zip(gold)
            .map(|(prediction, gold)| prediction.unwrap_or(gold))
            .collect())
    }

    /// Predict and write the annotated treebank to `path`
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn write(&self, model: &UdModel, loader: &mut DataLoader, path: &Path) -> Result<PathBuf> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create prediction directory {}", parent.display()))?;
        }
        let sentences = self.predict(model, loader)?;
        write_sentences(path, &sentences)
            .with_context(|| format!("Failed to write predictions to {}", path.display()))?;
        debug!("Wrote {} predicted sentences", sentences.len());
        Ok(path.to_path_buf())
    }
}
