//! Joint objective over every task head
//!
//! Each task uses label-smoothed cross-entropy; the arc scorer uses the
//! variant that tolerates `-inf` candidates. Lemma and auxiliary feature
//! heads are weighted by their share of supervised words, and the final loss
//! is the plain sum of the task terms.
//!
//! ```rust,ignore
//! let composer = LossComposer::new(0.1);
//! let output = model.forward(&batch.model_input(true), true)?;
//! let (loss, breakdown) = composer.compute(&output, &batch)?;
//! ```

pub mod utils;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::model::ModelOutput;
use crate::training::data::Batch;
use crate::training::Result;

pub use utils::{masked_smoothed_cross_entropy, scalar, smoothed_cross_entropy, valid_count};

/// Host values of every loss term of one step
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossBreakdown {
    /// Weighted lemma rule loss
    pub lemma: f64,
    /// UPOS loss
    pub upos: f64,
    /// XPOS loss
    pub xpos: f64,
    /// Feature string loss
    pub feats: f64,
    /// Arc loss
    pub head: f64,
    /// Dependency label loss
    pub deprel: f64,
    /// Averaged auxiliary feature loss
    pub aux_feats: f64,
    /// Sum of all terms
    pub total: f64,
}

/// Composes the joint training objective
#[derive(Debug, Clone, Copy)]
pub struct LossComposer {
    label_smoothing: f64,
}

impl LossComposer {
    /// Composer with label smoothing `label_smoothing` on every term
    pub fn new(label_smoothing: f64) -> Self {
        Self { label_smoothing }
    }

    fn criterion(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
        smoothed_cross_entropy(logits, targets, self.label_smoothing)
    }

    /// Lemma loss: every rule type's loss weighted by its supported share of
    /// words, summed, divided by the square root of the number of rule types
    pub fn lemma_loss<'a>(
        &self,
        heads: impl IntoIterator<Item = (&'a Tensor, &'a Tensor)>,
        feats_targets: &Tensor,
    ) -> Result<Tensor> {
        let total = valid_count(feats_targets)?;
        let mut weighted = Vec::new();
        for (logits, targets) in heads {
            let loss = self.criterion(logits, targets)?;
            let weight = if total > 0.0 { valid_count(targets)? / total } else { 0.0 };
            weighted.push((loss * weight)?);
        }
        if weighted.is_empty() {
            return Ok(Tensor::zeros((), candle_core::DType::F32, feats_targets.device())?);
        }
        let k = weighted.len() as f64;
        let sum = sum_scalars(&weighted)?;
        Ok((sum / k.sqrt())?)
    }

    /// Auxiliary feature loss: heads without supported words contribute zero,
    /// the rest are weighted like lemma heads, then averaged over all heads
    ///
    /// Unsupported heads stay in the divisor, so the term shrinks when a batch
    /// lacks a feature instead of reweighting the supported ones.
    pub fn aux_feats_loss<'a>(
        &self,
        heads: impl IntoIterator<Item = (&'a Tensor, &'a Tensor)>,
        feats_targets: &Tensor,
    ) -> Result<Tensor> {
        let total = valid_count(feats_targets)?;
        let zero = Tensor::zeros((), candle_core::DType::F32, feats_targets.device())?;
        let mut terms = Vec::new();
        for (logits, targets) in heads {
            let support = valid_count(targets)?;
            if support > 0.0 && total > 0.0 {
                let loss = self.criterion(logits, targets)?;
                terms.push((loss * (support / total))?);
            } else {
                terms.push(zero.clone());
            }
        }
        if terms.is_empty() {
            return Ok(zero);
        }
        let n = terms.len() as f64;
        Ok((sum_scalars(&terms)? / n)?)
    }

    /// Total loss and its breakdown for one batch
    pub fn compute(&self, output: &ModelOutput, batch: &Batch) -> Result<(Tensor, LossBreakdown)> {
        let lemma = self.lemma_loss(
            output
                .lemma
                .iter()
                .filter_map(|(key, logits)| batch.lemma.get(key).map(|t| (logits, t))),
            &batch.feats,
        )?;
        let upos = self.criterion(&output.upos, &batch.upos)?;
        let xpos = self.criterion(&output.xpos, &batch.xpos)?;
        let feats = self.criterion(&output.feats, &batch.feats)?;
        let head = masked_smoothed_cross_entropy(&output.head_scores, &batch.arc_head, self.label_smoothing)?;
        let deprel = self.criterion(&output.deprel, &batch.arc_dep)?;
        let aux_feats = self.aux_feats_loss(
            output
                .aux_feats
                .iter()
                .filter_map(|(key, logits)| batch.aux_feats.get(key).map(|t| (logits, t))),
            &batch.feats,
        )?;

        let total = sum_scalars(&[
            lemma.clone(),
            upos.clone(),
            xpos.clone(),
            feats.clone(),
            head.clone(),
            deprel.clone(),
            aux_feats.clone(),
        ])?;

        let breakdown = LossBreakdown {
            lemma: scalar(&lemma)?,
            upos: scalar(&upos)?,
            xpos: scalar(&xpos)?,
            feats: scalar(&feats)?,
            head: scalar(&head)?,
            deprel: scalar(&deprel)?,
            aux_feats: scalar(&aux_feats)?,
            total: scalar(&total)?,
        };
        Ok((total, breakdown))
    }
}

fn sum_scalars(terms: &[Tensor]) -> Result<Tensor> {
    let mut iter = terms.iter();
    let first = iter
        .next()
        .ok_or_else(|| anyhow::anyhow!("no loss terms to sum"))?
        .clone();
    iter.try_fold(first, |acc, term| Ok((acc + term)?))
}
