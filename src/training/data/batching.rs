//! Batch collation for UD training
//!
//! Every field is padded to the longest sentence of the group: subwords with
//! the tokenizer's padding id, masks with false, targets with
//! [`IGNORE_INDEX`], and the alignment map with all-zero rows.

use std::collections::BTreeMap;

use candle_core::{Device, Tensor};
use tracing::{debug, instrument};

use super::{DataError, SentenceRecord, IGNORE_INDEX};
use crate::model::ModelInput;

/// A padded batch of sentences
#[derive(Debug)]
pub struct Batch {
    /// Sentence indices in the source dataset
    pub indices: Vec<usize>,
    /// `[batch, seq]` u32 subword ids
    pub subwords: Tensor,
    /// `[batch, seq]` u32, 1 on real subwords
    pub attention_mask: Tensor,
    /// `[batch, seq, words + 2]` f32 one-hot subword to word map
    pub alignment: Tensor,
    /// `[batch, words]` u8, 1 on words below the form count threshold
    pub is_unseen: Tensor,
    /// `[batch, words]` i64 per lemma rule type
    pub lemma: BTreeMap<String, Tensor>,
    /// `[batch, words]` i64
    pub upos: Tensor,
    /// `[batch, words]` i64
    pub xpos: Tensor,
    /// `[batch, words]` i64
    pub feats: Tensor,
    /// `[batch, words]` i64 head positions
    pub arc_head: Tensor,
    /// `[batch, words]` i64 dependency labels
    pub arc_dep: Tensor,
    /// `[batch, words]` i64 per feature name
    pub aux_feats: BTreeMap<String, Tensor>,
    /// Subwords per sentence, boundary and separator included
    pub subword_lengths: Vec<usize>,
    /// Words per sentence plus one for the root
    pub word_lengths: Vec<usize>,
    word_counts: Vec<usize>,
}

impl Batch {
    /// Number of sentences
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Whether the batch holds no sentences
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Words per sentence, root excluded
    pub fn word_counts(&self) -> &[usize] {
        &self.word_counts
    }

    /// Model inputs; gold heads feed the label classifier when `with_gold_heads`
    pub fn model_input(&self, with_gold_heads: bool) -> ModelInput<'_> {
        ModelInput {
            subwords: &self.subwords,
            attention_mask: &self.attention_mask,
            alignment: &self.alignment,
            word_counts: &self.word_counts,
            gold_heads: with_gold_heads.then_some(&self.arc_head),
        }
    }
}

/// Pads featurized sentences into a [`Batch`]
#[derive(Debug, Clone)]
pub struct BatchCollator {
    pad_id: u32,
    device: Device,
}

fn pad_targets<'a>(
    rows: impl Iterator<Item = &'a [i64]>,
    width: usize,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let mut flat = Vec::new();
    let mut batch = 0;
    for row in rows {
        flat.extend_from_slice(row);
        flat.extend(std::iter::repeat(IGNORE_INDEX).take(width - row.len()));
        batch += 1;
    }
    Tensor::from_vec(flat, (batch, width), device)
}

impl BatchCollator {
    /// Collator padding subwords with `pad_id`, building tensors on `device`
    pub fn new(pad_id: u32, device: Device) -> Self {
        Self { pad_id, device }
    }

    /// Collate a group of records
    #[instrument(skip_all, fields(size = records.len()))]
    pub fn collate(&self, records: &[&SentenceRecord]) -> Result<Batch, DataError> {
        let first = records.first().ok_or_else(|| DataError::BatchCollationError {
            reason: "Empty batch".to_string(),
        })?;
        self.collate_inner(records, first).map_err(|e| DataError::BatchCollationError {
            reason: e.to_string(),
        })
    }

    fn collate_inner(&self, records: &[&SentenceRecord], first: &SentenceRecord) -> candle_core::Result<Batch> {
        let batch = records.len();
        let longest_source = records.iter().map(|r| r.subwords.len()).max().unwrap_or(0);
        let longest_target = records.iter().map(|r| r.word_count()).max().unwrap_or(0);
        let positions = longest_target + 2;
        let device = &self.device;

        let mut subwords = Vec::with_capacity(batch * longest_source);
        let mut attention_mask = Vec::with_capacity(batch * longest_source);
        let mut alignment = vec![0f32; batch * longest_source * positions];
        let mut is_unseen = Vec::with_capacity(batch * longest_target);

        for (b, record) in records.iter().enumerate() {
            let pad = longest_source - record.subwords.len();
            subwords.extend_from_slice(&record.subwords);
            subwords.extend(std::iter::repeat(self.pad_id).take(pad));
            attention_mask.extend(std::iter::repeat(1u32).take(record.subwords.len()));
            attention_mask.extend(std::iter::repeat(0u32).take(pad));

            for (s, &word) in record.alignment.iter().enumerate() {
                alignment[(b * longest_source + s) * positions + word as usize] = 1.0;
            }

            is_unseen.extend(record.is_unseen.iter().map(|&u| u as u8));
            is_unseen.extend(std::iter::repeat(0u8).take(longest_target - record.word_count()));
        }

        let field = |select: fn(&SentenceRecord) -> &[i64]| {
            pad_targets(records.iter().map(|r| select(r)), longest_target, device)
        };
        let keyed = |select: fn(&SentenceRecord) -> &BTreeMap<String, Vec<i64>>| {
            select(first)
                .keys()
                .map(|key| {
                    let rows = records
                        .iter()
                        .map(|r| select(r).get(key).map_or(&[][..], Vec::as_slice));
                    Ok((key.clone(), pad_targets(rows, longest_target, device)?))
                })
                .collect::<candle_core::Result<BTreeMap<_, _>>>()
        };

        let word_counts: Vec<usize> = records.iter().map(|r| r.word_count()).collect();
        let collated = Batch {
            indices: records.iter().map(|r| r.index).collect(),
            subwords: Tensor::from_vec(subwords, (batch, longest_source), device)?,
            attention_mask: Tensor::from_vec(attention_mask, (batch, longest_source), device)?,
            alignment: Tensor::from_vec(alignment, (batch, longest_source, positions), device)?,
            is_unseen: Tensor::from_vec(is_unseen, (batch, longest_target), device)?,
            lemma: keyed(|r| &r.lemma)?,
            upos: field(|r| r.upos.as_slice())?,
            xpos: field(|r| r.xpos.as_slice())?,
            feats: field(|r| r.feats.as_slice())?,
            arc_head: field(|r| r.arc_head.as_slice())?,
            arc_dep: field(|r| r.arc_dep.as_slice())?,
            aux_feats: keyed(|r| &r.aux_feats)?,
            subword_lengths: records.iter().map(|r| r.subwords.len()).collect(),
            word_lengths: word_counts.iter().map(|n| n + 1).collect(),
            word_counts,
        };

        debug!(
            "Collated batch of {} sentences ({} subwords, {} words)",
            batch, longest_source, longest_target
        );
        Ok(collated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: usize, subwords: usize, words: usize) -> SentenceRecord {
        let mut alignment = vec![0u32];
        for s in 1..subwords - 1 {
            alignment.push((s as u32).min(words as u32));
        }
        alignment.push(words as u32 + 1);
        let targets: Vec<i64> = (0..words as i64).collect();
        SentenceRecord {
            index,
            forms: (0..words).map(|w| format!("w{}", w)).collect(),
            subwords: (10..10 + subwords as u32).collect(),
            alignment,
            is_unseen: vec![true; words],
            lemma: [("suffix".to_string(), targets.clone())].into_iter().collect(),
            upos: targets.clone(),
            xpos: targets.clone(),
            feats: targets.clone(),
            arc_head: vec![0; words],
            arc_dep: targets.clone(),
            aux_feats: [("Number".to_string(), targets)].into_iter().collect(),
        }
    }

    #[test]
    fn test_padding_widths_and_sentinels() {
        let collator = BatchCollator::new(0, Device::Cpu);
        let (a, b) = (record(3, 5, 4), record(7, 3, 2));
        let batch = collator.collate(&[&a, &b]).unwrap();

        assert_eq!(batch.indices, vec![3, 7]);
        assert_eq!(batch.subwords.dims(), &[2, 5]);
        assert_eq!(batch.upos.dims(), &[2, 4]);
        assert_eq!(batch.alignment.dims(), &[2, 5, 6]);
        assert_eq!(batch.subword_lengths, vec![5, 3]);
        assert_eq!(batch.word_lengths, vec![5, 3]);
        assert_eq!(batch.word_counts(), &[4, 2]);

        let subwords = batch.subwords.to_vec2::<u32>().unwrap();
        assert_eq!(subwords[1], vec![10, 11, 12, 0, 0]);
        let mask = batch.attention_mask.to_vec2::<u32>().unwrap();
        assert_eq!(mask[1], vec![1, 1, 1, 0, 0]);

        for field in [&batch.upos, &batch.arc_dep, &batch.lemma["suffix"], &batch.aux_feats["Number"]] {
            let rows = field.to_vec2::<i64>().unwrap();
            assert_eq!(rows[0], vec![0, 1, 2, 3]);
            assert_eq!(rows[1], vec![0, 1, -1, -1]);
        }

        let unseen = batch.is_unseen.to_vec2::<u8>().unwrap();
        assert_eq!(unseen[1], vec![1, 1, 0, 0]);

        // padded subword rows are all zero
        let alignment = batch.alignment.to_vec3::<f32>().unwrap();
        assert!(alignment[1][3].iter().all(|&v| v == 0.0));
        assert_eq!(alignment[1][2][3], 1.0);
    }

    #[test]
    fn test_empty_batch_error() {
        let collator = BatchCollator::new(0, Device::Cpu);
        match collator.collate(&[]) {
            Err(DataError::BatchCollationError { reason }) => assert_eq!(reason, "Empty batch"),
            other => panic!("expected collation error, got {:?}", other.map(|b| b.len())),
        }
    }
}
