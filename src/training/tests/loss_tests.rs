//! Tests for the joint objective

use std::sync::Arc;

use anyhow::Result;
use approx::assert_relative_eq;
use candle_core::{DType, Tensor};

use crate::model::{HeadConfig, UdModel};
use crate::training::data::{BatchCollator, DataLoader, DataLoaderConfig, DatasetState, UdDataset};
use crate::training::loss::{scalar, smoothed_cross_entropy, LossComposer};

use super::test_utils::{create_test_device, synthetic_treebank, CharTokenizer, TinyEncoderFactory, PAD_ID};

fn uniform_logits(words: usize, classes: usize) -> Result<Tensor> {
    Ok(Tensor::zeros((1, words, classes), DType::F32, &create_test_device())?)
}

fn targets(values: &[i64]) -> Result<Tensor> {
    Ok(Tensor::from_slice(values, (1, values.len()), &create_test_device())?)
}

#[test]
fn test_lemma_loss_weights_by_support() -> Result<()> {
    let composer = LossComposer::new(0.1);
    let logits = uniform_logits(2, 4)?;
    let feats = targets(&[0, 1])?;
    let full = targets(&[0, 1])?;
    let half = targets(&[2, -1])?;

    let loss = composer.lemma_loss([(&logits, &full), (&logits, &half)], &feats)?;
    let ln4 = 4f64.ln();
    assert_relative_eq!(scalar(&loss)?, (ln4 + 0.5 * ln4) / 2f64.sqrt(), epsilon = 1e-5);
    Ok(())
}

#[test]
fn test_single_rule_type_reduces_to_cross_entropy() -> Result<()> {
    let composer = LossComposer::new(0.1);
    let logits = Tensor::new(
        &[[[0.5f32, -1.0, 2.0], [1.5, 0.0, -0.5], [0.0, 0.0, 0.0]]],
        &create_test_device(),
    )?;
    let rule = targets(&[2, 0, -1])?;
    let feats = targets(&[1, 1, -1])?;

    let lemma = composer.lemma_loss([(&logits, &rule)], &feats)?;
    let plain = smoothed_cross_entropy(&logits, &rule, 0.1)?;
    assert_relative_eq!(scalar(&lemma)?, scalar(&plain)?, epsilon = 1e-6);
    Ok(())
}

#[test]
fn test_aux_loss_counts_unsupported_heads_as_zero() -> Result<()> {
    let composer = LossComposer::new(0.0);
    let logits = uniform_logits(2, 4)?;
    let feats = targets(&[0, 1])?;
    let half = targets(&[3, -1])?;
    let none = targets(&[-1, -1])?;

    let loss = composer.aux_feats_loss([(&logits, &half), (&logits, &none)], &feats)?;
    assert_relative_eq!(scalar(&loss)?, 0.25 * 4f64.ln(), epsilon = 1e-5);

    let empty = composer.aux_feats_loss(std::iter::empty(), &feats)?;
    assert_eq!(scalar(&empty)?, 0.0);
    Ok(())
}

#[test]
fn test_no_supervised_words_gives_zero_weights() -> Result<()> {
    let composer = LossComposer::new(0.1);
    let logits = uniform_logits(2, 3)?;
    let feats = targets(&[-1, -1])?;
    let rule = targets(&[0, 1])?;
    let loss = composer.lemma_loss([(&logits, &rule)], &feats)?;
    assert_eq!(scalar(&loss)?, 0.0);
    Ok(())
}

#[test]
fn test_breakdown_sums_to_total() -> Result<()> {
    let device = create_test_device();
    let treebank = synthetic_treebank(6, 11);
    let state = DatasetState::build(&treebank.sentences, 1);
    let dataset = Arc::new(UdDataset::new(treebank, &state, &CharTokenizer)?);
    let mut loader = DataLoader::new(
        dataset,
        DataLoaderConfig::eval(6),
        BatchCollator::new(PAD_ID, device.clone()),
    );
    let batch = loader.epoch().next().expect("one batch")?;

    let config = HeadConfig {
        dropout: 0.0,
        arc_hidden_size: 8,
    };
    let model = UdModel::new(&TinyEncoderFactory::default(), &state.head_sizes(), config, &device)?;
    let output = model.forward(&batch.model_input(true), true)?;
    let (loss, breakdown) = LossComposer::new(0.1).compute(&output, &batch)?;

    let parts = breakdown.lemma
        + breakdown.upos
        + breakdown.xpos
        + breakdown.feats
        + breakdown.head
        + breakdown.deprel
        + breakdown.aux_feats;
    assert_relative_eq!(breakdown.total, parts, epsilon = 1e-4);
    assert_relative_eq!(scalar(&loss)?, breakdown.total, epsilon = 1e-6);
    assert!(breakdown.total.is_finite());
    assert!(breakdown.head > 0.0);
    assert!(breakdown.upos > 0.0);
    Ok(())
}
