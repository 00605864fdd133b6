//! Label-smoothed cross-entropy with an ignore sentinel
//!
//! Targets equal to [`IGNORE_INDEX`] contribute neither to the loss nor to
//! the averaging denominator. Selection is done with `where_cond`, never by
//! multiplying with a mask, so `-inf` logits cannot turn into NaN.

use candle_core::{DType, Tensor, D};

use crate::training::data::IGNORE_INDEX;
use crate::training::Result;

/// Number of targets different from the ignore sentinel
pub fn valid_count(targets: &Tensor) -> Result<f64> {
    let count = targets
        .ge(IGNORE_INDEX + 1)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(count as f64)
}

fn zero(like: &Tensor) -> Result<Tensor> {
    Ok(Tensor::zeros((), DType::F32, like.device())?)
}

/// Flatten `[.., classes]` logits and matching targets into rows
fn rows(logits: &Tensor, targets: &Tensor) -> Result<(Tensor, Tensor)> {
    let classes = logits.dim(D::Minus1)?;
    let logits = logits.reshape(((), classes))?.to_dtype(DType::F32)?;
    let targets = targets.flatten_all()?;
    Ok((logits, targets))
}

/// Per-row smoothed loss averaged over valid targets
fn reduce(row_loss: &Tensor, targets: &Tensor, count: f64) -> Result<Tensor> {
    let valid = targets.ge(IGNORE_INDEX + 1)?;
    let zeros = row_loss.zeros_like()?;
    let kept = valid.where_cond(row_loss, &zeros)?;
    Ok((kept.sum_all()? / count)?)
}

fn nll(log_probs: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let index = targets.maximum(0i64)?.to_dtype(DType::U32)?.unsqueeze(1)?;
    Ok(log_probs.gather(&index, 1)?.squeeze(1)?.neg()?)
}

/// Cross-entropy with label smoothing `smoothing`, ignoring `-1` targets
///
/// Matches `(1 - eps) * nll + eps * mean(-log p)` averaged over valid rows;
/// zero when every target is ignored.
pub fn smoothed_cross_entropy(logits: &Tensor, targets: &Tensor, smoothing: f64) -> Result<Tensor> {
    let count = valid_count(targets)?;
    if count == 0.0 {
        return zero(logits);
    }
    let (logits, targets) = rows(logits, targets)?;
    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let nll = nll(&log_probs, &targets)?;
    let smooth = log_probs.mean(D::Minus1)?.neg()?;
    let row_loss = ((nll * (1.0 - smoothing))? + (smooth * smoothing)?)?;
    reduce(&row_loss, &targets, count)
}

/// Smoothed cross-entropy over logits that may hold `-inf`
///
/// The smoothing term averages only over finite candidates, so masked
/// positions neither count in the denominator nor propagate `-inf`.
pub fn masked_smoothed_cross_entropy(logits: &Tensor, targets: &Tensor, smoothing: f64) -> Result<Tensor> {
    let count = valid_count(targets)?;
    if count == 0.0 {
        return zero(logits);
    }
    let (logits, targets) = rows(logits, targets)?;
    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let nll = nll(&log_probs, &targets)?;

    let neg_inf = Tensor::full(f32::NEG_INFINITY, logits.shape(), logits.device())?;
    let finite = logits.ne(&neg_inf)?;
    let kept = finite.where_cond(&log_probs, &log_probs.zeros_like()?)?;
    let candidates = finite.to_dtype(DType::F32)?.sum(D::Minus1)?.maximum(1.0)?;
    let smooth = kept.sum(D::Minus1)?.neg()?.div(&candidates)?;

    let row_loss = ((nll * (1.0 - smoothing))? + (smooth * smoothing)?)?;
    reduce(&row_loss, &targets, count)
}

/// Host value of a scalar loss
pub fn scalar(loss: &Tensor) -> Result<f64> {
    Ok(loss.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    fn tensor2(values: &[f32], shape: (usize, usize)) -> Tensor {
        Tensor::from_slice(values, shape, &Device::Cpu).unwrap()
    }

    fn targets(values: &[i64]) -> Tensor {
        Tensor::from_slice(values, values.len(), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_uniform_logits() {
        // uniform over 4 classes: nll = smooth = ln 4 for any smoothing
        let logits = tensor2(&[0.0; 8], (2, 4));
        let loss = smoothed_cross_entropy(&logits, &targets(&[1, 3]), 0.1).unwrap();
        assert_relative_eq!(scalar(&loss).unwrap(), 4f64.ln(), epsilon = 1e-5);
    }

    #[test]
    fn test_ignored_rows_excluded() {
        let logits = tensor2(&[0.0, 0.0, 100.0, -100.0], (2, 2));
        let with_ignored = smoothed_cross_entropy(&logits, &targets(&[0, -1]), 0.0).unwrap();
        let alone = smoothed_cross_entropy(&tensor2(&[0.0, 0.0], (1, 2)), &targets(&[0]), 0.0).unwrap();
        assert_relative_eq!(scalar(&with_ignored).unwrap(), scalar(&alone).unwrap(), epsilon = 1e-6);
    }

    #[test]
    fn test_all_ignored_is_zero() {
        let logits = tensor2(&[1.0, 2.0], (1, 2));
        let loss = smoothed_cross_entropy(&logits, &targets(&[-1]), 0.1).unwrap();
        assert_eq!(scalar(&loss).unwrap(), 0.0);
        let loss = masked_smoothed_cross_entropy(&logits, &targets(&[-1]), 0.1).unwrap();
        assert_eq!(scalar(&loss).unwrap(), 0.0);
    }

    #[test]
    fn test_masked_positions_excluded_from_smoothing() {
        let inf = f32::NEG_INFINITY;
        // two finite candidates with equal scores
        let logits = tensor2(&[0.0, inf, 0.0], (1, 3));
        let loss = masked_smoothed_cross_entropy(&logits, &targets(&[0]), 0.1).unwrap();
        let value = scalar(&loss).unwrap();
        assert!(value.is_finite());
        assert_relative_eq!(value, 2f64.ln(), epsilon = 1e-5);
    }

    #[test]
    fn test_three_dimensional_logits() {
        let logits = Tensor::zeros((2, 3, 5), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::from_slice(&[0i64, 1, -1, 4, -1, -1], (2, 3), &Device::Cpu).unwrap();
        let loss = smoothed_cross_entropy(&logits, &targets, 0.1).unwrap();
        assert_relative_eq!(scalar(&loss).unwrap(), 5f64.ln(), epsilon = 1e-5);
    }
}
