//! Structured parameter descriptors for optimizer grouping

use std::fmt;

use candle_core::Var;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sub-module a parameter belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamOwner {
    /// Pretrained encoder
    Encoder,
    /// Task-specific heads
    Head,
}

/// Role of a parameter inside its layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamKind {
    /// Projection or classifier matrix
    Weight,
    /// Additive bias
    Bias,
    /// Normalization scale or shift
    Norm,
    /// Embedding or vector table
    Embedding,
    /// Learned layer-mixing score
    LayerScore,
}

/// A named parameter with its owner and kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDescriptor {
    /// Full variable name, e.g. `encoder.embeddings.LayerNorm.weight`
    pub name: String,
    /// Owning sub-module
    pub owner: ParamOwner,
    /// Role inside the layer
    pub kind: ParamKind,
}

impl ParamDescriptor {
    /// Describe the variable `name`, owned by the encoder when it lives under
    /// `encoder_prefix`
    pub fn new(name: &str, encoder_prefix: &str) -> Self {
        let owner = if name.split('.').next() == Some(encoder_prefix) {
            ParamOwner::Encoder
        } else {
            ParamOwner::Head
        };
        Self {
            name: name.to_string(),
            owner,
            kind: ParamKind::from_path(name),
        }
    }
}

impl ParamKind {
    /// Kind implied by the path segments of a variable name
    pub fn from_path(name: &str) -> Self {
        let segments: Vec<&str> = name.split('.').collect();
        let is_segment = |pred: &dyn Fn(&str) -> bool| segments.iter().any(|s| pred(s));

        if is_segment(&|s| s == "layer_score" || s == "layer_scores") {
            ParamKind::LayerScore
        } else if is_segment(&|s| s == "LayerNorm" || s == "layer_norm" || s.ends_with("_norm") || s == "norm") {
            ParamKind::Norm
        } else if segments.last() == Some(&"bias") {
            ParamKind::Bias
        } else if is_segment(&|s| s.contains("embedding") || s == "vectors") {
            ParamKind::Embedding
        } else {
            ParamKind::Weight
        }
    }
}

impl fmt::Display for ParamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.owner, self.kind)
    }
}

/// Whether a parameter is excluded from weight decay
pub fn no_decay(descriptor: &ParamDescriptor) -> bool {
    matches!(
        descriptor.kind,
        ParamKind::Bias | ParamKind::Norm | ParamKind::Embedding | ParamKind::LayerScore
    )
}

/// Descriptors and variables of every parameter in `varmap`, sorted by name
pub fn describe(varmap: &VarMap, encoder_prefix: &str) -> Result<Vec<(ParamDescriptor, Var)>> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| Error::config("variable map lock poisoned"))?;
    let mut described: Vec<_> = vars
        .iter()
        .map(|(name, var)| (ParamDescriptor::new(name, encoder_prefix), var.clone()))
        .collect();
    described.sort_by(|a, b| a.0.name.cmp(&b.0.name));
    Ok(described)
}
