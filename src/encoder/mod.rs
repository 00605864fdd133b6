//! Pretrained encoder capability: subword ids in, contextual vectors out

use candle_core::{DType, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::error::Result;

mod bert;
pub mod registry;
mod tokenizer;

pub use bert::{BertEncoder, BertFactory};
pub use registry::{ModelFamily, Revision, RevisionRegistry, Snapshot};
pub use tokenizer::{HfSubwordTokenizer, SubwordTokenizer};

/// Contextual encoder over padded subword sequences
pub trait Encoder {
    /// Encode `subwords` `[batch, seq]` (u32) under `attention_mask` `[batch, seq]`
    /// into `[batch, seq, hidden]`
    fn forward(&self, subwords: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor>;

    /// Width of the output vectors
    fn hidden_size(&self) -> usize;
}

/// Builds encoders with identical parameter layouts
///
/// The training controller builds one encoder for the live model and one for
/// the EMA shadow, each over its own [`VarMap`].
pub trait EncoderFactory {
    /// Create an encoder whose variables live under `vb`
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn Encoder>>;

    /// Overwrite freshly built variables under `prefix` with pretrained
    /// weights; returns how many variables were loaded
    fn load_pretrained(&self, _varmap: &VarMap, _prefix: &str) -> Result<usize> {
        Ok(0)
    }

    /// Parameter dtype
    fn dtype(&self) -> DType {
        DType::F32
    }
}
