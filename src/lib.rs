//! UDTrain - multi-task Universal Dependencies taggers and parsers on top of
//! pretrained encoders
//!
//! The crate covers the whole experiment pipeline: size-normalizing treebanks
//! across languages, featurizing sentences for a subword encoder, training a
//! joint lemma/tag/feature/dependency model for every pretraining revision of
//! an encoder, and scoring predictions with the CoNLL 2018 shared task
//! metrics.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod encoder;
pub mod error;
pub mod evaluation;
pub mod model;
pub mod normalize;
pub mod training;
pub mod treebank;
pub mod utils;

// Re-exports
pub use config::{LanguageSet, NormalizeConfig};
pub use encoder::{Encoder, EncoderFactory, ModelFamily, RevisionRegistry, SubwordTokenizer};
pub use error::{Error, Result};
pub use evaluation::{Conll18Evaluator, EvaluationReport, Evaluator};
pub use model::UdModel;
pub use training::{RevisionOutcome, TrainingConfig, UdTrainer};
pub use treebank::{Sentence, Token, Treebank};
