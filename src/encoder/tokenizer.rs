//! Subword tokenizers for word-level featurization

use std::path::Path;

use tokenizers::Tokenizer;

use crate::error::{Error, Result};

/// Splits a single word into subword ids and exposes the special ids
pub trait SubwordTokenizer: Send + Sync {
    /// Subword ids of `word`, without special tokens
    fn encode_word(&self, word: &str) -> Result<Vec<u32>>;

    /// Sentence-initial boundary token
    fn cls_id(&self) -> u32;

    /// Sentence-final separator token
    fn sep_id(&self) -> u32;

    /// Padding token
    fn pad_id(&self) -> u32;

    /// Replacement for words that produce no subwords
    fn unk_id(&self) -> u32;
}

/// Candidate spellings of the special tokens, WordPiece first
const CLS_TOKENS: &[&str] = &["[CLS]", "<s>", "[BOS]"];
const SEP_TOKENS: &[&str] = &["[SEP]", "</s>", "[EOS]"];
const PAD_TOKENS: &[&str] = &["[PAD]", "<pad>"];
const UNK_TOKENS: &[&str] = &["[UNK]", "<unk>"];

/// Wrapper over a `tokenizers` tokenizer file
pub struct HfSubwordTokenizer {
    tokenizer: Tokenizer,
    cls_id: u32,
    sep_id: u32,
    pad_id: u32,
    unk_id: u32,
}

impl HfSubwordTokenizer {
    /// Load `tokenizer.json`
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path).map_err(|e| {
            Error::tokenizer(format!("Failed to load tokenizer {}: {}", path.display(), e))
        })?;
        Self::new(tokenizer)
    }

    /// Wrap an already loaded tokenizer
    pub fn new(tokenizer: Tokenizer) -> Result<Self> {
        let lookup = |candidates: &[&str], what: &str| {
            candidates
                .iter()
                .find_map(|token| tokenizer.token_to_id(token))
                .ok_or_else(|| Error::tokenizer(format!("tokenizer has no {} token", what)))
        };
        let cls_id = lookup(CLS_TOKENS, "boundary")?;
        let sep_id = lookup(SEP_TOKENS, "separator")?;
        let pad_id = lookup(PAD_TOKENS, "padding")?;
        let unk_id = lookup(UNK_TOKENS, "unknown")?;

        Ok(Self {
            tokenizer,
            cls_id,
            sep_id,
            pad_id,
            unk_id,
        })
    }

    /// Vocabulary size including added tokens
    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}

impl SubwordTokenizer for HfSubwordTokenizer {
    fn encode_word(&self, word: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(word, false)
            .map_err(|e| Error::tokenizer(format!("Encoding failed: {}", e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn cls_id(&self) -> u32 {
        self.cls_id
    }

    fn sep_id(&self) -> u32 {
        self.sep_id
    }

    fn pad_id(&self) -> u32 {
        self.pad_id
    }

    fn unk_id(&self) -> u32 {
        self.unk_id
    }
}
