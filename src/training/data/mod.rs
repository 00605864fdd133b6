//! Data loading infrastructure for UD training
//!
//! Vocabularies are built from the training split and shared by every split
//! of a run. Sentences are featurized once, in parallel, into records that
//! the collator pads into batches.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::encoder::SubwordTokenizer;
use crate::model::HeadSizes;
use crate::treebank::{Sentence, Treebank};

pub mod batching;
pub mod lemma_rule;
pub mod loaders;

pub use batching::{Batch, BatchCollator};
pub use lemma_rule::{apply_lemma_rule, gen_lemma_rule, LemmaRule, RULE_TYPES};
pub use loaders::{DataLoader, DataLoaderConfig};

/// Target value of padding and of labels outside the training vocabulary
pub const IGNORE_INDEX: i64 = -1;

/// Error types for data loading
#[derive(thiserror::Error, Debug)]
pub enum DataError {
    /// Index past the end of a dataset
    #[error("Invalid sample index: {index} >= {dataset_size}")]
    InvalidIndex {
        /// Requested index
        index: usize,
        /// Number of records
        dataset_size: usize,
    },

    /// A batch could not be assembled
    #[error("Batch collation error: {reason}")]
    BatchCollationError {
        /// What went wrong
        reason: String,
    },
}

/// Indexed label set, serialized as its ordered item list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Vocabulary {
    items: Vec<String>,
    index: HashMap<String, usize>,
}

impl From<Vec<String>> for Vocabulary {
    fn from(items: Vec<String>) -> Self {
        let index = items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.clone(), i))
            .collect();
        Self { items, index }
    }
}

impl From<Vocabulary> for Vec<String> {
    fn from(vocab: Vocabulary) -> Self {
        vocab.items
    }
}

impl Vocabulary {
    /// Items seen at least `min_count` times, most frequent first
    ///
    /// When nothing reaches the threshold the most frequent item is kept so
    /// that every classifier has at least one class.
    pub fn from_counts(counts: &HashMap<String, usize>, min_count: usize) -> Self {
        let mut ranked: Vec<(&String, usize)> = counts.iter().map(|(k, &v)| (k, v)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        let mut items: Vec<String> = ranked
            .iter()
            .filter(|(_, count)| *count >= min_count)
            .map(|(item, _)| (*item).clone())
            .collect();
        if items.is_empty() {
            items.extend(ranked.first().map(|(item, _)| (*item).clone()));
        }
        Self::from(items)
    }

    /// Number of classes
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the vocabulary has no classes
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Class label at `index`
    pub fn get(&self, index: usize) -> Option<&str> {
        self.items.get(index).map(String::as_str)
    }

    /// Last class label
    pub fn last(&self) -> Option<&str> {
        self.items.last().map(String::as_str)
    }

    /// Class index of `item`
    pub fn index_of(&self, item: &str) -> Option<usize> {
        self.index.get(item).copied()
    }

    /// Class index of `item` as a target, [`IGNORE_INDEX`] when unknown
    pub fn target(&self, item: &str) -> i64 {
        self.index_of(item).map_or(IGNORE_INDEX, |i| i as i64)
    }

    /// Class label at `index`, or the last label when out of range
    pub fn label_or_last(&self, index: usize) -> &str {
        self.get(index).or_else(|| self.last()).unwrap_or("_")
    }
}

fn count(counts: &mut HashMap<String, usize>, item: &str) {
    *counts.entry(item.to_string()).or_default() += 1;
}

/// Vocabularies of a training split, stored with every checkpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetState {
    /// Count threshold for forms and lemma rules
    pub min_count: usize,
    /// Forms frequent enough to count as seen
    pub forms: Vocabulary,
    /// Lemma rules per rule type
    pub lemma: BTreeMap<String, Vocabulary>,
    /// Universal POS tags
    pub upos: Vocabulary,
    /// Language-specific POS tags
    pub xpos: Vocabulary,
    /// Full feature strings
    pub feats: Vocabulary,
    /// Dependency labels
    pub deprel: Vocabulary,
    /// Values per feature name
    pub aux_feats: BTreeMap<String, Vocabulary>,
}

impl DatasetState {
    /// Build every vocabulary from training sentences
    #[instrument(skip(sentences), fields(sentences = sentences.len()))]
    pub fn build(sentences: &[Sentence], min_count: usize) -> Self {
        let mut forms = HashMap::new();
        let mut lemma: BTreeMap<String, HashMap<String, usize>> = RULE_TYPES
            .iter()
            .map(|rule_type| (rule_type.to_string(), HashMap::new()))
            .collect();
        let mut upos = HashMap::new();
        let mut xpos = HashMap::new();
        let mut feats = HashMap::new();
        let mut deprel = HashMap::new();
        let mut aux_feats: BTreeMap<String, HashMap<String, usize>> = BTreeMap::new();

        for word in sentences.iter().flat_map(Sentence::words) {
            count(&mut forms, &word.form);
            for (rule_type, rule) in gen_lemma_rule(&word.form, &word.lemma) {
                if let Some(counts) = lemma.get_mut(&rule_type) {
                    count(counts, &rule);
                }
            }
            count(&mut upos, &word.upos);
            count(&mut xpos, &word.xpos);
            count(&mut feats, &word.feats);
            count(&mut deprel, &word.deprel);
            for (name, value) in word.feature_pairs() {
                count(aux_feats.entry(name.to_string()).or_default(), value);
            }
        }

        let state = Self {
            min_count,
            forms: Vocabulary::from_counts(&forms, min_count),
            lemma: lemma
                .iter()
                .map(|(rule_type, counts)| (rule_type.clone(), Vocabulary::from_counts(counts, min_count)))
                .collect(),
            upos: Vocabulary::from_counts(&upos, 1),
            xpos: Vocabulary::from_counts(&xpos, 1),
            feats: Vocabulary::from_counts(&feats, 1),
            deprel: Vocabulary::from_counts(&deprel, 1),
            aux_feats: aux_feats
                .iter()
                .map(|(name, counts)| (name.clone(), Vocabulary::from_counts(counts, 1)))
                .collect(),
        };
        debug!(
            "Vocabularies: {} forms, {} upos, {} xpos, {} feats, {} deprel, {} aux features",
            state.forms.len(),
            state.upos.len(),
            state.xpos.len(),
            state.feats.len(),
            state.deprel.len(),
            state.aux_feats.len()
        );
        state
    }

    /// Output classes of every model head
    pub fn head_sizes(&self) -> HeadSizes {
        HeadSizes {
            lemma: self.lemma.iter().map(|(k, v)| (k.clone(), v.len())).collect(),
            upos: self.upos.len(),
            xpos: self.xpos.len(),
            feats: self.feats.len(),
            deprel: self.deprel.len(),
            aux_feats: self.aux_feats.iter().map(|(k, v)| (k.clone(), v.len())).collect(),
        }
    }

    /// Save as JSON
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string(self).context("Failed to serialize dataset state")?;
        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write {}", path.as_ref().display()))?;
        Ok(())
    }

    /// Load from JSON written by [`DatasetState::to_file`]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
        serde_json::from_str(&content).context("Failed to parse dataset state")
    }
}

/// One featurized sentence
#[derive(Debug, Clone, PartialEq)]
pub struct SentenceRecord {
    /// Position of the sentence in its treebank
    pub index: usize,
    /// Word forms
    pub forms: Vec<String>,
    /// Boundary, word subwords, separator
    pub subwords: Vec<u32>,
    /// Word position of every subword: 0 boundary, `1..=n` words, `n + 1` separator
    pub alignment: Vec<u32>,
    /// Words below the form count threshold
    pub is_unseen: Vec<bool>,
    /// Lemma rule targets per rule type
    pub lemma: BTreeMap<String, Vec<i64>>,
    /// UPOS targets
    pub upos: Vec<i64>,
    /// XPOS targets
    pub xpos: Vec<i64>,
    /// Feature string targets
    pub feats: Vec<i64>,
    /// Head positions, 0 for the root
    pub arc_head: Vec<i64>,
    /// Dependency label targets
    pub arc_dep: Vec<i64>,
    /// Per feature-name value targets
    pub aux_feats: BTreeMap<String, Vec<i64>>,
}

impl SentenceRecord {
    /// Number of words
    pub fn word_count(&self) -> usize {
        self.upos.len()
    }

    /// Featurize `sentence` against the training vocabularies
    pub fn featurize(
        index: usize,
        sentence: &Sentence,
        state: &DatasetState,
        tokenizer: &dyn SubwordTokenizer,
    ) -> Result<Self> {
        let words: Vec<_> = sentence.words().collect();
        let n = words.len();

        let mut subwords = vec![tokenizer.cls_id()];
        let mut alignment = vec![0u32];
        for (position, word) in words.iter().enumerate() {
            let mut ids = tokenizer.encode_word(&word.form)?;
            if ids.is_empty() {
                ids.push(tokenizer.unk_id());
            }
            alignment.extend(std::iter::repeat(position as u32 + 1).take(ids.len()));
            subwords.extend(ids);
        }
        subwords.push(tokenizer.sep_id());
        alignment.push(n as u32 + 1);

        let mut lemma: BTreeMap<String, Vec<i64>> = state
            .lemma
            .keys()
            .map(|rule_type| (rule_type.clone(), Vec::with_capacity(n)))
            .collect();
        let mut aux_feats: BTreeMap<String, Vec<i64>> = state
            .aux_feats
            .keys()
            .map(|name| (name.clone(), Vec::with_capacity(n)))
            .collect();

        for word in &words {
            let rule = gen_lemma_rule(&word.form, &word.lemma);
            for (rule_type, targets) in lemma.iter_mut() {
                let target = match (rule.get(rule_type), state.lemma.get(rule_type)) {
                    (Some(rule), Some(vocab)) => vocab.target(rule),
                    _ => IGNORE_INDEX,
                };
                targets.push(target);
            }

            let pairs: HashMap<&str, &str> = word.feature_pairs().collect();
            for (name, targets) in aux_feats.iter_mut() {
                let target = match (pairs.get(name.as_str()), state.aux_feats.get(name)) {
                    (Some(value), Some(vocab)) => vocab.target(value),
                    _ => IGNORE_INDEX,
                };
                targets.push(target);
            }
        }

        Ok(Self {
            index,
            forms: words.iter().map(|w| w.form.clone()).collect(),
            subwords,
            alignment,
            is_unseen: words.iter().map(|w| state.forms.index_of(&w.form).is_none()).collect(),
            lemma,
            upos: words.iter().map(|w| state.upos.target(&w.upos)).collect(),
            xpos: words.iter().map(|w| state.xpos.target(&w.xpos)).collect(),
            feats: words.iter().map(|w| state.feats.target(&w.feats)).collect(),
            arc_head: words
                .iter()
                .map(|w| w.head.map_or(IGNORE_INDEX, |h| h as i64))
                .collect(),
            arc_dep: words.iter().map(|w| state.deprel.target(&w.deprel)).collect(),
            aux_feats,
        })
    }
}

/// A featurized split together with its gold treebank
#[derive(Debug, Clone)]
pub struct UdDataset {
    path: Option<PathBuf>,
    treebank: Treebank,
    records: Vec<SentenceRecord>,
}

impl UdDataset {
    /// Featurize every sentence of `treebank` on the rayon pool
    #[instrument(skip_all, fields(sentences = treebank.len()))]
    pub fn new(treebank: Treebank, state: &DatasetState, tokenizer: &dyn SubwordTokenizer) -> Result<Self> {
        let records = treebank
            .sentences
            .par_iter()
            .enumerate()
            .map(|(index, sentence)| SentenceRecord::featurize(index, sentence, state, tokenizer))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            path: treebank.path.clone(),
            treebank,
            records,
        })
    }

    /// Read and featurize a treebank file
    pub fn from_file(path: impl AsRef<Path>, state: &DatasetState, tokenizer: &dyn SubwordTokenizer) -> Result<Self> {
        let path = path.as_ref();
        let treebank = Treebank::from_file(path)
            .with_context(|| format!("Failed to read treebank {}", path.display()))?;
        let dataset = Self::new(treebank, state, tokenizer)?;
        info!("Loaded {} sentences from {}", dataset.len(), path.display());
        Ok(dataset)
    }

    /// Number of sentences
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the dataset is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record at `index`
    pub fn get(&self, index: usize) -> Result<&SentenceRecord, DataError> {
        self.records.get(index).ok_or(DataError::InvalidIndex {
            index,
            dataset_size: self.records.len(),
        })
    }

    /// All records in file order
    pub fn records(&self) -> &[SentenceRecord] {
        &self.records
    }

    /// Gold annotation
    pub fn treebank(&self) -> &Treebank {
        &self.treebank
    }

    /// Source file, if the dataset was read from disk
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Training, development and test data of one run
#[derive(Debug, Clone)]
pub struct RunDatasets {
    /// Vocabularies built from the training split
    pub state: DatasetState,
    /// Training split
    pub train: UdDataset,
    /// Development split, absent when it became the test split
    pub dev: Option<UdDataset>,
    /// Test split
    pub test: UdDataset,
}

impl RunDatasets {
    /// Load and featurize the located split files
    #[instrument(skip_all, fields(train = %files.train.display()))]
    pub fn load(
        files: &crate::treebank::SplitFiles,
        tokenizer: &dyn SubwordTokenizer,
        min_count: usize,
    ) -> Result<Self> {
        let train_treebank = Treebank::from_file(&files.train)
            .with_context(|| format!("Failed to read treebank {}", files.train.display()))?;
        let state = DatasetState::build(&train_treebank.sentences, min_count);
        let train = UdDataset::new(train_treebank, &state, tokenizer)?;
        let dev = files
            .dev
            .as_ref()
            .map(|path| UdDataset::from_file(path, &state, tokenizer))
            .transpose()?;
        let test = UdDataset::from_file(&files.test, &state, tokenizer)?;
        info!(
            "Datasets ready: {} train, {} dev, {} test sentences",
            train.len(),
            dev.as_ref().map_or(0, UdDataset::len),
            test.len()
        );
        Ok(Self { state, train, dev, test })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vocabulary_threshold_and_order() {
        let counts: HashMap<String, usize> =
            [("a", 5), ("b", 2), ("c", 5), ("d", 1)].iter().map(|(k, v)| (k.to_string(), *v)).collect();
        let vocab = Vocabulary::from_counts(&counts, 2);
        assert_eq!(vocab.len(), 3);
        assert_eq!(vocab.get(0), Some("a"));
        assert_eq!(vocab.get(1), Some("c"));
        assert_eq!(vocab.target("d"), IGNORE_INDEX);
        assert_eq!(vocab.label_or_last(99), "b");

        let sparse = Vocabulary::from_counts(&counts, 10);
        assert_eq!(sparse.len(), 1);
    }

    #[test]
    fn test_vocabulary_serializes_as_list() {
        let vocab = Vocabulary::from(vec!["NOUN".to_string(), "VERB".to_string()]);
        let json = serde_json::to_string(&vocab).unwrap();
        assert_eq!(json, r#"["NOUN","VERB"]"#);
        let back: Vocabulary = serde_json::from_str(&json).unwrap();
        assert_eq!(back.index_of("VERB"), Some(1));
    }
}
