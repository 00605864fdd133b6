//! Dataset size normalization across languages
//!
//! Every language's train/dev/test split is shuffled once with a fixed seed and
//! then cut down to a greedy prefix whose token count first reaches the
//! smallest count observed for that split across all languages. The last
//! sentence kept may overshoot the target.

use std::fmt;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::config::NormalizeConfig;
use crate::error::{Error, Result};
use crate::treebank::{write_sentences, Sentence, Treebank, TreebankLayout};
use crate::utils::ensure_dir_exists;

/// One of the three data splits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    /// Training data
    Train,
    /// Development data
    Dev,
    /// Test data
    Test,
}

impl Split {
    /// All splits in file order
    pub const ALL: [Split; 3] = [Split::Train, Split::Dev, Split::Test];

    fn index(self) -> usize {
        match self {
            Split::Train => 0,
            Split::Dev => 1,
            Split::Test => 2,
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Split::Train => "train",
            Split::Dev => "dev",
            Split::Test => "test",
        })
    }
}

/// Token counts per split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SplitSizes {
    /// Training tokens
    pub train: usize,
    /// Development tokens
    pub dev: usize,
    /// Test tokens
    pub test: usize,
}

impl SplitSizes {
    /// Count for one split
    pub fn get(&self, split: Split) -> usize {
        match split {
            Split::Train => self.train,
            Split::Dev => self.dev,
            Split::Test => self.test,
        }
    }

    /// Elementwise minimum
    pub fn min(self, other: SplitSizes) -> SplitSizes {
        SplitSizes {
            train: self.train.min(other.train),
            dev: self.dev.min(other.dev),
            test: self.test.min(other.test),
        }
    }
}

/// A language's three splits, held in shuffled order
#[derive(Debug, Clone)]
pub struct LanguageCorpus {
    /// Language code
    pub language: String,
    /// Source files, indexed like [`Split::ALL`]
    pub sources: [PathBuf; 3],
    /// Sentences, indexed like [`Split::ALL`]
    pub splits: [Vec<Sentence>; 3],
}

impl LanguageCorpus {
    /// Sentences of one split
    pub fn split(&self, split: Split) -> &[Sentence] {
        &self.splits[split.index()]
    }

    /// Token counts of the three splits
    pub fn sizes(&self) -> SplitSizes {
        let count = |split: Split| token_count(self.split(split));
        SplitSizes {
            train: count(Split::Train),
            dev: count(Split::Dev),
            test: count(Split::Test),
        }
    }
}

/// Summary row for the audit table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorpusStatistics {
    /// Language code
    pub language: String,
    /// Sentence counts per split
    pub sentences: [usize; 3],
    /// Token counts per split
    pub tokens: [usize; 3],
    /// Tokens over sentences, all splits pooled
    pub avg_tokens_per_sentence: f64,
}

/// Sum of sentence lengths
pub fn token_count(sentences: &[Sentence]) -> usize {
    sentences.iter().map(Sentence::len).sum()
}

/// Read every language's splits and shuffle them with one seeded generator
///
/// Parsing runs in parallel; shuffling follows language order then split
/// order so that the result only depends on `seed`.
#[instrument(skip(layout, languages))]
pub fn load_datasets(
    layout: &TreebankLayout,
    languages: &[&str],
    seed: u64,
) -> Result<Vec<LanguageCorpus>> {
    let sources = languages
        .iter()
        .map(|language| {
            let (train, dev, test) = layout.locate_all_three(language)?;
            Ok((language.to_string(), [train, dev, test]))
        })
        .collect::<Result<Vec<_>>>()?;

    let parsed = sources
        .par_iter()
        .map(|(language, paths)| {
            info!("Parsing {} treebanks...", language);
            let mut splits: [Vec<Sentence>; 3] = Default::default();
            for (slot, path) in splits.iter_mut().zip(paths) {
                *slot = Treebank::from_file(path)?.sentences;
            }
            Ok(splits)
        })
        .collect::<Result<Vec<_>>>()?;

    let mut rng = StdRng::seed_from_u64(seed);
    Ok(sources
        .into_iter()
        .zip(parsed)
        .map(|((language, sources), mut splits)| {
            for split in splits.iter_mut() {
                split.shuffle(&mut rng);
            }
            LanguageCorpus {
                language,
                sources,
                splits,
            }
        })
        .collect())
}

/// Per-split minimum token count across all corpora
pub fn find_smallest_dataset(corpora: &[LanguageCorpus]) -> Option<SplitSizes> {
    corpora
        .iter()
        .map(LanguageCorpus::sizes)
        .reduce(SplitSizes::min)
}

/// Length of the shortest prefix whose token count reaches `target`
///
/// A sentence is always taken before the target is checked, so a zero target
/// keeps the first sentence. If the target is never reached the whole split
/// is kept.
pub fn prefix_len(sentences: &[Sentence], target: usize) -> usize {
    let mut counter = 0;
    for (index, sentence) in sentences.iter().enumerate() {
        counter += sentence.len();
        if counter >= target {
            return index + 1;
        }
    }
    sentences.len()
}

/// Truncate `sentences` to its greedy prefix for `target`
pub fn normalize_split(sentences: &mut Vec<Sentence>, target: usize) {
    let keep = prefix_len(sentences, target);
    sentences.truncate(keep);
}

/// Truncate every split of every corpus to the matching target
pub fn normalize_corpora(corpora: &mut [LanguageCorpus], targets: SplitSizes) {
    for corpus in corpora.iter_mut() {
        for split in Split::ALL {
            normalize_split(&mut corpus.splits[split.index()], targets.get(split));
        }
    }
}

/// Sentence and token counts per language
pub fn generate_statistics(corpora: &[LanguageCorpus]) -> Vec<CorpusStatistics> {
    corpora
        .iter()
        .map(|corpus| {
            let sentences = Split::ALL.map(|split| corpus.split(split).len());
            let tokens = Split::ALL.map(|split| token_count(corpus.split(split)));
            let n_sents: usize = sentences.iter().sum();
            let n_tokens: usize = tokens.iter().sum();
            let avg = if n_sents == 0 {
                0.0
            } else {
                n_tokens as f64 / n_sents as f64
            };
            CorpusStatistics {
                language: corpus.language.clone(),
                sentences,
                tokens,
                avg_tokens_per_sentence: avg,
            }
        })
        .collect()
}

/// Render statistics as a fixed-width table
pub fn format_statistics(rows: &[CorpusStatistics]) -> String {
    let mut table = format!(
        "{:<10}{:>15}{:>16}{:>13}{:>14}{:>14}{:>15}{:>26}\n",
        "language",
        "n_train_sents",
        "n_train_tokens",
        "n_dev_sents",
        "n_dev_tokens",
        "n_test_sents",
        "n_test_tokens",
        "avg_tokens_per_sentence"
    );
    for row in rows {
        table.push_str(&format!(
            "{:<10}{:>15}{:>16}{:>13}{:>14}{:>14}{:>15}{:>26.6}\n",
            row.language,
            row.sentences[0],
            row.tokens[0],
            row.sentences[1],
            row.tokens[1],
            row.sentences[2],
            row.tokens[2],
            row.avg_tokens_per_sentence
        ));
    }
    table
}

/// File the subset of `source` is written to
pub fn subset_path(out_dir: &Path, language: &str, source: &Path) -> Result<PathBuf> {
    let name = source
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::config(format!("invalid source file {}", source.display())))?;
    let stem = name.strip_suffix(".conllu").unwrap_or(name);
    Ok(out_dir
        .join(language)
        .join(format!("{}_subset.conllu", stem)))
}

/// Write `{out_dir}/{language}/{stem}_subset.conllu` for every split
pub fn save_subsets(out_dir: &Path, corpora: &[LanguageCorpus]) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for corpus in corpora {
        ensure_dir_exists(out_dir.join(&corpus.language))?;
        for split in Split::ALL {
            let path = subset_path(out_dir, &corpus.language, &corpus.sources[split.index()])?;
            write_sentences(&path, corpus.split(split))?;
            written.push(path);
        }
    }
    Ok(written)
}

/// Run the whole normalization for a configured language set
#[instrument(skip(config), fields(language_set = %config.language_set))]
pub fn run(config: &NormalizeConfig) -> Result<Vec<CorpusStatistics>> {
    config.validate()?;
    let layout = config.layout()?;
    let languages = config.language_set.languages();

    let mut corpora = load_datasets(&layout, languages, config.seed)?;
    let targets = find_smallest_dataset(&corpora)
        .ok_or_else(|| Error::config("No languages to normalize"))?;
    info!("Sizes of the normalized datasets: {:?}", targets);

    info!("Normalizing datasets...");
    normalize_corpora(&mut corpora, targets);

    info!("Generating statistics...");
    let statistics = generate_statistics(&corpora);
    info!("\n{}", format_statistics(&statistics));

    info!("Saving normalized subsets...");
    let written = save_subsets(&config.out_dir, &corpora)?;
    info!("Wrote {} subset files to {}", written.len(), config.out_dir.display());

    Ok(statistics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::treebank::{Token, TokenId};
    use proptest::prelude::*;

    fn sentence(len: usize) -> Sentence {
        let tokens = (1..=len)
            .map(|i| Token {
                id: TokenId::Word(i),
                form: format!("w{}", i),
                lemma: format!("w{}", i),
                upos: "X".into(),
                xpos: "_".into(),
                feats: "_".into(),
                head: Some(if i == 1 { 0 } else { 1 }),
                deprel: if i == 1 { "root".into() } else { "dep".into() },
                misc: "_".into(),
            })
            .collect();
        Sentence {
            comments: vec![],
            tokens,
        }
    }

    fn corpus(language: &str, lengths: [&[usize]; 3]) -> LanguageCorpus {
        LanguageCorpus {
            language: language.to_string(),
            sources: [
                PathBuf::from(format!("{}-ud-train.conllu", language)),
                PathBuf::from(format!("{}-ud-dev.conllu", language)),
                PathBuf::from(format!("{}-ud-test.conllu", language)),
            ],
            splits: lengths.map(|lens| lens.iter().map(|&n| sentence(n)).collect()),
        }
    }

    #[test]
    fn test_two_language_scenario() {
        let mut corpora = vec![
            corpus("aa", [&[30, 30, 30, 10], &[20, 20], &[35, 35]]),
            corpus("bb", [&[20, 20, 20], &[25, 25], &[30, 25]]),
        ];
        assert_eq!(corpora[0].sizes(), SplitSizes { train: 100, dev: 40, test: 70 });
        assert_eq!(corpora[1].sizes(), SplitSizes { train: 60, dev: 50, test: 55 });

        let targets = find_smallest_dataset(&corpora).unwrap();
        assert_eq!(targets, SplitSizes { train: 60, dev: 40, test: 55 });

        normalize_corpora(&mut corpora, targets);
        // 30 + 30 reaches 60
        assert_eq!(corpora[0].split(Split::Train).len(), 2);
        assert_eq!(corpora[0].sizes().test, 70);
        assert_eq!(corpora[1].sizes(), SplitSizes { train: 60, dev: 50, test: 55 });
        assert_eq!(corpora[1].split(Split::Dev).len(), 2);
    }

    #[test]
    fn test_zero_target_keeps_first_sentence() {
        let mut sentences = vec![sentence(3), sentence(4)];
        normalize_split(&mut sentences, 0);
        assert_eq!(sentences.len(), 1);
    }

    #[test]
    fn test_statistics_table() {
        let corpora = vec![corpus("aa", [&[2, 4], &[3], &[1]])];
        let rows = generate_statistics(&corpora);
        assert_eq!(rows[0].sentences, [2, 1, 1]);
        assert_eq!(rows[0].tokens, [6, 3, 1]);
        assert!((rows[0].avg_tokens_per_sentence - 2.5).abs() < 1e-12);
        let table = format_statistics(&rows);
        assert!(table.starts_with("language"));
        assert!(table.contains("aa"));
    }

    #[test]
    fn test_save_subsets_names() {
        let dir = tempfile::TempDir::new().unwrap();
        let corpora = vec![corpus("aa", [&[2], &[3], &[1]])];
        let written = save_subsets(dir.path(), &corpora).unwrap();
        assert_eq!(written.len(), 3);
        let train = dir.path().join("aa/aa-ud-train_subset.conllu");
        assert!(train.exists());
        let reread = Treebank::from_file(&train).unwrap();
        assert_eq!(reread.sentences, corpora[0].splits[0]);
    }

    #[test]
    fn test_load_datasets_is_deterministic() {
        let dir = tempfile::TempDir::new().unwrap();
        let tb = dir.path().join("UD_Aa");
        std::fs::create_dir(&tb).unwrap();
        for split in ["train", "dev", "test"] {
            let sentences: Vec<Sentence> = (1..=8).map(sentence).collect();
            write_sentences(tb.join(format!("aa-ud-{}.conllu", split)), &sentences).unwrap();
        }
        let layout = TreebankLayout::Full {
            root: dir.path().to_path_buf(),
            mapping: crate::treebank::LanguageTreebankMapping::from_pairs([("aa", "UD_Aa")]),
        };
        let first = load_datasets(&layout, &["aa"], 42).unwrap();
        let second = load_datasets(&layout, &["aa"], 42).unwrap();
        assert_eq!(first[0].splits, second[0].splits);
        assert_eq!(first[0].sizes().train, 36);
    }

    proptest! {
        #[test]
        fn prop_target_is_elementwise_min_and_output_is_bounded_prefix(
            lengths in prop::collection::vec(
                [
                    prop::collection::vec(1usize..20, 1..12),
                    prop::collection::vec(1usize..20, 1..12),
                    prop::collection::vec(1usize..20, 1..12),
                ],
                1..5,
            )
        ) {
            let mut corpora: Vec<LanguageCorpus> = lengths
                .iter()
                .enumerate()
                .map(|(i, [a, b, c])| {
                    corpus(&format!("l{}", i), [a.as_slice(), b.as_slice(), c.as_slice()])
                })
                .collect();
            let original = corpora.clone();
            let targets = find_smallest_dataset(&corpora).unwrap();

            for split in Split::ALL {
                let expected = original.iter().map(|c| c.sizes().get(split)).min().unwrap();
                prop_assert_eq!(targets.get(split), expected);
            }

            normalize_corpora(&mut corpora, targets);
            for (kept, full) in corpora.iter().zip(&original) {
                for split in Split::ALL {
                    let kept = kept.split(split);
                    let full = full.split(split);
                    prop_assert!(!kept.is_empty());
                    prop_assert_eq!(kept, &full[..kept.len()]);
                    let before_last = token_count(&kept[..kept.len() - 1]);
                    prop_assert!(before_last < targets.get(split));
                }
            }
        }
    }
}
