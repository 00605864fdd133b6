//! Locating train/dev/test files for a language

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Language code to treebank directory name, as stored in the mapping file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LanguageTreebankMapping(BTreeMap<String, Option<String>>);

impl LanguageTreebankMapping {
    /// Load the mapping from a JSON object file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|err| {
            Error::config(format!(
                "cannot read treebank mapping {}: {}",
                path.display(),
                err
            ))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Build a mapping from pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), Some(v.into())))
                .collect(),
        )
    }

    /// Treebank directory for `language`; unmapped or `null` entries are fatal
    pub fn treebank(&self, language: &str) -> Result<&str> {
        self.0
            .get(language)
            .and_then(|entry| entry.as_deref())
            .ok_or_else(|| Error::config(format!("Treebank not found for {}", language)))
    }
}

/// Paths of the three splits of one language
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitFiles {
    /// Training split
    pub train: PathBuf,
    /// Development split, absent when it had to stand in for test
    pub dev: Option<PathBuf>,
    /// Test split
    pub test: PathBuf,
}

/// Where a language's data lives
#[derive(Debug, Clone)]
pub enum TreebankLayout {
    /// Full UD release: `{root}/{mapping[language]}/*.conllu`
    Full {
        /// Release root directory
        root: PathBuf,
        /// Language to treebank directory mapping
        mapping: LanguageTreebankMapping,
    },
    /// Size-normalized subsets: `{root}/{language}/{lang}_*-ud-{split}_{suffix}.conllu`
    Subset {
        /// Subset root directory
        root: PathBuf,
        /// Whether to pick the reduced-deprel variant over the plain subset
        reduced_deprel: bool,
    },
}

impl TreebankLayout {
    /// Resolve the split files for `language`
    pub fn locate(&self, language: &str) -> Result<SplitFiles> {
        let (train, dev, test) = match self {
            TreebankLayout::Full { root, mapping } => {
                let dir = root.join(mapping.treebank(language)?);
                find_full_splits(&dir)?
            }
            TreebankLayout::Subset {
                root,
                reduced_deprel,
            } => find_subset_splits(&root.join(language), *reduced_deprel)?,
        };
        resolve_splits(language, train, dev, test)
    }

    /// Resolve all three splits, failing if any is missing
    pub fn locate_all_three(&self, language: &str) -> Result<(PathBuf, PathBuf, PathBuf)> {
        let (train, dev, test) = match self {
            TreebankLayout::Full { root, mapping } => {
                find_full_splits(&root.join(mapping.treebank(language)?))?
            }
            TreebankLayout::Subset {
                root,
                reduced_deprel,
            } => find_subset_splits(&root.join(language), *reduced_deprel)?,
        };
        let missing = |split: &str| Error::config(format!("{} file not found for {}", split, language));
        Ok((
            train.ok_or_else(|| missing("Train"))?,
            dev.ok_or_else(|| missing("Dev"))?,
            test.ok_or_else(|| missing("Test"))?,
        ))
    }
}

type FoundSplits = (Option<PathBuf>, Option<PathBuf>, Option<PathBuf>);

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|err| {
        Error::config(format!("cannot list treebank directory {}: {}", dir.display(), err))
    })?;
    let mut paths = entries
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    paths.sort();
    Ok(paths)
}

fn find_full_splits(dir: &Path) -> Result<FoundSplits> {
    let (mut train, mut dev, mut test) = (None, None, None);
    for path in sorted_entries(dir)? {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) if name.contains(".conllu") => name.to_string(),
            _ => continue,
        };
        let slot = if name.contains("train") {
            &mut train
        } else if name.contains("dev") {
            &mut dev
        } else if name.contains("test") {
            &mut test
        } else {
            continue;
        };
        if slot.is_none() {
            debug!("Found split file {}", path.display());
            *slot = Some(path);
        }
    }
    Ok((train, dev, test))
}

fn find_subset_splits(dir: &Path, reduced_deprel: bool) -> Result<FoundSplits> {
    let suffix = if reduced_deprel {
        "reduced-deprel"
    } else {
        "subset"
    };
    let pattern = format!(
        r"^(?P<lang>[a-z]{{2}})_\w*-ud-(?P<split>train|dev|test)_{}\.conllu$",
        regex::escape(suffix)
    );
    let regex = Regex::new(&pattern).map_err(|err| Error::config(err.to_string()))?;

    let (mut train, mut dev, mut test) = (None, None, None);
    for path in sorted_entries(dir)? {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(captures) = regex.captures(name) {
            match &captures["split"] {
                "train" => train = Some(path.clone()),
                "dev" => dev = Some(path.clone()),
                _ => test = Some(path.clone()),
            }
        }
    }
    Ok((train, dev, test))
}

fn resolve_splits(
    language: &str,
    train: Option<PathBuf>,
    mut dev: Option<PathBuf>,
    mut test: Option<PathBuf>,
) -> Result<SplitFiles> {
    let train =
        train.ok_or_else(|| Error::config(format!("Train file not found for {}", language)))?;
    if test.is_none() && dev.is_some() {
        test = dev.take();
    }
    let test =
        test.ok_or_else(|| Error::config(format!("Test file not found for {}", language)))?;
    Ok(SplitFiles { train, dev, test })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), "").unwrap();
    }

    #[test]
    fn test_unmapped_language_is_config_error() {
        let mapping = LanguageTreebankMapping::from_pairs([("en", "UD_English-EWT")]);
        assert_eq!(mapping.treebank("en").unwrap(), "UD_English-EWT");
        assert!(matches!(mapping.treebank("xx"), Err(Error::Config(_))));
    }

    #[test]
    fn test_null_mapping_entry_is_config_error() {
        let mapping: LanguageTreebankMapping = serde_json::from_str(r#"{"tl": null}"#).unwrap();
        assert!(matches!(mapping.treebank("tl"), Err(Error::Config(_))));
    }

    #[test]
    fn test_full_layout_dev_stands_in_for_missing_test() {
        let root = TempDir::new().unwrap();
        let tb = root.path().join("UD_Test-X");
        fs::create_dir(&tb).unwrap();
        touch(&tb, "xx_x-ud-train.conllu");
        touch(&tb, "xx_x-ud-dev.conllu");
        touch(&tb, "README.md");

        let layout = TreebankLayout::Full {
            root: root.path().to_path_buf(),
            mapping: LanguageTreebankMapping::from_pairs([("xx", "UD_Test-X")]),
        };
        let splits = layout.locate("xx").unwrap();
        assert_eq!(splits.dev, None);
        assert!(splits.test.ends_with("xx_x-ud-dev.conllu"));
    }

    #[test]
    fn test_missing_train_is_config_error() {
        let root = TempDir::new().unwrap();
        let tb = root.path().join("UD_Test-X");
        fs::create_dir(&tb).unwrap();
        touch(&tb, "xx_x-ud-test.conllu");

        let layout = TreebankLayout::Full {
            root: root.path().to_path_buf(),
            mapping: LanguageTreebankMapping::from_pairs([("xx", "UD_Test-X")]),
        };
        assert!(matches!(layout.locate("xx"), Err(Error::Config(_))));
    }

    #[test]
    fn test_subset_layout_matches_variant() {
        let root = TempDir::new().unwrap();
        let lang = root.path().join("en");
        fs::create_dir(&lang).unwrap();
        touch(&lang, "en_ewt-ud-train_subset.conllu");
        touch(&lang, "en_ewt-ud-test_subset.conllu");
        touch(&lang, "en_ewt-ud-train_reduced-deprel.conllu");
        touch(&lang, "en_ewt-ud-dev_reduced-deprel.conllu");
        touch(&lang, "en_ewt-ud-test_reduced-deprel.conllu");

        let reduced = TreebankLayout::Subset {
            root: root.path().to_path_buf(),
            reduced_deprel: true,
        };
        let splits = reduced.locate("en").unwrap();
        assert!(splits.dev.is_some());
        assert!(splits.train.ends_with("en_ewt-ud-train_reduced-deprel.conllu"));

        let plain = TreebankLayout::Subset {
            root: root.path().to_path_buf(),
            reduced_deprel: false,
        };
        let splits = plain.locate("en").unwrap();
        assert_eq!(splits.dev, None);
        assert!(splits.test.ends_with("en_ewt-ud-test_subset.conllu"));
    }
}
