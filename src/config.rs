//! Configuration structures shared by the normalization and training tools

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::treebank::{LanguageTreebankMapping, TreebankLayout};

/// Named preset groups of language codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanguageSet {
    /// en he zh vi ko tr el
    Primary,
    /// id fr de tl ru ja th
    Secondary,
    /// my hi ka fi es fa
    Tertiary,
}

impl LanguageSet {
    /// Language codes in this set
    pub fn languages(&self) -> &'static [&'static str] {
        match self {
            LanguageSet::Primary => &["en", "he", "zh", "vi", "ko", "tr", "el"],
            LanguageSet::Secondary => &["id", "fr", "de", "tl", "ru", "ja", "th"],
            LanguageSet::Tertiary => &["my", "hi", "ka", "fi", "es", "fa"],
        }
    }
}

impl FromStr for LanguageSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "primary" => Ok(LanguageSet::Primary),
            "secondary" => Ok(LanguageSet::Secondary),
            "tertiary" => Ok(LanguageSet::Tertiary),
            other => Err(Error::config(format!("Unknown language set '{}'", other))),
        }
    }
}

impl fmt::Display for LanguageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LanguageSet::Primary => "primary",
            LanguageSet::Secondary => "secondary",
            LanguageSet::Tertiary => "tertiary",
        };
        f.write_str(name)
    }
}

/// Dataset size normalization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeConfig {
    /// Languages to normalize against each other
    pub language_set: LanguageSet,
    /// Directory receiving `{language}/{stem}_subset.conllu`
    pub out_dir: PathBuf,
    /// JSON file mapping language codes to treebank directories
    pub treebank_mapping: PathBuf,
    /// Root of the UD release
    pub ud_treebanks_dir: PathBuf,
    /// Seed for the per-split shuffle
    pub seed: u64,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            language_set: LanguageSet::Primary,
            out_dir: PathBuf::from("subsets"),
            treebank_mapping: PathBuf::from("language_treebank_mapping.json"),
            ud_treebanks_dir: PathBuf::from("ud-treebanks-v2.14"),
            seed: 42,
        }
    }
}

impl NormalizeConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.out_dir.as_os_str().is_empty() {
            return Err(Error::config("Output directory must not be empty"));
        }
        Ok(())
    }

    /// Full-UD layout built from the mapping file
    pub fn layout(&self) -> Result<TreebankLayout> {
        Ok(TreebankLayout::Full {
            root: self.ud_treebanks_dir.clone(),
            mapping: LanguageTreebankMapping::from_file(&self.treebank_mapping)?,
        })
    }
}
