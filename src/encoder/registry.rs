//! Pretraining checkpoint revisions and their snapshots
//!
//! Coarse mode enumerates the branches of the model repository on the hub,
//! one branch per pretraining checkpoint. Fine-grained mode walks a fixed list
//! of intermediate steps stored as local directories.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};

/// Default hub endpoint for listing repository refs
pub const HUB_ENDPOINT: &str = "https://huggingface.co";

/// Default location of the fine-grained checkpoints
pub const FINE_GRAINED_ROOT: &str = "/cluster/shared/nlpl/data/models/HPLTv2/";

/// Pretraining steps available in fine-grained mode
pub const FINE_GRAINED_STEPS: [u32; 6] = [0, 30, 300, 760, 2290, 3050];

/// Model code of a language's fine-grained checkpoints
pub fn fine_grained_code(language: &str) -> Option<&'static str> {
    Some(match language {
        "el" => "ellG",
        "en" => "engL",
        "he" => "hebH",
        "id" => "indL",
        "ko" => "korH",
        "fa" => "pesA",
        "ru" => "rusC",
        "tr" => "turL",
        "vi" => "vieL",
        "zh" => "zhoH",
        _ => return None,
    })
}

/// Known encoder families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// Monolingual HPLT BERT models
    Hplt,
}

impl ModelFamily {
    /// Hub repository of `language`'s model
    pub fn repository(&self, language: &str) -> String {
        match self {
            ModelFamily::Hplt => format!("HPLT/hplt_bert_base_{}", language),
        }
    }
}

impl FromStr for ModelFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hplt" => Ok(ModelFamily::Hplt),
            other => Err(Error::config(format!("Unknown model {}", other))),
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelFamily::Hplt => f.write_str("hplt"),
        }
    }
}

/// A pretraining checkpoint to fine-tune from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revision {
    /// Branch of a hub repository
    Hub {
        /// Repository id
        repo: String,
        /// Branch name
        branch: String,
    },
    /// Local snapshot directory
    Local(PathBuf),
}

impl Revision {
    /// Name used in run identifiers and result keys
    pub fn name(&self) -> String {
        match self {
            Revision::Hub { branch, .. } => branch.clone(),
            Revision::Local(path) => format!("{}/", path.display()),
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Files making up one encoder snapshot
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// `config.json`
    pub config: PathBuf,
    /// safetensors weight files
    pub weights: Vec<PathBuf>,
    /// `tokenizer.json`
    pub tokenizer: PathBuf,
}

impl Snapshot {
    /// Snapshot stored in a local directory
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let require = |name: &str| {
            let path = dir.join(name);
            if path.is_file() {
                Ok(path)
            } else {
                Err(Error::hub(format!("{} is missing {}", dir.display(), name)))
            }
        };
        Ok(Self {
            config: require("config.json")?,
            weights: vec![require("model.safetensors")?],
            tokenizer: require("tokenizer.json")?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RepoRefs {
    branches: Vec<GitRef>,
}

#[derive(Debug, Deserialize)]
struct GitRef {
    name: String,
}

/// Enumerates and resolves revisions for one language
#[derive(Debug, Clone)]
pub struct RevisionRegistry {
    family: ModelFamily,
    language: String,
    fine_grained: bool,
    fine_grained_root: PathBuf,
    endpoint: String,
}

impl RevisionRegistry {
    /// Registry for `language`'s `family` model
    pub fn new(family: ModelFamily, language: impl Into<String>, fine_grained: bool) -> Self {
        Self {
            family,
            language: language.into(),
            fine_grained,
            fine_grained_root: PathBuf::from(FINE_GRAINED_ROOT),
            endpoint: HUB_ENDPOINT.to_string(),
        }
    }

    /// Override the fine-grained checkpoint root
    pub fn with_fine_grained_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.fine_grained_root = root.into();
        self
    }

    /// Override the hub endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Hub repository of the model
    pub fn repository(&self) -> String {
        self.family.repository(&self.language)
    }

    /// All revisions to train from, in registry order
    #[instrument(skip(self), fields(language = %self.language, fine_grained = self.fine_grained))]
    pub fn revisions(&self) -> Result<Vec<Revision>> {
        if self.fine_grained {
            self.fine_grained_revisions()
        } else {
            let repo = self.repository();
            let branches = self.list_branches(&repo)?;
            info!("Found {} revisions of {}", branches.len(), repo);
            Ok(branches
                .into_iter()
                .map(|branch| Revision::Hub {
                    repo: repo.clone(),
                    branch,
                })
                .collect())
        }
    }

    /// Fixed list of local fine-grained step directories
    pub fn fine_grained_revisions(&self) -> Result<Vec<Revision>> {
        let code = fine_grained_code(&self.language).ok_or_else(|| {
            Error::config(format!(
                "No fine-grained checkpoints for {}",
                self.language
            ))
        })?;
        Ok(FINE_GRAINED_STEPS
            .iter()
            .map(|step| Revision::Local(self.fine_grained_root.join(format!("{}_{}", code, step))))
            .collect())
    }

    fn list_branches(&self, repo: &str) -> Result<Vec<String>> {
        let url = format!("{}/api/models/{}/refs", self.endpoint.trim_end_matches('/'), repo);
        debug!("Listing refs from {}", url);
        let refs: RepoRefs = reqwest::blocking::get(&url)
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.json())
            .map_err(|e| Error::hub(format!("Failed to list refs of {}: {}", repo, e)))?;
        Ok(refs.branches.into_iter().map(|r| r.name).collect())
    }

    /// Download or locate the files of `revision`
    pub fn snapshot(&self, revision: &Revision) -> Result<Snapshot> {
        match revision {
            Revision::Local(dir) => Snapshot::from_dir(dir),
            Revision::Hub { repo, branch } => {
                let api = Api::new().map_err(|e| Error::hub(e.to_string()))?;
                let repo = api.repo(Repo::with_revision(
                    repo.clone(),
                    RepoType::Model,
                    branch.clone(),
                ));
                let fetch = |name: &str| {
                    repo.get(name)
                        .map_err(|e| Error::hub(format!("Failed to fetch {}@{}: {}", name, branch, e)))
                };
                Ok(Snapshot {
                    config: fetch("config.json")?,
                    weights: vec![fetch("model.safetensors")?],
                    tokenizer: fetch("tokenizer.json")?,
                })
            }
        }
    }

    /// Revision whose tokenizer featurizes the data for every run
    pub fn tokenizer_revision(&self) -> Result<Revision> {
        if self.fine_grained {
            self.fine_grained_revisions()?
                .into_iter()
                .next()
                .ok_or_else(|| Error::config("empty fine-grained step list"))
        } else {
            Ok(Revision::Hub {
                repo: self.repository(),
                branch: "main".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_model_is_config_error() {
        assert_eq!("hplt".parse::<ModelFamily>().unwrap(), ModelFamily::Hplt);
        assert!(matches!("xlmr".parse::<ModelFamily>(), Err(Error::Config(_))));
        assert_eq!(ModelFamily::Hplt.repository("fi"), "HPLT/hplt_bert_base_fi");
    }

    #[test]
    fn test_fine_grained_revisions() {
        let registry =
            RevisionRegistry::new(ModelFamily::Hplt, "en", true).with_fine_grained_root("/models");
        let revisions = registry.revisions().unwrap();
        assert_eq!(revisions.len(), 6);
        assert_eq!(revisions[0], Revision::Local(PathBuf::from("/models/engL_0")));
        assert_eq!(revisions[5].name(), "/models/engL_3050/");
        assert_eq!(registry.tokenizer_revision().unwrap(), revisions[0]);
    }

    #[test]
    fn test_fine_grained_unmapped_language() {
        let registry = RevisionRegistry::new(ModelFamily::Hplt, "fi", true);
        assert!(matches!(registry.revisions(), Err(Error::Config(_))));
    }

    #[test]
    fn test_local_snapshot_requires_files() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(Snapshot::from_dir(dir.path()).is_err());
        for name in ["config.json", "model.safetensors", "tokenizer.json"] {
            std::fs::write(dir.path().join(name), "{}").unwrap();
        }
        let snapshot = Snapshot::from_dir(dir.path()).unwrap();
        assert_eq!(snapshot.weights.len(), 1);
    }
}
