//! Error types for the UD training system

use thiserror::Error;

/// Main error type for UD training operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (unmapped language, missing split, bad hyperparameter)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed sentence-annotation input
    #[error("Treebank error at line {line}: {reason}")]
    Treebank {
        /// 1-based line number of the offending line
        line: usize,
        /// What was wrong with it
        reason: String,
    },

    /// Tokenizer error
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Revision registry or snapshot download error
    #[error("Hub error: {0}")]
    Hub(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for UD training operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a treebank format error
    pub fn treebank(line: usize, reason: impl Into<String>) -> Self {
        Self::Treebank {
            line,
            reason: reason.into(),
        }
    }

    /// Create a tokenizer error
    pub fn tokenizer(msg: impl Into<String>) -> Self {
        Self::Tokenizer(msg.into())
    }

    /// Create a hub error
    pub fn hub(msg: impl Into<String>) -> Self {
        Self::Hub(msg.into())
    }
}
