//! Test suite for the UD training pipeline
//!
//! Synthetic treebanks, a hashing character tokenizer and a lookup-table
//! encoder keep every test on the CPU and free of network access.

pub mod loss_tests;
pub mod trainer_tests;

// Utility module for testing
pub mod test_utils;

// Re-export commonly used test utilities
pub use test_utils::{
    create_test_config, create_test_device, synthetic_datasets, synthetic_treebank, CharTokenizer,
    TinyEncoderFactory, TrainingFixture,
};
