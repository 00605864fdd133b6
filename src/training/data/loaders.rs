//! Data loaders for UD training

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Batch, BatchCollator, DataError, UdDataset};

/// Configuration for DataLoader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataLoaderConfig {
    /// Batch size
    pub batch_size: usize,
    /// Whether to shuffle data every epoch
    pub shuffle: bool,
    /// Whether to drop the last incomplete batch
    pub drop_last: bool,
    /// Shuffling seed
    pub seed: u64,
}

impl DataLoaderConfig {
    /// Shuffled loader that drops the last incomplete batch
    pub fn train(batch_size: usize, seed: u64) -> Self {
        Self {
            batch_size,
            shuffle: true,
            drop_last: true,
            seed,
        }
    }

    /// Ordered loader that keeps every sentence
    pub fn eval(batch_size: usize) -> Self {
        Self {
            batch_size,
            shuffle: false,
            drop_last: false,
            seed: 0,
        }
    }
}

/// Batches over a featurized dataset
pub struct DataLoader {
    dataset: Arc<UdDataset>,
    config: DataLoaderConfig,
    collator: BatchCollator,
    rng: StdRng,
}

impl DataLoader {
    /// Create a new DataLoader
    pub fn new(dataset: Arc<UdDataset>, config: DataLoaderConfig, collator: BatchCollator) -> Self {
        debug!(
            "Creating DataLoader with batch_size={}, shuffle={}, drop_last={}",
            config.batch_size, config.shuffle, config.drop_last
        );
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            dataset,
            config,
            collator,
            rng,
        }
    }

    /// Get the number of batches per epoch
    pub fn num_batches(&self) -> usize {
        let dataset_size = self.dataset.len();
        let batch_size = self.config.batch_size.max(1);
        if self.config.drop_last {
            dataset_size / batch_size
        } else {
            dataset_size.div_ceil(batch_size)
        }
    }

    /// Get dataset size
    pub fn dataset_size(&self) -> usize {
        self.dataset.len()
    }

    /// Dataset the loader draws from
    pub fn dataset(&self) -> &UdDataset {
        &self.dataset
    }

    /// Batches of one epoch, collated lazily
    pub fn epoch(&mut self) -> Batches<'_> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            indices.shuffle(&mut self.rng);
        }
        let batches = self.create_batches(indices);
        info!("Starting epoch with {} batches", batches.len());
        Batches {
            dataset: &self.dataset,
            collator: &self.collator,
            batches: batches.into_iter(),
        }
    }

    fn create_batches(&self, indices: Vec<usize>) -> Vec<Vec<usize>> {
        let batch_size = self.config.batch_size.max(1);
        indices
            .chunks(batch_size)
            .filter(|chunk| !self.config.drop_last || chunk.len() == batch_size)
            .map(<[usize]>::to_vec)
            .collect()
    }
}

/// Iterator over the batches of one epoch
pub struct Batches<'a> {
    dataset: &'a UdDataset,
    collator: &'a BatchCollator,
    batches: std::vec::IntoIter<Vec<usize>>,
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        let indices = self.batches.next()?;
        let records = indices
            .iter()
            .map(|&index| self.dataset.get(index))
            .collect::<Result<Vec<_>, _>>();
        Some(records.and_then(|records| self.collator.collate(&records)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.batches.size_hint()
    }
}

impl ExactSizeIterator for Batches<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::data::DatasetState;
    use crate::training::tests::test_utils::{synthetic_treebank, CharTokenizer};
    use candle_core::Device;

    fn dataset(sentences: usize) -> Arc<UdDataset> {
        let treebank = synthetic_treebank(sentences, 1);
        let state = DatasetState::build(&treebank.sentences, 1);
        Arc::new(UdDataset::new(treebank, &state, &CharTokenizer).unwrap())
    }

    #[test]
    fn test_train_loader_drops_last() {
        let mut loader = DataLoader::new(
            dataset(10),
            DataLoaderConfig::train(4, 42),
            BatchCollator::new(0, Device::Cpu),
        );
        assert_eq!(loader.num_batches(), 2);
        let batches: Vec<_> = loader.epoch().map(Result::unwrap).collect();
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() == 4));
    }

    #[test]
    fn test_eval_loader_keeps_order() {
        let mut loader = DataLoader::new(
            dataset(10),
            DataLoaderConfig::eval(4),
            BatchCollator::new(0, Device::Cpu),
        );
        assert_eq!(loader.num_batches(), 3);
        let indices: Vec<usize> = loader
            .epoch()
            .flat_map(|b| b.unwrap().indices)
            .collect();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_shuffle_is_seeded() {
        let order = |seed| {
            let mut loader = DataLoader::new(
                dataset(12),
                DataLoaderConfig::train(3, seed),
                BatchCollator::new(0, Device::Cpu),
            );
            loader
                .epoch()
                .flat_map(|b| b.unwrap().indices)
                .collect::<Vec<_>>()
        };
        assert_eq!(order(7), order(7));
    }
}
