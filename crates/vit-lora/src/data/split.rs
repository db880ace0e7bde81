use std::sync::Arc;

use burn::data::dataset::{Dataset, InMemDataset};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use super::ImageItem;
use crate::error::{Error, Result};

/// Train/test partition of a labeled image collection.
///
/// Both sides are built once and shared read-only, they are never reshuffled
/// or rebalanced afterwards.
#[derive(Clone)]
pub struct DatasetSplit {
    pub train: Arc<InMemDataset<ImageItem>>,
    pub test: Arc<InMemDataset<ImageItem>>,
}

impl DatasetSplit {
    /// Shuffles `items` with `seed`, keeps at most `max_samples` of them and
    /// holds out `test_fraction` for evaluation.
    pub fn new(
        mut items: Vec<ImageItem>,
        test_fraction: f64,
        max_samples: Option<usize>,
        seed: u64,
    ) -> Result<Self> {
        if !(test_fraction > 0.0 && test_fraction < 1.0) {
            return Err(Error::Dataset(format!(
                "test fraction must be in (0, 1), got {test_fraction}"
            )));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        items.shuffle(&mut rng);
        if let Some(max_samples) = max_samples {
            items.truncate(max_samples);
        }

        if items.len() < 2 {
            return Err(Error::Dataset(format!(
                "at least two images are required to split, got {}",
                items.len()
            )));
        }

        // Test side rounds up, train side rounds down.
        let num_test = ((items.len() as f64 * test_fraction).ceil() as usize)
            .clamp(1, items.len() - 1);
        let train = items.split_off(num_test);
        let test = items;

        log::info!(
            "Split dataset into {} train and {} test images",
            train.len(),
            test.len()
        );

        Ok(Self {
            train: Arc::new(InMemDataset::new(train)),
            test: Arc::new(InMemDataset::new(test)),
        })
    }

    pub fn num_train(&self) -> usize {
        self.train.len()
    }

    pub fn num_test(&self) -> usize {
        self.test.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn items(count: usize) -> Vec<ImageItem> {
        (0..count)
            .map(|index| ImageItem {
                path: PathBuf::from(format!("{index}.png")),
                label: index % 3,
            })
            .collect()
    }

    #[test]
    fn partitions_without_overlap() {
        let split = DatasetSplit::new(items(50), 0.2, None, 42).unwrap();

        assert_eq!(split.num_test(), 10);
        assert_eq!(split.num_train(), 40);

        let mut paths: Vec<_> = split
            .train
            .iter()
            .chain(split.test.iter())
            .map(|item| item.path)
            .collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 50);
    }

    #[test]
    fn rounds_the_test_side_up() {
        let split = DatasetSplit::new(items(11), 0.2, None, 3).unwrap();

        assert_eq!(split.num_test(), 3);
        assert_eq!(split.num_train(), 8);
    }

    #[test]
    fn same_seed_same_split() {
        let first = DatasetSplit::new(items(30), 0.1, None, 7).unwrap();
        let second = DatasetSplit::new(items(30), 0.1, None, 7).unwrap();

        let first: Vec<_> = first.test.iter().collect();
        let second: Vec<_> = second.test.iter().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn caps_samples_and_keeps_both_sides() {
        let split = DatasetSplit::new(items(100), 0.01, Some(5), 1).unwrap();

        assert_eq!(split.num_train() + split.num_test(), 5);
        assert_eq!(split.num_test(), 1);
    }

    #[test]
    fn rejects_bad_inputs() {
        assert!(DatasetSplit::new(items(10), 0.0, None, 0).is_err());
        assert!(DatasetSplit::new(items(10), 1.0, None, 0).is_err());
        assert!(DatasetSplit::new(items(1), 0.5, None, 0).is_err());
    }
}
