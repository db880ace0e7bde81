use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;

use super::{ImageItem, ImageProcessor};

/// Loads, preprocesses and stacks labeled images.
#[derive(Clone, Debug)]
pub struct ImageBatcher {
    processor: ImageProcessor,
    /// Augmentation seed, `None` for deterministic preprocessing.
    seed: Option<u64>,
    /// Batches produced so far, shared by every clone handed to the loader workers.
    batches: Arc<AtomicU64>,
}

#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// `[batch, 3, size, size]`
    pub images: Tensor<B, 4>,
    /// `[batch]`
    pub targets: Tensor<B, 1, Int>,
}

impl ImageBatcher {
    /// Batcher with random crops and flips, for training.
    ///
    /// The `n`-th batch is augmented with a generator seeded from `seed + n`.
    pub fn train(processor: ImageProcessor, seed: u64) -> Self {
        Self {
            processor,
            seed: Some(seed),
            batches: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Deterministic batcher, for validation and evaluation.
    pub fn eval(processor: ImageProcessor) -> Self {
        Self {
            processor,
            seed: None,
            batches: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ImageBatch<B> {
        let mut rng = self.seed.map(|seed| {
            let index = self.batches.fetch_add(1, Ordering::Relaxed);
            StdRng::seed_from_u64(seed.wrapping_add(index))
        });
        let mut pixels = Vec::with_capacity(items.len() * self.processor.num_values());
        let mut targets = Vec::with_capacity(items.len());

        for item in items {
            // Batchers cannot fail, an unreadable file aborts the loader.
            let image = self.processor.open(&item.path).unwrap_or_else(|err| {
                log::error!("Failed to load {}: {err}", item.path.display());
                panic!("Failed to load image {}: {err}", item.path.display())
            });

            let values = match rng.as_mut() {
                Some(rng) => self.processor.preprocess_train(&image, rng),
                None => self.processor.preprocess_eval(&image),
            };
            pixels.extend(values);
            targets.push((item.label as i64).elem::<B::IntElem>());
        }

        let num_items = targets.len();
        let images = self.processor.to_tensor(pixels, device);
        let targets = Tensor::from_data(TensorData::new(targets, [num_items]), device);

        ImageBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ImageProcessorConfig;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn stacks_images_and_targets() {
        let dir = tempfile::tempdir().unwrap();
        let mut items = Vec::new();
        for (index, label) in [2usize, 0, 1].into_iter().enumerate() {
            let path = dir.path().join(format!("{index}.png"));
            image::RgbImage::new(10 + index as u32, 12).save(&path).unwrap();
            items.push(ImageItem { path, label });
        }
        let processor = ImageProcessorConfig::new().with_size(8).init();
        let device = Default::default();

        for batcher in [
            ImageBatcher::train(processor.clone(), 42),
            ImageBatcher::eval(processor),
        ] {
            let batch: ImageBatch<TestBackend> = batcher.batch(items.clone(), &device);

            assert_eq!(batch.images.dims(), [3, 3, 8, 8]);
            let targets = batch.targets.into_data().to_vec::<i64>().unwrap();
            assert_eq!(targets, vec![2, 0, 1]);
        }
    }

    fn pixels(batch: ImageBatch<TestBackend>) -> Vec<f32> {
        batch.images.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn same_seed_gives_same_augmentation() {
        let dir = tempfile::tempdir().unwrap();
        let items: Vec<ImageItem> = (0..4)
            .map(|index| {
                let path = dir.path().join(format!("{index}.png"));
                image::RgbImage::from_fn(24, 20, |x, y| {
                    image::Rgb([(x * 10) as u8, (y * 12) as u8, (index * 60) as u8])
                })
                .save(&path)
                .unwrap();
                ImageItem { path, label: 0 }
            })
            .collect();
        let processor = ImageProcessorConfig::new().with_size(8).init();
        let device = Default::default();

        let first = ImageBatcher::train(processor.clone(), 7);
        let second = ImageBatcher::train(processor.clone(), 7);
        let other = ImageBatcher::train(processor, 8);

        let a = pixels(first.batch(items.clone(), &device));
        let b = pixels(second.batch(items.clone(), &device));
        let c = pixels(other.batch(items.clone(), &device));
        let next = pixels(first.batch(items, &device));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, next);
    }
}
