use std::path::Path;
use std::sync::Arc;

use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::data::dataset::{Dataset, InMemDataset};
use burn::prelude::*;

use crate::base::load_base_model;
use crate::checkpoint::{AdapterCheckpoint, load_adapter};
use crate::data::{ImageBatch, ImageBatcher, ImageFolder, ImageItem, ImageProcessor};
use crate::error::{Error, Result};
use crate::model::ImageClassifier;

/// Accuracy of a classifier on a held-out dataset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalReport {
    pub correct: usize,
    pub total: usize,
    /// Mean cross-entropy over all samples.
    pub loss: f64,
}

impl EvalReport {
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.correct as f64 / self.total as f64
    }
}

impl core::fmt::Display for EvalReport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "accuracy: {:.2}% ({}/{}) | loss: {:.4}",
            100.0 * self.accuracy(),
            self.correct,
            self.total,
            self.loss
        )
    }
}

/// Runs the classifier over `dataset` with deterministic preprocessing.
pub fn evaluate<B, D>(
    model: &ImageClassifier<B>,
    dataset: D,
    processor: ImageProcessor,
    batch_size: usize,
    device: &B::Device,
) -> Result<EvalReport>
where
    B: Backend,
    D: Dataset<ImageItem> + 'static,
{
    if dataset.is_empty() {
        return Err(Error::Dataset("cannot evaluate on an empty dataset".into()));
    }

    let dataloader: Arc<dyn DataLoader<B, ImageBatch<B>>> =
        DataLoaderBuilder::new(ImageBatcher::eval(processor))
            .batch_size(batch_size.max(1))
            .set_device(device.clone())
            .build(dataset);

    let mut correct = 0;
    let mut total = 0;
    let mut loss_sum = 0.0;

    for batch in dataloader.iter() {
        let num_items = batch.targets.dims()[0];
        let output = model.forward_classification(batch.images, batch.targets);

        let predictions = output.output.argmax(1).squeeze::<1>(1);
        let hits = predictions
            .equal(output.targets)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();
        let loss = output.loss.into_scalar().elem::<f64>();

        correct += hits as usize;
        total += num_items;
        loss_sum += loss * num_items as f64;
    }

    let report = EvalReport {
        correct,
        total,
        loss: loss_sum / total as f64,
    };
    log::info!("Evaluation {report}");

    Ok(report)
}

/// Evaluates a saved adapter on every image of an image folder.
///
/// The base model defaults to the one recorded in the adapter config. Class
/// folders are matched to the adapter labels by name.
pub fn evaluate_adapter<B: Backend>(
    base_model: Option<&str>,
    adapter_dir: &Path,
    data_dir: &Path,
    batch_size: usize,
    device: &B::Device,
) -> Result<EvalReport> {
    let base_model = match base_model {
        Some(id) => id.to_string(),
        None => AdapterCheckpoint::load(adapter_dir)?.config.base_model,
    };
    let base = load_base_model::<B>(&base_model, device)?;
    let (model, checkpoint) = load_adapter(base.backbone, adapter_dir, device)?;
    let items = ImageFolder::open(data_dir)?.relabel(&checkpoint.labels)?;

    evaluate(
        &model,
        InMemDataset::new(items),
        checkpoint.processor.init(),
        batch_size,
        device,
    )
}
