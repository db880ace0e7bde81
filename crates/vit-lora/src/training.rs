use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::module::AutodiffModule;
use burn::optim::AdamWConfig;
use burn::prelude::*;
use burn::record::CompactRecorder;
use burn::tensor::backend::AutodiffBackend;
use burn::train::metric::{AccuracyMetric, LossMetric};
use burn::train::{
    ApplicationLoggerInstaller, ClassificationOutput, FileApplicationLoggerInstaller, LearnerBuilder,
    TrainOutput, TrainStep, ValidStep,
};

use crate::base::load_base_model;
use crate::checkpoint::{AdapterCheckpoint, AdapterConfig, load_adapter, save_adapter};
use crate::data::{DatasetSplit, ImageBatch, ImageBatcher, ImageFolder, ImageProcessorConfig};
use crate::eval::{EvalReport, evaluate};
use crate::lora::LoraConfig;
use crate::model::{ImageClassifier, ParamSummary, apply_lora};

impl<B: AutodiffBackend> TrainStep<ImageBatch<B>, ClassificationOutput<B>> for ImageClassifier<B> {
    fn step(&self, batch: ImageBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch.images, batch.targets);

        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<ImageBatch<B>, ClassificationOutput<B>> for ImageClassifier<B> {
    fn step(&self, batch: ImageBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.images, batch.targets)
    }
}

#[derive(Config)]
pub struct TrainingConfig {
    #[config(default = "LoraConfig::new()")]
    pub lora: LoraConfig,
    #[config(default = "ImageProcessorConfig::new()")]
    pub processor: ImageProcessorConfig,
    #[config(default = "AdamWConfig::new().with_weight_decay(0.01)")]
    pub optimizer: AdamWConfig,
    #[config(default = 5)]
    pub num_epochs: usize,
    #[config(default = 32)]
    pub batch_size: usize,
    #[config(default = 2)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 5e-3)]
    pub learning_rate: f64,
    /// Fraction of the images held out for evaluation.
    #[config(default = 0.1)]
    pub test_fraction: f64,
    /// Cap on the number of images used, applied before splitting.
    pub max_samples: Option<usize>,
}

/// Application log written under the artifact directory.
pub const EXPERIMENT_LOG_FILE: &str = "experiment.log";

/// Fits the adapters and the head of `model` with the burn learner.
///
/// Metrics and per-epoch checkpoints are written under `artifact_dir`. The
/// application log is left to the caller, see [install_experiment_logger].
pub fn train<B: AutodiffBackend>(
    config: &TrainingConfig,
    model: ImageClassifier<B>,
    split: &DatasetSplit,
    artifact_dir: &Path,
    device: &B::Device,
) -> ImageClassifier<B> {
    let processor = config.processor.init();

    let dataloader_train: Arc<dyn DataLoader<B, ImageBatch<B>>> =
        DataLoaderBuilder::new(ImageBatcher::train(processor.clone(), config.seed))
            .batch_size(config.batch_size)
            .shuffle(config.seed)
            .num_workers(config.num_workers)
            .set_device(device.clone())
            .build(split.train.clone());

    let dataloader_valid: Arc<dyn DataLoader<B::InnerBackend, ImageBatch<B::InnerBackend>>> =
        DataLoaderBuilder::new(ImageBatcher::eval(processor))
            .batch_size(config.batch_size)
            .num_workers(config.num_workers)
            .set_device(device.clone())
            .build(split.test.clone());

    let learner = LearnerBuilder::new(artifact_dir)
        .metric_train_numeric(AccuracyMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .with_file_checkpointer(CompactRecorder::new())
        .with_application_logger(None)
        .devices(vec![device.clone()])
        .num_epochs(config.num_epochs)
        .summary()
        .build(model, config.optimizer.init(), config.learning_rate);

    let now = Instant::now();
    let model_trained = learner.fit(dataloader_train, dataloader_valid);
    let elapsed = now.elapsed().as_secs();
    log::info!("Training completed in {}m{}s", elapsed / 60, elapsed % 60);

    model_trained
}

/// Routes `log` records to `<artifact_dir>/experiment.log` with burn's file
/// logger. Only the first installed subscriber of a process wins, later calls
/// leave the log file empty and report why.
pub fn install_experiment_logger(artifact_dir: &Path) -> crate::Result<PathBuf> {
    std::fs::create_dir_all(artifact_dir)?;
    let path = format!("{}/{EXPERIMENT_LOG_FILE}", artifact_dir.display());

    if let Err(err) = FileApplicationLoggerInstaller::new(&path).install() {
        log::warn!("Failed to install the experiment logger: {err}");
    }

    Ok(PathBuf::from(path))
}

/// Locations used by [run].
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Foundation model identifier, see [load_base_model].
    pub base_model: String,
    /// Root of a `<class>/<image>` folder.
    pub data_dir: PathBuf,
    /// Where the adapter is saved.
    pub output_dir: PathBuf,
    /// Where the learner writes metrics, checkpoints and the experiment log.
    pub artifact_dir: PathBuf,
}

/// Outcome of a full fine-tuning run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub params: ParamSummary,
    pub num_train: usize,
    pub num_test: usize,
    /// Test accuracy of the model returned by the learner.
    pub eval: EvalReport,
    /// Test accuracy after reloading the saved adapter onto the base model.
    pub reloaded: EvalReport,
}

/// Loads the base model, fine-tunes it with LoRA on an image folder, evaluates
/// it, saves the adapter and checks that the saved adapter reproduces the
/// accuracy once reloaded.
pub fn run<B: AutodiffBackend>(
    options: &PipelineOptions,
    mut config: TrainingConfig,
    device: B::Device,
) -> crate::Result<PipelineReport> {
    install_experiment_logger(&options.artifact_dir)?;

    let (items, labels) = ImageFolder::open(&options.data_dir)?.into_parts();
    let split = DatasetSplit::new(items, config.test_fraction, config.max_samples, config.seed)?;

    let base = load_base_model::<B>(&options.base_model, &device)?;
    if config.processor.size != base.config.image_size {
        log::info!(
            "Resizing images to {0}x{0} to match the base model",
            base.config.image_size
        );
        config.processor.size = base.config.image_size;
    }
    config.processor.validate()?;
    config.save(options.artifact_dir.join("config.json"))?;

    B::seed(config.seed);

    let frozen_backbone = base.backbone.clone().valid();
    let model = apply_lora(base.backbone, &config.lora, labels.len(), &device)?;
    let params = model.param_summary();
    log::info!("{params}");

    let model = train(&config, model, &split, &options.artifact_dir, &device);

    let eval = evaluate(
        &model.valid(),
        split.test.clone(),
        config.processor.init(),
        config.batch_size,
        &device,
    )?;

    let checkpoint = AdapterCheckpoint {
        config: AdapterConfig::new(
            options.base_model.clone(),
            base.config,
            config.lora.clone(),
            labels.len(),
        ),
        processor: config.processor.clone(),
        labels,
    };
    save_adapter(&model, &options.output_dir, &checkpoint)?;

    let (reloaded_model, _) = load_adapter(frozen_backbone, &options.output_dir, &device)?;
    let reloaded = evaluate(
        &reloaded_model,
        split.test.clone(),
        config.processor.init(),
        config.batch_size,
        &device,
    )?;
    if reloaded.correct != eval.correct {
        log::warn!("Reloaded adapter scored {reloaded}, trained model scored {eval}");
    }

    Ok(PipelineReport {
        params,
        num_train: split.num_train(),
        num_test: split.num_test(),
        eval,
        reloaded,
    })
}
