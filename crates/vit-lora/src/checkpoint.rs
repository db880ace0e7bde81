//! Adapter-only persistence.
//!
//! A fine-tuned model is saved as a directory that never contains the frozen
//! foundation weights:
//!
//! ```text
//! my-adapter/
//! ├── adapter_config.json       # base model id, backbone geometry, LoRA config
//! ├── adapter_model.mpk         # adapter factors + classification head
//! ├── preprocessor_config.json  # image preprocessing
//! └── labels.json               # id <-> class name
//! ```

use std::path::Path;

use burn::config::Config;
use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::Backend;

use crate::data::ImageProcessorConfig;
use crate::error::Error;
use crate::labels::LabelMap;
use crate::lora::{LoraAdapter, LoraConfig, LoraError, LoraTarget};
use crate::model::{ImageClassifier, VisionTransformer, VitConfig};

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model";
pub const PROCESSOR_CONFIG_FILE: &str = "preprocessor_config.json";
pub const LABELS_FILE: &str = "labels.json";

/// Everything needed to rebuild the adapter skeleton.
#[derive(Config, Debug)]
pub struct AdapterConfig {
    /// Identifier the foundation model was loaded from.
    pub base_model: String,
    pub model: VitConfig,
    pub lora: LoraConfig,
    pub num_labels: usize,
}

/// Adapters of one encoder layer, `None` where no adapter is attached.
#[derive(Module, Debug)]
pub struct LayerAdapters<B: Backend> {
    pub query: Option<LoraAdapter<B>>,
    pub key: Option<LoraAdapter<B>>,
    pub value: Option<LoraAdapter<B>>,
    pub attention_output: Option<LoraAdapter<B>>,
    pub intermediate: Option<LoraAdapter<B>>,
    pub output: Option<LoraAdapter<B>>,
}

impl<B: Backend> LayerAdapters<B> {
    fn slot(&mut self, target: LoraTarget) -> &mut Option<LoraAdapter<B>> {
        match target {
            LoraTarget::Query => &mut self.query,
            LoraTarget::Key => &mut self.key,
            LoraTarget::Value => &mut self.value,
            LoraTarget::AttentionOutput => &mut self.attention_output,
            LoraTarget::Intermediate => &mut self.intermediate,
            LoraTarget::Output => &mut self.output,
        }
    }

    fn empty() -> Self {
        Self {
            query: None,
            key: None,
            value: None,
            attention_output: None,
            intermediate: None,
            output: None,
        }
    }
}

/// The trainable state of an adapted classifier.
#[derive(Module, Debug)]
pub struct AdapterWeights<B: Backend> {
    pub layers: Vec<LayerAdapters<B>>,
    pub classifier: Linear<B>,
}

impl<B: Backend> AdapterWeights<B> {
    /// Copies the adapters and the head out of a model.
    pub fn extract(model: &ImageClassifier<B>) -> Self {
        let layers = model
            .backbone
            .layers
            .iter()
            .map(|layer| {
                let mut adapters = LayerAdapters::empty();
                for target in LoraTarget::ALL {
                    *adapters.slot(target) = layer.linear(target).adapter.clone();
                }
                adapters
            })
            .collect();

        Self {
            layers,
            classifier: model.classifier.clone(),
        }
    }

    /// Freshly initialized weights with the layout described by `config`.
    pub fn skeleton(config: &AdapterConfig, device: &B::Device) -> Self {
        let layers = (0..config.model.num_layers)
            .map(|_| {
                let mut adapters = LayerAdapters::empty();
                for target in config.lora.target_modules.iter() {
                    let (d_input, d_output) = config.model.target_dims(*target);
                    *adapters.slot(*target) =
                        Some(LoraAdapter::init(&config.lora, d_input, d_output, device));
                }
                adapters
            })
            .collect();

        Self {
            layers,
            classifier: LinearConfig::new(config.model.hidden_size, config.num_labels).init(device),
        }
    }

    /// Freezes `backbone` and installs the adapters and the head onto it.
    pub fn install(self, backbone: VisionTransformer<B>) -> crate::Result<ImageClassifier<B>> {
        if self.layers.len() != backbone.layers.len() {
            return Err(LoraError::LayoutMismatch(format!(
                "{} adapter layers for {} encoder layers",
                self.layers.len(),
                backbone.layers.len()
            ))
            .into());
        }
        let [hidden_size, _] = self.classifier.weight.dims();
        if hidden_size != backbone.hidden_size() {
            return Err(LoraError::LayoutMismatch(format!(
                "classification head expects {hidden_size} features, backbone produces {}",
                backbone.hidden_size()
            ))
            .into());
        }

        let mut backbone = backbone.no_grad();
        backbone.layers = backbone
            .layers
            .into_iter()
            .zip(self.layers)
            .enumerate()
            .map(|(index, (layer, mut adapters))| {
                LoraTarget::ALL.into_iter().try_fold(layer, |layer, target| {
                    match adapters.slot(target).take() {
                        Some(adapter) => layer.try_map_linear(target, |linear| {
                            let name = format!("layers.{index}.{}", target.name());
                            linear.set_adapter(&name, adapter)
                        }),
                        None => Ok(layer),
                    }
                })
            })
            .collect::<Result<_, LoraError>>()?;

        Ok(ImageClassifier {
            backbone,
            classifier: self.classifier,
        })
    }
}

/// Metadata stored next to the adapter weights.
#[derive(Debug, Clone)]
pub struct AdapterCheckpoint {
    pub config: AdapterConfig,
    pub processor: ImageProcessorConfig,
    pub labels: LabelMap,
}

impl AdapterCheckpoint {
    /// Reads the JSON files of an adapter directory and checks they agree.
    pub fn load<P: AsRef<Path>>(dir: P) -> crate::Result<Self> {
        let dir = dir.as_ref();
        let config = AdapterConfig::load(dir.join(ADAPTER_CONFIG_FILE))?;
        let processor = ImageProcessorConfig::load(dir.join(PROCESSOR_CONFIG_FILE))?;
        let labels = LabelMap::load(dir.join(LABELS_FILE))?;
        processor.validate()?;

        if labels.len() != config.num_labels {
            return Err(Error::Labels(format!(
                "adapter has {} outputs but {} labels",
                config.num_labels,
                labels.len()
            )));
        }
        if processor.size != config.model.image_size {
            return Err(Error::Model(format!(
                "processor size {} does not match model image size {}",
                processor.size, config.model.image_size
            )));
        }

        Ok(Self {
            config,
            processor,
            labels,
        })
    }
}

/// Writes the adapter directory for a fine-tuned model.
pub fn save_adapter<B: Backend, P: AsRef<Path>>(
    model: &ImageClassifier<B>,
    dir: P,
    checkpoint: &AdapterCheckpoint,
) -> crate::Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;

    checkpoint.config.save(dir.join(ADAPTER_CONFIG_FILE))?;
    checkpoint.processor.save(dir.join(PROCESSOR_CONFIG_FILE))?;
    checkpoint.labels.save(dir.join(LABELS_FILE))?;

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    AdapterWeights::extract(model).save_file(dir.join(ADAPTER_WEIGHTS_FILE), &recorder)?;

    log::info!(
        "Saved {} adapter parameters to {}",
        model.param_summary().trainable,
        dir.display()
    );

    Ok(())
}

/// Loads an adapter directory onto a foundation backbone.
pub fn load_adapter<B: Backend, P: AsRef<Path>>(
    backbone: VisionTransformer<B>,
    dir: P,
    device: &B::Device,
) -> crate::Result<(ImageClassifier<B>, AdapterCheckpoint)> {
    let dir = dir.as_ref();
    let checkpoint = AdapterCheckpoint::load(dir)?;
    if backbone.image_size != checkpoint.config.model.image_size {
        return Err(LoraError::LayoutMismatch(format!(
            "adapter was trained on {0}x{0} images, backbone expects {1}x{1}",
            checkpoint.config.model.image_size, backbone.image_size
        ))
        .into());
    }

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let weights = AdapterWeights::skeleton(&checkpoint.config, device).load_file(
        dir.join(ADAPTER_WEIGHTS_FILE),
        &recorder,
        device,
    )?;
    let model = weights.install(backbone)?;

    log::info!(
        "Loaded adapter from {} (base model `{}`)",
        dir.display(),
        checkpoint.config.base_model
    );

    Ok((model, checkpoint))
}
