use core::fmt;

use burn::module::Module;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::{Int, Tensor, backend::Backend};
use burn::train::ClassificationOutput;

use super::VisionTransformer;
use crate::lora::{LoraConfig, LoraError};

/// Backbone plus a linear classification head.
#[derive(Module, Debug)]
pub struct ImageClassifier<B: Backend> {
    pub backbone: VisionTransformer<B>,
    pub classifier: Linear<B>,
}

/// Wraps a pre-trained backbone for parameter-efficient fine-tuning.
///
/// The backbone is frozen, adapters are attached to the layers named by
/// `config.target_modules` and a fresh head with `num_labels` outputs is
/// created. The adapters and the head are the only trainable parameters.
pub fn apply_lora<B: Backend>(
    backbone: VisionTransformer<B>,
    config: &LoraConfig,
    num_labels: usize,
    device: &B::Device,
) -> Result<ImageClassifier<B>, LoraError> {
    config.validate()?;
    if num_labels == 0 {
        return Err(LoraError::InvalidConfig(
            "classification head needs at least one label".into(),
        ));
    }

    let hidden_size = backbone.hidden_size();
    Ok(ImageClassifier {
        backbone: backbone.with_lora(config, device),
        classifier: LinearConfig::new(hidden_size, num_labels).init(device),
    })
}

impl<B: Backend> ImageClassifier<B> {
    pub fn num_labels(&self) -> usize {
        self.classifier.weight.dims()[1]
    }

    /// Logits, `[batch, num_labels]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(images);
        self.classifier.forward(features)
    }

    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }

    /// Folds the adapters into the backbone weights for inference.
    pub fn merge(self) -> Self {
        Self {
            backbone: self.backbone.merge(),
            classifier: self.classifier,
        }
    }

    /// Trainable and total parameter counts.
    pub fn param_summary(&self) -> ParamSummary {
        let head = self.classifier.weight.shape().num_elements()
            + self
                .classifier
                .bias
                .as_ref()
                .map_or(0, |bias| bias.shape().num_elements());

        ParamSummary {
            trainable: self.backbone.adapter_params() + head,
            total: self.num_params(),
        }
    }
}

/// Parameter counts of an adapted model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSummary {
    pub trainable: usize,
    pub total: usize,
}

impl ParamSummary {
    pub fn trainable_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        100.0 * self.trainable as f64 / self.total as f64
    }
}

impl fmt::Display for ParamSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            self.trainable,
            self.total,
            self.trainable_percent()
        )
    }
}
