use std::path::Path;

use burn::prelude::*;
use burn::tensor::activation::softmax;
use image::RgbImage;

use crate::base::load_base_model;
use crate::checkpoint::{AdapterCheckpoint, load_adapter};
use crate::data::ImageProcessor;
use crate::error::{Error, Result};
use crate::labels::LabelMap;
use crate::model::ImageClassifier;

/// The most likely class of an image.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    pub label_id: usize,
    /// Softmax probability of `label`.
    pub score: f32,
    /// `(label, probability)` pairs in decreasing order of probability.
    pub top_k: Vec<(String, f32)>,
}

/// Classifies images with a fine-tuned model.
pub struct Predictor<B: Backend> {
    model: ImageClassifier<B>,
    processor: ImageProcessor,
    labels: LabelMap,
    device: B::Device,
    top_k: usize,
}

impl<B: Backend> Predictor<B> {
    pub fn new(
        model: ImageClassifier<B>,
        processor: ImageProcessor,
        labels: LabelMap,
        device: B::Device,
    ) -> Result<Self> {
        if model.num_labels() != labels.len() {
            return Err(Error::Labels(format!(
                "model has {} outputs but {} labels",
                model.num_labels(),
                labels.len()
            )));
        }

        Ok(Self {
            model,
            processor,
            labels,
            device,
            top_k: 5,
        })
    }

    /// Loads the foundation model named in the adapter config, then the adapter.
    ///
    /// With `merge`, adapters are folded into the base weights so inference
    /// runs at the cost of the plain backbone.
    pub fn from_adapter<P: AsRef<Path>>(
        base_model: Option<&str>,
        adapter_dir: P,
        merge: bool,
        device: &B::Device,
    ) -> Result<Self> {
        let adapter_dir = adapter_dir.as_ref();
        let base_model = match base_model {
            Some(id) => id.to_string(),
            None => AdapterCheckpoint::load(adapter_dir)?
                .config
                .base_model,
        };
        let base = load_base_model::<B>(&base_model, device)?;
        let (model, checkpoint) = load_adapter(base.backbone, adapter_dir, device)?;
        let model = if merge { model.merge() } else { model };

        Self::new(
            model,
            checkpoint.processor.init(),
            checkpoint.labels,
            device.clone(),
        )
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }

    pub fn predict<P: AsRef<Path>>(&self, path: P) -> Result<Prediction> {
        let image = self.processor.open(path)?;
        self.predict_image(&image)
    }

    pub fn predict_image(&self, image: &RgbImage) -> Result<Prediction> {
        let mut predictions = self.predict_batch(core::slice::from_ref(image))?;
        predictions
            .pop()
            .ok_or_else(|| Error::Data("empty prediction batch".into()))
    }

    /// Classifies several images in a single forward pass.
    pub fn predict_batch(&self, images: &[RgbImage]) -> Result<Vec<Prediction>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }

        let pixels: Vec<f32> = images
            .iter()
            .flat_map(|image| self.processor.preprocess_eval(image))
            .collect();
        let input = self.processor.to_tensor::<B>(pixels, &self.device);
        let probabilities = softmax(self.model.forward(input), 1)
            .into_data()
            .to_vec::<f32>()
            .map_err(|err| Error::Data(format!("{err:?}")))?;

        probabilities
            .chunks(self.labels.len())
            .map(|row| self.rank(row))
            .collect()
    }

    fn rank(&self, probabilities: &[f32]) -> Result<Prediction> {
        let mut ranked: Vec<(usize, f32)> = probabilities.iter().copied().enumerate().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        let name = |id: usize| {
            self.labels
                .name(id)
                .map(str::to_string)
                .ok_or_else(|| Error::Labels(format!("no label for id {id}")))
        };

        let (label_id, score) = ranked[0];
        let top_k = ranked
            .iter()
            .take(self.top_k)
            .map(|(id, probability)| Ok((name(*id)?, *probability)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Prediction {
            label: name(label_id)?,
            label_id,
            score,
            top_k,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ImageProcessorConfig;
    use crate::lora::LoraConfig;
    use crate::model::{VitConfig, apply_lora};
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn predictor(num_labels: usize) -> Predictor<TestBackend> {
        let device = Default::default();
        let model = apply_lora(
            VitConfig::vit_tiny().init::<TestBackend>(&device),
            &LoraConfig::new().with_rank(2),
            num_labels,
            &device,
        )
        .unwrap();
        let names: Vec<String> = (0..num_labels).map(|id| format!("class_{id}")).collect();

        Predictor::new(
            model,
            ImageProcessorConfig::new().with_size(32).init(),
            LabelMap::from_names(&names).unwrap(),
            device,
        )
        .unwrap()
    }

    #[test]
    fn probabilities_are_ranked_and_sum_to_one() {
        let predictor = predictor(4).with_top_k(10);
        let image = RgbImage::from_pixel(48, 40, image::Rgb([10, 200, 30]));

        let prediction = predictor.predict_image(&image).unwrap();

        assert_eq!(prediction.top_k.len(), 4);
        assert_eq!(prediction.top_k[0].0, prediction.label);
        assert_eq!(prediction.top_k[0].1, prediction.score);
        assert!(prediction.top_k.windows(2).all(|pair| pair[0].1 >= pair[1].1));
        let total: f32 = prediction.top_k.iter().map(|(_, p)| p).sum();
        assert!((total - 1.0).abs() < 1e-4);
    }

    #[test]
    fn batch_predictions_match_single_predictions() {
        let predictor = predictor(3);
        let images = vec![
            RgbImage::from_pixel(32, 32, image::Rgb([0, 0, 0])),
            RgbImage::from_pixel(32, 32, image::Rgb([255, 255, 255])),
        ];

        let batch = predictor.predict_batch(&images).unwrap();
        let single = predictor.predict_image(&images[1]).unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].label, single.label);
        assert!((batch[1].score - single.score).abs() < 1e-5);
    }

    #[test]
    fn rejects_label_count_mismatch() {
        let device = Default::default();
        let model = apply_lora(
            VitConfig::vit_tiny().init::<TestBackend>(&device),
            &LoraConfig::new(),
            3,
            &device,
        )
        .unwrap();

        let result = Predictor::new(
            model,
            ImageProcessorConfig::new().with_size(32).init(),
            LabelMap::from_names(&["a", "b"]).unwrap(),
            device,
        );
        assert!(result.is_err());
    }
}
