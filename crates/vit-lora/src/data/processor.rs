use std::path::Path;

use burn::config::Config;
use burn::tensor::{Tensor, TensorData, backend::Backend};
use image::RgbImage;
use image::imageops::{self, FilterType};
use rand::Rng;

use crate::error::Error;

/// Image preprocessing parameters, saved next to the adapter weights.
#[derive(Config, Debug, PartialEq)]
pub struct ImageProcessorConfig {
    /// Output height and width.
    #[config(default = 224)]
    pub size: usize,
    #[config(default = "[0.5, 0.5, 0.5]")]
    pub image_mean: [f32; 3],
    #[config(default = "[0.5, 0.5, 0.5]")]
    pub image_std: [f32; 3],
    #[config(default = "1.0 / 255.0")]
    pub rescale_factor: f32,
    /// Area fraction range of the random crop used for training.
    #[config(default = "(0.08, 1.0)")]
    pub crop_scale: (f64, f64),
    /// Aspect ratio range of the random crop used for training.
    #[config(default = "(3.0 / 4.0, 4.0 / 3.0)")]
    pub crop_ratio: (f64, f64),
    /// Horizontal flip probability used for training.
    #[config(default = 0.5)]
    pub flip_probability: f64,
}

/// Turns decoded images into normalized channel-first pixels.
#[derive(Clone, Debug)]
pub struct ImageProcessor {
    config: ImageProcessorConfig,
}

impl ImageProcessorConfig {
    pub fn init(&self) -> ImageProcessor {
        ImageProcessor {
            config: self.clone(),
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.size == 0 {
            return Err(Error::Processor("output size must be positive".into()));
        }
        let (scale_min, scale_max) = self.crop_scale;
        if !(scale_min > 0.0 && scale_min <= scale_max && scale_max <= 1.0) {
            return Err(Error::Processor(format!(
                "crop scale ({scale_min}, {scale_max}) must be an ordered range within (0, 1]"
            )));
        }
        let (ratio_min, ratio_max) = self.crop_ratio;
        if !(ratio_min > 0.0 && ratio_min <= ratio_max && ratio_max.is_finite()) {
            return Err(Error::Processor(format!(
                "crop ratio ({ratio_min}, {ratio_max}) must be an ordered positive range"
            )));
        }
        if self.image_std.iter().any(|std| *std == 0.0 || !std.is_finite()) {
            return Err(Error::Processor(format!(
                "image std {:?} must be finite and non-zero",
                self.image_std
            )));
        }
        if !(0.0..=1.0).contains(&self.flip_probability) {
            return Err(Error::Processor(format!(
                "flip probability {} must be within [0, 1]",
                self.flip_probability
            )));
        }
        Ok(())
    }
}

impl ImageProcessor {
    pub fn config(&self) -> &ImageProcessorConfig {
        &self.config
    }

    pub fn size(&self) -> usize {
        self.config.size
    }

    /// Number of `f32` values produced per image.
    pub fn num_values(&self) -> usize {
        3 * self.config.size * self.config.size
    }

    pub fn open<P: AsRef<Path>>(&self, path: P) -> crate::Result<RgbImage> {
        Ok(image::open(path)?.to_rgb8())
    }

    /// Random resized crop, random horizontal flip, rescale and normalize.
    pub fn preprocess_train<R: Rng + ?Sized>(&self, image: &RgbImage, rng: &mut R) -> Vec<f32> {
        let size = self.config.size as u32;
        let (x, y, width, height) = self.random_crop_window(image.width(), image.height(), rng);
        let crop = imageops::crop_imm(image, x, y, width, height).to_image();
        let mut resized = imageops::resize(&crop, size, size, FilterType::Triangle);

        if rng.random_bool(self.config.flip_probability.clamp(0.0, 1.0)) {
            imageops::flip_horizontal_in_place(&mut resized);
        }

        self.normalize(&resized)
    }

    /// Resize of the shorter side, center crop, rescale and normalize.
    pub fn preprocess_eval(&self, image: &RgbImage) -> Vec<f32> {
        let size = self.config.size as u32;
        let (width, height) = image.dimensions();
        let (resized_width, resized_height) = if width <= height {
            let scaled = (height as f64 * size as f64 / width as f64).round() as u32;
            (size, scaled.max(size))
        } else {
            let scaled = (width as f64 * size as f64 / height as f64).round() as u32;
            (scaled.max(size), size)
        };

        let resized = imageops::resize(image, resized_width, resized_height, FilterType::Triangle);
        let x = (resized_width - size) / 2;
        let y = (resized_height - size) / 2;
        let crop = imageops::crop_imm(&resized, x, y, size, size).to_image();

        self.normalize(&crop)
    }

    /// Stacks preprocessed images into `[batch, 3, size, size]`.
    pub fn to_tensor<B: Backend>(&self, pixels: Vec<f32>, device: &B::Device) -> Tensor<B, 4> {
        let size = self.config.size;
        let batch = pixels.len() / self.num_values();
        let data = TensorData::new(pixels, [batch, 3, size, size]);

        Tensor::from_data(data.convert::<B::FloatElem>(), device)
    }

    /// Channel-first `(pixel * rescale - mean) / std`.
    fn normalize(&self, image: &RgbImage) -> Vec<f32> {
        let (width, height) = image.dimensions();
        let plane = (width * height) as usize;
        let mut values = vec![0.0; 3 * plane];

        for (index, pixel) in image.pixels().enumerate() {
            for channel in 0..3 {
                let value = pixel[channel] as f32 * self.config.rescale_factor;
                values[channel * plane + index] =
                    (value - self.config.image_mean[channel]) / self.config.image_std[channel];
            }
        }

        values
    }

    /// Picks a crop window covering a random area and aspect ratio.
    ///
    /// Falls back to the largest centered square after ten rejected samples.
    fn random_crop_window<R: Rng + ?Sized>(
        &self,
        width: u32,
        height: u32,
        rng: &mut R,
    ) -> (u32, u32, u32, u32) {
        let area = (width * height) as f64;
        let (scale_min, scale_max) = self.config.crop_scale;
        let (ratio_min, ratio_max) = self.config.crop_ratio;
        let (log_min, log_max) = (ratio_min.ln(), ratio_max.ln());

        for _ in 0..10 {
            let target_area = area * rng.random_range(scale_min..=scale_max);
            let aspect = rng.random_range(log_min..=log_max).exp();

            let crop_width = (target_area * aspect).sqrt().round() as u32;
            let crop_height = (target_area / aspect).sqrt().round() as u32;

            if crop_width > 0 && crop_width <= width && crop_height > 0 && crop_height <= height {
                let x = rng.random_range(0..=width - crop_width);
                let y = rng.random_range(0..=height - crop_height);
                return (x, y, crop_width, crop_height);
            }
        }

        let side = width.min(height);
        ((width - side) / 2, (height - side) / 2, side, side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    type TestBackend = NdArray<f32>;

    fn processor(size: usize) -> ImageProcessor {
        ImageProcessorConfig::new().with_size(size).init()
    }

    #[test]
    fn eval_output_is_normalized_and_sized() {
        let processor = processor(8);
        let image = RgbImage::from_pixel(20, 12, image::Rgb([255, 0, 128]));

        let values = processor.preprocess_eval(&image);

        assert_eq!(values.len(), processor.num_values());
        // Red plane is 1.0, green plane is -1.0 with mean = std = 0.5.
        assert!(values[..64].iter().all(|value| (*value - 1.0).abs() < 1e-6));
        assert!(values[64..128].iter().all(|value| (*value + 1.0).abs() < 1e-6));
    }

    #[test]
    fn eval_center_crops_the_long_side() {
        let processor = processor(4);
        // Left half black, right half white: the center crop sees both.
        let image = RgbImage::from_fn(8, 4, |x, _| {
            if x < 4 {
                image::Rgb([0, 0, 0])
            } else {
                image::Rgb([255, 255, 255])
            }
        });

        let values = processor.preprocess_eval(&image);

        assert!(values[0] < 0.0);
        assert!(values[3] > 0.0);
    }

    #[test]
    fn train_output_is_sized_for_any_input() {
        let processor = processor(16);
        let mut rng = StdRng::seed_from_u64(7);

        for (width, height) in [(16, 16), (40, 9), (3, 50)] {
            let image = RgbImage::new(width, height);
            let values = processor.preprocess_train(&image, &mut rng);
            assert_eq!(values.len(), processor.num_values());
        }
    }

    #[test]
    fn crop_window_stays_inside_the_image() {
        let processor = processor(16);
        let mut rng = StdRng::seed_from_u64(3);

        for _ in 0..100 {
            let (x, y, width, height) = processor.random_crop_window(30, 20, &mut rng);
            assert!(width > 0 && height > 0);
            assert!(x + width <= 30);
            assert!(y + height <= 20);
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(ImageProcessorConfig::new().validate().is_ok());
        assert!(ImageProcessorConfig::new().with_crop_scale((1.0, 1.0)).validate().is_ok());
    }

    #[test]
    fn rejects_invalid_config() {
        let invalid = [
            ImageProcessorConfig::new().with_size(0),
            ImageProcessorConfig::new().with_crop_scale((0.9, 0.1)),
            ImageProcessorConfig::new().with_crop_scale((0.0, 1.0)),
            ImageProcessorConfig::new().with_crop_scale((0.5, 1.5)),
            ImageProcessorConfig::new().with_crop_ratio((0.0, 1.0)),
            ImageProcessorConfig::new().with_crop_ratio((-1.0, 1.0)),
            ImageProcessorConfig::new().with_crop_ratio((2.0, 0.5)),
            ImageProcessorConfig::new().with_image_std([0.5, 0.0, 0.5]),
            ImageProcessorConfig::new().with_flip_probability(1.5),
        ];

        for config in invalid {
            assert!(
                matches!(config.validate(), Err(Error::Processor(_))),
                "{config:?}"
            );
        }
    }

    #[test]
    fn to_tensor_stacks_images() {
        let device = Default::default();
        let processor = processor(4);
        let pixels = vec![0.0; 2 * processor.num_values()];

        let images = processor.to_tensor::<TestBackend>(pixels, &device);

        assert_eq!(images.dims(), [2, 3, 4, 4]);
    }
}
