use burn::module::{Module, Param};
use burn::nn::{Dropout, DropoutConfig, Initializer};
use burn::tensor::{Tensor, backend::Backend};

use super::{LoraConfig, LoraInit};

/// Trainable low-rank factors attached to one linear layer.
#[derive(Module, Debug)]
pub struct LoraAdapter<B: Backend> {
    /// Down-projection `[d_input, rank]`.
    pub lora_a: Param<Tensor<B, 2>>,
    /// Up-projection `[rank, d_output]`.
    pub lora_b: Param<Tensor<B, 2>>,
    pub dropout: Dropout,
    pub scaling: f64,
}

impl<B: Backend> LoraAdapter<B> {
    /// Creates an adapter for a layer mapping `d_input` to `d_output` features.
    pub fn init(
        config: &LoraConfig,
        d_input: usize,
        d_output: usize,
        device: &B::Device,
    ) -> Self {
        let lora_a = match config.init {
            // Same bound as the default linear initialization: 1 / sqrt(fan_in).
            LoraInit::Kaiming => Initializer::KaimingUniform {
                gain: 1.0 / 3.0f64.sqrt(),
                fan_out_only: false,
            }
            .init_with([d_input, config.rank], Some(d_input), None, device),
            LoraInit::Gaussian => Initializer::Normal {
                mean: 0.0,
                std: 1.0 / config.rank as f64,
            }
            .init([d_input, config.rank], device),
        };
        let lora_b = Initializer::Zeros.init([config.rank, d_output], device);

        Self {
            lora_a,
            lora_b,
            dropout: DropoutConfig::new(config.dropout).init(),
            scaling: config.scaling(),
        }
    }

    pub fn rank(&self) -> usize {
        self.lora_a.dims()[1]
    }

    pub fn d_input(&self) -> usize {
        self.lora_a.dims()[0]
    }

    pub fn d_output(&self) -> usize {
        self.lora_b.dims()[1]
    }

    /// Number of trainable scalars in both factors.
    pub fn num_elements(&self) -> usize {
        self.lora_a.shape().num_elements() + self.lora_b.shape().num_elements()
    }

    /// Adapter contribution for an input of any rank `[..., d_input]`.
    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        let x = self.dropout.forward(input);
        let x = x.matmul(self.lora_a.val().unsqueeze());
        let x = x.matmul(self.lora_b.val().unsqueeze());

        x * self.scaling
    }

    /// Full-rank weight update `A @ B * scaling` with shape `[d_input, d_output]`.
    pub fn delta(&self) -> Tensor<B, 2> {
        self.lora_a.val().matmul(self.lora_b.val()) * self.scaling
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn starts_with_zero_delta() {
        let device = Default::default();
        let config = LoraConfig::new().with_rank(4);
        let adapter = LoraAdapter::<TestBackend>::init(&config, 12, 6, &device);

        assert_eq!(adapter.rank(), 4);
        assert_eq!(adapter.d_input(), 12);
        assert_eq!(adapter.d_output(), 6);
        assert_eq!(adapter.num_elements(), 12 * 4 + 4 * 6);

        let delta = adapter.delta().into_data().to_vec::<f32>().unwrap();
        assert!(delta.iter().all(|value| *value == 0.0));
    }

    #[test]
    fn gaussian_init_is_not_constant() {
        let device = Default::default();
        let config = LoraConfig::new()
            .with_rank(8)
            .with_init(LoraInit::Gaussian);
        let adapter = LoraAdapter::<TestBackend>::init(&config, 16, 16, &device);

        let values = adapter.lora_a.val().into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().any(|value| *value != values[0]));
    }

    #[test]
    fn forward_matches_delta_product() {
        let device = Default::default();
        let config = LoraConfig::new().with_rank(2).with_alpha(4.0).with_dropout(0.0);
        let mut adapter = LoraAdapter::<TestBackend>::init(&config, 3, 2, &device);
        adapter.lora_a = Param::from_tensor(Tensor::from_floats(
            [[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]],
            &device,
        ));
        adapter.lora_b = Param::from_tensor(Tensor::from_floats([[1.0, 2.0], [3.0, 4.0]], &device));

        let input = Tensor::<TestBackend, 2>::from_floats([[1.0, 2.0, 3.0]], &device);
        let output = adapter.forward(input.clone()).into_data().to_vec::<f32>().unwrap();
        let expected = input
            .matmul(adapter.delta())
            .into_data()
            .to_vec::<f32>()
            .unwrap();

        // x @ A = [4, 5]; @ B = [19, 28]; * (4 / 2)
        assert_eq!(output, vec![38.0, 56.0]);
        assert_eq!(output, expected);
    }
}
