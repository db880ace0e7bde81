use burn::module::Module;
use burn::nn::Linear;
use burn::tensor::{Tensor, backend::Backend};

use super::{LoraAdapter, LoraConfig, LoraError};

/// A linear layer with an optional low-rank adapter.
///
/// Without an adapter it behaves exactly like the wrapped [`Linear`], which is
/// how the foundation model is loaded.
#[derive(Module, Debug)]
pub struct LoraLinear<B: Backend> {
    pub base: Linear<B>,
    pub adapter: Option<LoraAdapter<B>>,
}

impl<B: Backend> From<Linear<B>> for LoraLinear<B> {
    fn from(base: Linear<B>) -> Self {
        Self {
            base,
            adapter: None,
        }
    }
}

impl<B: Backend> LoraLinear<B> {
    /// Returns `(d_input, d_output)` of the base layer.
    pub fn dims(&self) -> (usize, usize) {
        let [d_input, d_output] = self.base.weight.dims();
        (d_input, d_output)
    }

    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        match &self.adapter {
            Some(adapter) => self.base.forward(input.clone()) + adapter.forward(input),
            None => self.base.forward(input),
        }
    }

    /// Freezes the base layer and attaches a freshly initialized adapter.
    pub fn attach(self, config: &LoraConfig, device: &B::Device) -> Self {
        let (d_input, d_output) = self.dims();

        Self {
            base: self.base.no_grad(),
            adapter: Some(LoraAdapter::init(config, d_input, d_output, device)),
        }
    }

    /// Freezes the base layer and the adapter, if any.
    pub fn freeze(self) -> Self {
        self.no_grad()
    }

    /// Installs a previously trained adapter after checking its dimensions.
    pub fn set_adapter(self, layer: &str, adapter: LoraAdapter<B>) -> Result<Self, LoraError> {
        let (d_input, d_output) = self.dims();
        let [a_rows, a_cols] = adapter.lora_a.dims();
        let [b_rows, b_cols] = adapter.lora_b.dims();

        if a_rows != d_input || b_cols != d_output || a_cols != b_rows {
            return Err(LoraError::ShapeMismatch {
                layer: layer.to_string(),
                d_input,
                d_output,
                a_rows,
                a_cols,
                b_rows,
                b_cols,
            });
        }

        Ok(Self {
            base: self.base.no_grad(),
            adapter: Some(adapter),
        })
    }

    /// Folds the adapter into the base weight and drops it.
    pub fn merge(self) -> Self {
        let Some(adapter) = self.adapter else {
            return self;
        };
        let delta = adapter.delta();
        let weight = self.base.weight.map(|weight| weight + delta);

        Self {
            base: Linear {
                weight,
                bias: self.base.bias,
            },
            adapter: None,
        }
    }

    /// Number of scalars in the adapter factors.
    pub fn adapter_params(&self) -> usize {
        self.adapter
            .as_ref()
            .map_or(0, |adapter| adapter.num_elements())
    }

    /// Number of scalars in the frozen base layer.
    pub fn base_params(&self) -> usize {
        self.base.weight.shape().num_elements()
            + self
                .base
                .bias
                .as_ref()
                .map_or(0, |bias| bias.shape().num_elements())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::module::Param;
    use burn::nn::LinearConfig;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn to_vec<const D: usize>(tensor: Tensor<TestBackend, D>) -> Vec<f32> {
        tensor.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn fresh_adapter_keeps_base_output() {
        let device = Default::default();
        let layer: LoraLinear<TestBackend> = LinearConfig::new(8, 4).init(&device).into();
        let input = Tensor::<TestBackend, 3>::ones([2, 3, 8], &device);

        let before = to_vec(layer.forward(input.clone()));
        let layer = layer.attach(&LoraConfig::new().with_rank(2).with_dropout(0.0), &device);
        let after = to_vec(layer.forward(input));

        assert_eq!(before, after);
        assert_eq!(layer.adapter_params(), 8 * 2 + 2 * 4);
        assert_eq!(layer.base_params(), 8 * 4 + 4);
    }

    #[test]
    fn merge_matches_adapted_forward() {
        let device = Default::default();
        let layer: LoraLinear<TestBackend> = LinearConfig::new(3, 2).init(&device).into();
        let mut layer = layer.attach(&LoraConfig::new().with_rank(1).with_dropout(0.0), &device);
        if let Some(adapter) = layer.adapter.as_mut() {
            adapter.lora_b = Param::from_tensor(Tensor::from_floats([[0.5, -1.0]], &device));
        }
        let input = Tensor::<TestBackend, 2>::from_floats([[1.0, -2.0, 0.5]], &device);

        let adapted = to_vec(layer.forward(input.clone()));
        let merged = layer.merge();
        assert!(merged.adapter.is_none());
        let folded = to_vec(merged.forward(input));

        for (a, b) in adapted.iter().zip(folded.iter()) {
            assert!((a - b).abs() < 1e-5, "{a} != {b}");
        }
    }

    #[test]
    fn rejects_adapter_with_wrong_dims() {
        let device = Default::default();
        let layer: LoraLinear<TestBackend> = LinearConfig::new(6, 6).init(&device).into();
        let adapter = LoraAdapter::init(&LoraConfig::new().with_rank(2), 4, 6, &device);

        let err = layer.set_adapter("layers.0.query", adapter).unwrap_err();
        assert!(matches!(err, LoraError::ShapeMismatch { d_input: 6, a_rows: 4, .. }));
    }

    #[test]
    fn only_adapter_receives_gradients() {
        let device = Default::default();
        let layer: LoraLinear<TestAutodiffBackend> = LinearConfig::new(4, 3).init(&device).into();
        let layer = layer.attach(&LoraConfig::new().with_rank(2).with_dropout(0.0), &device);
        let input = Tensor::<TestAutodiffBackend, 2>::ones([5, 4], &device);

        let grads = layer.forward(input).sum().backward();
        let adapter = layer.adapter.as_ref().unwrap();

        assert!(layer.base.weight.grad(&grads).is_none());
        assert!(adapter.lora_b.grad(&grads).is_some());
    }
}
