use core::convert::Infallible;

use burn::module::{Module, Param};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{
    Dropout, DropoutConfig, Gelu, Initializer, LayerNorm, LayerNormConfig, LinearConfig,
};
use burn::tensor::{Tensor, activation::softmax, backend::Backend};

use super::VitConfig;
use crate::lora::{LoraConfig, LoraLinear, LoraTarget};

/// Splits images into non-overlapping patches and projects each one.
#[derive(Module, Debug)]
pub struct PatchEmbedding<B: Backend> {
    pub projection: Conv2d<B>,
}

impl<B: Backend> PatchEmbedding<B> {
    /// `[batch, channels, height, width]` to `[batch, num_patches, hidden]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 3> {
        let x = self.projection.forward(images);
        x.flatten::<3>(2, 3).swap_dims(1, 2)
    }
}

/// Multi-head self-attention whose projections can carry adapters.
#[derive(Module, Debug)]
pub struct SelfAttention<B: Backend> {
    pub query: LoraLinear<B>,
    pub key: LoraLinear<B>,
    pub value: LoraLinear<B>,
    pub output: LoraLinear<B>,
    pub attention_dropout: Dropout,
    pub output_dropout: Dropout,
    pub n_heads: usize,
    pub d_head: usize,
    pub scale: f64,
}

impl<B: Backend> SelfAttention<B> {
    pub fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, seq_length, d_model] = input.dims();

        let heads = |x: Tensor<B, 3>| {
            x.reshape([batch, seq_length, self.n_heads, self.d_head])
                .swap_dims(1, 2)
        };
        let q = heads(self.query.forward(input.clone()));
        let k = heads(self.key.forward(input.clone()));
        let v = heads(self.value.forward(input));

        let scores = q.matmul(k.transpose()) * self.scale;
        let weights = softmax(scores, 3);
        let weights = self.attention_dropout.forward(weights);

        let context = weights
            .matmul(v)
            .swap_dims(1, 2)
            .reshape([batch, seq_length, d_model]);

        self.output_dropout.forward(self.output.forward(context))
    }
}

/// Position-wise feed-forward block.
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    pub intermediate: LoraLinear<B>,
    pub output: LoraLinear<B>,
    pub activation: Gelu,
    pub dropout: Dropout,
}

impl<B: Backend> Mlp<B> {
    pub fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = self.intermediate.forward(input);
        let x = self.activation.forward(x);
        let x = self.output.forward(x);
        self.dropout.forward(x)
    }
}

/// Pre-norm transformer encoder layer.
#[derive(Module, Debug)]
pub struct EncoderLayer<B: Backend> {
    pub norm1: LayerNorm<B>,
    pub attention: SelfAttention<B>,
    pub norm2: LayerNorm<B>,
    pub mlp: Mlp<B>,
}

impl<B: Backend> EncoderLayer<B> {
    pub fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = input.clone() + self.attention.forward(self.norm1.forward(input));
        x.clone() + self.mlp.forward(self.norm2.forward(x))
    }

    pub fn linear(&self, target: LoraTarget) -> &LoraLinear<B> {
        match target {
            LoraTarget::Query => &self.attention.query,
            LoraTarget::Key => &self.attention.key,
            LoraTarget::Value => &self.attention.value,
            LoraTarget::AttentionOutput => &self.attention.output,
            LoraTarget::Intermediate => &self.mlp.intermediate,
            LoraTarget::Output => &self.mlp.output,
        }
    }

    /// Replaces the layer a target refers to using `f`.
    pub fn map_linear(
        self,
        target: LoraTarget,
        f: impl FnOnce(LoraLinear<B>) -> LoraLinear<B>,
    ) -> Self {
        let Ok(layer) = self.try_map_linear::<Infallible>(target, |linear| Ok(f(linear)));
        layer
    }

    /// Fallible version of [map_linear](Self::map_linear).
    pub fn try_map_linear<E>(
        mut self,
        target: LoraTarget,
        f: impl FnOnce(LoraLinear<B>) -> Result<LoraLinear<B>, E>,
    ) -> Result<Self, E> {
        match target {
            LoraTarget::Query => self.attention.query = f(self.attention.query)?,
            LoraTarget::Key => self.attention.key = f(self.attention.key)?,
            LoraTarget::Value => self.attention.value = f(self.attention.value)?,
            LoraTarget::AttentionOutput => self.attention.output = f(self.attention.output)?,
            LoraTarget::Intermediate => self.mlp.intermediate = f(self.mlp.intermediate)?,
            LoraTarget::Output => self.mlp.output = f(self.mlp.output)?,
        }
        Ok(self)
    }
}

/// Vision Transformer backbone producing class-token features.
#[derive(Module, Debug)]
pub struct VisionTransformer<B: Backend> {
    pub patch_embedding: PatchEmbedding<B>,
    /// `[1, 1, hidden]`
    pub cls_token: Param<Tensor<B, 3>>,
    /// `[1, seq_length, hidden]`
    pub position_embeddings: Param<Tensor<B, 3>>,
    pub layers: Vec<EncoderLayer<B>>,
    pub norm: LayerNorm<B>,
    pub dropout: Dropout,
    pub image_size: usize,
}

impl VitConfig {
    /// Initializes a backbone with random weights.
    pub fn init<B: Backend>(&self, device: &B::Device) -> VisionTransformer<B> {
        assert_eq!(
            self.image_size % self.patch_size,
            0,
            "Image size must be divisible by the patch size"
        );
        assert_eq!(
            self.hidden_size % self.num_heads,
            0,
            "Hidden size must be divisible by the number of heads"
        );

        let embedding_init = Initializer::Normal {
            mean: 0.0,
            std: 0.02,
        };
        let linear = |d_input, d_output| -> LoraLinear<B> {
            LinearConfig::new(d_input, d_output).init(device).into()
        };
        let norm = || {
            LayerNormConfig::new(self.hidden_size)
                .with_epsilon(self.layer_norm_eps)
                .init(device)
        };

        let layers = (0..self.num_layers)
            .map(|_| EncoderLayer {
                norm1: norm(),
                attention: SelfAttention {
                    query: linear(self.hidden_size, self.hidden_size),
                    key: linear(self.hidden_size, self.hidden_size),
                    value: linear(self.hidden_size, self.hidden_size),
                    output: linear(self.hidden_size, self.hidden_size),
                    attention_dropout: DropoutConfig::new(self.attention_dropout).init(),
                    output_dropout: DropoutConfig::new(self.hidden_dropout).init(),
                    n_heads: self.num_heads,
                    d_head: self.head_dim(),
                    scale: (self.head_dim() as f64).sqrt().recip(),
                },
                norm2: norm(),
                mlp: Mlp {
                    intermediate: linear(self.hidden_size, self.intermediate_size),
                    output: linear(self.intermediate_size, self.hidden_size),
                    activation: Gelu::new(),
                    dropout: DropoutConfig::new(self.hidden_dropout).init(),
                },
            })
            .collect();

        VisionTransformer {
            patch_embedding: PatchEmbedding {
                projection: Conv2dConfig::new(
                    [self.num_channels, self.hidden_size],
                    [self.patch_size, self.patch_size],
                )
                .with_stride([self.patch_size, self.patch_size])
                .init(device),
            },
            cls_token: embedding_init.init([1, 1, self.hidden_size], device),
            position_embeddings: embedding_init
                .init([1, self.seq_length(), self.hidden_size], device),
            layers,
            norm: norm(),
            dropout: DropoutConfig::new(self.hidden_dropout).init(),
            image_size: self.image_size,
        }
    }
}

impl<B: Backend> VisionTransformer<B> {
    pub fn hidden_size(&self) -> usize {
        self.cls_token.dims()[2]
    }

    /// Encoder output for every token, `[batch, seq_length, hidden]`.
    pub fn forward_hidden(&self, images: Tensor<B, 4>) -> Tensor<B, 3> {
        let [batch, _, height, width] = images.dims();
        assert!(
            height == self.image_size && width == self.image_size,
            "Expected {size}x{size} images, got {height}x{width}",
            size = self.image_size
        );

        let patches = self.patch_embedding.forward(images);
        let cls = self.cls_token.val().repeat_dim(0, batch);
        let x = Tensor::cat(vec![cls, patches], 1) + self.position_embeddings.val();
        let mut x = self.dropout.forward(x);

        for layer in self.layers.iter() {
            x = layer.forward(x);
        }

        self.norm.forward(x)
    }

    /// Class-token features, `[batch, hidden]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let hidden = self.forward_hidden(images);
        let [batch, _, hidden_size] = hidden.dims();

        hidden
            .slice([0..batch, 0..1, 0..hidden_size])
            .reshape([batch, hidden_size])
    }

    /// Freezes every weight and attaches adapters to the targeted layers.
    pub fn with_lora(self, config: &LoraConfig, device: &B::Device) -> Self {
        let mut backbone = self.no_grad();
        backbone.layers = backbone
            .layers
            .into_iter()
            .map(|layer| {
                config
                    .target_modules
                    .iter()
                    .fold(layer, |layer, target| {
                        layer.map_linear(*target, |linear| linear.attach(config, device))
                    })
            })
            .collect();

        backbone
    }

    /// Folds every adapter into its base weight.
    pub fn merge(mut self) -> Self {
        self.layers = self
            .layers
            .into_iter()
            .map(|layer| {
                LoraTarget::ALL
                    .into_iter()
                    .fold(layer, |layer, target| layer.map_linear(target, LoraLinear::merge))
            })
            .collect();

        self
    }

    /// Number of adapter scalars across all layers.
    pub fn adapter_params(&self) -> usize {
        self.layers
            .iter()
            .flat_map(|layer| LoraTarget::ALL.map(|target| layer.linear(target).adapter_params()))
            .sum()
    }

    /// Number of adapters currently attached.
    pub fn num_adapters(&self) -> usize {
        self.layers
            .iter()
            .flat_map(|layer| LoraTarget::ALL.map(|target| layer.linear(target).adapter.is_some()))
            .filter(|attached| *attached)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn forward_shapes() {
        let device = Default::default();
        let config = VitConfig::vit_tiny();
        let model = config.init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);

        let hidden = model.forward_hidden(images.clone());
        assert_eq!(hidden.dims(), [2, config.seq_length(), 32]);

        let features = model.forward(images);
        assert_eq!(features.dims(), [2, 32]);
    }

    #[test]
    fn attaches_only_targeted_layers() {
        let device = Default::default();
        let config = VitConfig::vit_tiny();
        let lora = LoraConfig::new().with_rank(2);
        let model = config.init::<TestBackend>(&device).with_lora(&lora, &device);

        assert_eq!(model.num_adapters(), 2 * config.num_layers);
        for layer in model.layers.iter() {
            assert!(layer.attention.query.adapter.is_some());
            assert!(layer.attention.value.adapter.is_some());
            assert!(layer.attention.key.adapter.is_none());
            assert!(layer.mlp.intermediate.adapter.is_none());
        }
        // Two adapters per layer, each [32, 2] + [2, 32].
        assert_eq!(model.adapter_params(), config.num_layers * 2 * (64 + 64));
    }

    #[test]
    fn mlp_targets_use_mlp_dims() {
        let device = Default::default();
        let config = VitConfig::vit_tiny();
        let lora = LoraConfig::new()
            .with_rank(1)
            .with_target_modules(vec![LoraTarget::Intermediate]);
        let model = config.init::<TestBackend>(&device).with_lora(&lora, &device);
        let adapter = model.layers[0].mlp.intermediate.adapter.as_ref().unwrap();

        assert_eq!(adapter.d_input(), 32);
        assert_eq!(adapter.d_output(), 64);
    }

    #[test]
    fn merge_removes_adapters() {
        let device = Default::default();
        let model = VitConfig::vit_tiny()
            .init::<TestBackend>(&device)
            .with_lora(&LoraConfig::new().with_rank(2), &device)
            .merge();

        assert_eq!(model.num_adapters(), 0);
        assert_eq!(model.adapter_params(), 0);
    }
}
