use burn::config::Config;

use crate::error::Error;
use crate::lora::LoraTarget;

/// Hyper-parameters of a Vision Transformer backbone.
///
/// Defaults describe `ViT-Base/16` at 224x224 resolution.
#[derive(Config, Debug, PartialEq)]
pub struct VitConfig {
    #[config(default = 224)]
    pub image_size: usize,
    #[config(default = 16)]
    pub patch_size: usize,
    #[config(default = 3)]
    pub num_channels: usize,
    #[config(default = 768)]
    pub hidden_size: usize,
    #[config(default = 12)]
    pub num_layers: usize,
    #[config(default = 12)]
    pub num_heads: usize,
    #[config(default = 3072)]
    pub intermediate_size: usize,
    #[config(default = 1e-12)]
    pub layer_norm_eps: f64,
    #[config(default = 0.0)]
    pub hidden_dropout: f64,
    #[config(default = 0.0)]
    pub attention_dropout: f64,
}

impl VitConfig {
    /// `ViT-Base/16`, the architecture of `google/vit-base-patch16-224-in21k`.
    pub fn vit_base_patch16_224() -> Self {
        Self::new()
    }

    /// A two-layer model on 32x32 images, small enough to train on a CPU.
    pub fn vit_tiny() -> Self {
        Self::new()
            .with_image_size(32)
            .with_patch_size(8)
            .with_hidden_size(32)
            .with_num_layers(2)
            .with_num_heads(4)
            .with_intermediate_size(64)
            .with_layer_norm_eps(1e-6)
    }

    /// Number of patches per image.
    pub fn num_patches(&self) -> usize {
        let per_side = self.image_size / self.patch_size;
        per_side * per_side
    }

    /// Sequence length seen by the encoder, class token included.
    pub fn seq_length(&self) -> usize {
        self.num_patches() + 1
    }

    /// `(d_input, d_output)` of the linear layer a target refers to.
    pub fn target_dims(&self, target: LoraTarget) -> (usize, usize) {
        match target {
            LoraTarget::Query
            | LoraTarget::Key
            | LoraTarget::Value
            | LoraTarget::AttentionOutput => (self.hidden_size, self.hidden_size),
            LoraTarget::Intermediate => (self.hidden_size, self.intermediate_size),
            LoraTarget::Output => (self.intermediate_size, self.hidden_size),
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.patch_size == 0 || self.image_size % self.patch_size != 0 {
            return Err(Error::Model(format!(
                "image size {} is not divisible by patch size {}",
                self.image_size, self.patch_size
            )));
        }
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            return Err(Error::Model(format!(
                "hidden size {} is not divisible by {} heads",
                self.hidden_size, self.num_heads
            )));
        }
        if self.num_layers == 0 {
            return Err(Error::Model("at least one encoder layer is required".into()));
        }
        Ok(())
    }
}
