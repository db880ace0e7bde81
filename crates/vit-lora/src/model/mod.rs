//! Vision Transformer classifier whose linear layers accept LoRA adapters.

mod classifier;
mod config;
mod vit;

pub use classifier::{ImageClassifier, ImageClassifierRecord, ParamSummary, apply_lora};
pub use config::VitConfig;
pub use vit::{
    EncoderLayer, Mlp, PatchEmbedding, SelfAttention, VisionTransformer, VisionTransformerRecord,
};
