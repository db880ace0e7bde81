use burn::config::ConfigError;
use burn::record::RecorderError;

use crate::lora::LoraError;

/// Errors raised while loading, fine-tuning, persisting or serving a model.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Recorder error: {0}")]
    Recorder(#[from] RecorderError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Hub error: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),

    #[error("LoRA error: {0}")]
    Lora(#[from] LoraError),

    #[error("Invalid model: {0}")]
    Model(String),

    #[error("Invalid dataset: {0}")]
    Dataset(String),

    #[error("Invalid image processor: {0}")]
    Processor(String),

    #[error("Invalid label mapping: {0}")]
    Labels(String),

    #[error("Tensor data error: {0}")]
    Data(String),
}

pub type Result<T> = core::result::Result<T, Error>;
