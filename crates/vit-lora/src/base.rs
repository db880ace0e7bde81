//! Foundation model resolution and loading.
//!
//! A model identifier is resolved, in order, as:
//!
//! - `random-tiny` / `random-base`: randomly initialized backbones, offline;
//! - a local directory holding either a Hugging Face checkpoint
//!   (`config.json` + `model.safetensors`) or a Burn checkpoint
//!   (`vit_config.json` + `model.mpk`);
//! - a local `.safetensors` file with a `config.json` next to it;
//! - a Hugging Face Hub repository id such as `google/vit-base-patch16-224-in21k`.

use std::path::{Path, PathBuf};

use burn::config::Config;
use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::Backend;
use burn_import::safetensors::{AdapterType, LoadArgs, SafetensorsFileRecorder};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::{VisionTransformer, VisionTransformerRecord, VitConfig};

pub const RANDOM_TINY: &str = "random-tiny";
pub const RANDOM_BASE: &str = "random-base";
const RANDOM_SEED: u64 = 0;

const HF_CONFIG_FILE: &str = "config.json";
const HF_WEIGHTS_FILE: &str = "model.safetensors";
const BURN_CONFIG_FILE: &str = "vit_config.json";
const BURN_WEIGHTS_FILE: &str = "model";

/// Hugging Face tensor names to module paths, applied in order.
const KEY_REMAP: [(&str, &str); 12] = [
    (r"^vit\.", ""),
    (r"^embeddings\.patch_embeddings\.projection\.", "patch_embedding.projection."),
    (r"^embeddings\.cls_token$", "cls_token"),
    (r"^embeddings\.position_embeddings$", "position_embeddings"),
    (r"^encoder\.layer\.([0-9]+)\.", "layers.$1."),
    (r"\.attention\.attention\.(query|key|value)\.", ".attention.$1.base."),
    (r"\.attention\.output\.dense\.", ".attention.output.base."),
    (r"\.intermediate\.dense\.", ".mlp.intermediate.base."),
    (r"^layers\.([0-9]+)\.output\.dense\.", "layers.$1.mlp.output.base."),
    (r"\.layernorm_before\.", ".norm1."),
    (r"\.layernorm_after\.", ".norm2."),
    (r"^layernorm\.", "norm."),
];

/// Where the foundation weights come from.
#[derive(Debug, Clone, PartialEq)]
pub enum BaseModelSource {
    Random(VitConfig),
    Safetensors { weights: PathBuf, config: VitConfig },
    Record { weights: PathBuf, config: VitConfig },
    Hub(String),
}

/// A frozen-to-be backbone and the identifier it was loaded from.
#[derive(Debug)]
pub struct BaseModel<B: Backend> {
    pub id: String,
    pub config: VitConfig,
    pub backbone: VisionTransformer<B>,
}

/// `config.json` of a Hugging Face ViT checkpoint.
#[derive(Debug, Deserialize)]
struct HfVitConfig {
    hidden_size: usize,
    num_hidden_layers: usize,
    num_attention_heads: usize,
    intermediate_size: usize,
    #[serde(default = "default_image_size")]
    image_size: usize,
    #[serde(default = "default_patch_size")]
    patch_size: usize,
    #[serde(default = "default_num_channels")]
    num_channels: usize,
    #[serde(default = "default_layer_norm_eps")]
    layer_norm_eps: f64,
    #[serde(default)]
    hidden_dropout_prob: f64,
    #[serde(default)]
    attention_probs_dropout_prob: f64,
    #[serde(default)]
    hidden_act: Option<String>,
}

fn default_image_size() -> usize {
    224
}

fn default_patch_size() -> usize {
    16
}

fn default_num_channels() -> usize {
    3
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

impl From<HfVitConfig> for VitConfig {
    fn from(config: HfVitConfig) -> Self {
        VitConfig::new()
            .with_image_size(config.image_size)
            .with_patch_size(config.patch_size)
            .with_num_channels(config.num_channels)
            .with_hidden_size(config.hidden_size)
            .with_num_layers(config.num_hidden_layers)
            .with_num_heads(config.num_attention_heads)
            .with_intermediate_size(config.intermediate_size)
            .with_layer_norm_eps(config.layer_norm_eps)
            .with_hidden_dropout(config.hidden_dropout_prob)
            .with_attention_dropout(config.attention_probs_dropout_prob)
    }
}

/// Parses a Hugging Face ViT `config.json`.
pub fn read_hf_config<P: AsRef<Path>>(path: P) -> Result<VitConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: HfVitConfig = serde_json::from_str(&content)?;

    if let Some(activation) = config.hidden_act.as_deref() {
        if activation != "gelu" {
            log::warn!("Checkpoint uses `{activation}`, the backbone always applies GELU");
        }
    }

    let config = VitConfig::from(config);
    config.validate()?;
    Ok(config)
}

impl BaseModelSource {
    /// Resolves a model identifier without touching the network.
    pub fn resolve(id: &str) -> Result<Self> {
        match id {
            RANDOM_TINY => return Ok(Self::Random(VitConfig::vit_tiny())),
            RANDOM_BASE => return Ok(Self::Random(VitConfig::vit_base_patch16_224())),
            _ => {}
        }

        let path = Path::new(id);
        if path.is_dir() {
            return Self::from_dir(path);
        }
        if path.is_file() {
            return match path.extension().and_then(|ext| ext.to_str()) {
                Some("safetensors") => {
                    let config_path = path.with_file_name(HF_CONFIG_FILE);
                    Ok(Self::Safetensors {
                        weights: path.to_path_buf(),
                        config: read_hf_config(config_path)?,
                    })
                }
                _ => Err(Error::Model(format!(
                    "unsupported weights file `{}`",
                    path.display()
                ))),
            };
        }

        Ok(Self::Hub(id.to_string()))
    }

    fn from_dir(dir: &Path) -> Result<Self> {
        let hf_weights = dir.join(HF_WEIGHTS_FILE);
        if hf_weights.is_file() {
            return Ok(Self::Safetensors {
                weights: hf_weights,
                config: read_hf_config(dir.join(HF_CONFIG_FILE))?,
            });
        }

        let burn_config = dir.join(BURN_CONFIG_FILE);
        if burn_config.is_file() {
            return Ok(Self::Record {
                weights: dir.join(BURN_WEIGHTS_FILE),
                config: VitConfig::load(burn_config)?,
            });
        }

        Err(Error::Model(format!(
            "`{}` holds neither {HF_WEIGHTS_FILE} nor {BURN_CONFIG_FILE}",
            dir.display()
        )))
    }

    /// Downloads hub checkpoints into the local cache.
    pub fn fetch(self) -> Result<Self> {
        let Self::Hub(repo_id) = self else {
            return Ok(self);
        };

        log::info!("Downloading {repo_id} from the Hugging Face Hub");
        let api = hf_hub::api::sync::Api::new()?;
        let repo = api.model(repo_id);
        let config = read_hf_config(repo.get(HF_CONFIG_FILE)?)?;
        let weights = repo.get(HF_WEIGHTS_FILE)?;

        Ok(Self::Safetensors { weights, config })
    }
}

/// Resolves, downloads if needed and loads a foundation model.
pub fn load_base_model<B: Backend>(id: &str, device: &B::Device) -> Result<BaseModel<B>> {
    let source = BaseModelSource::resolve(id)?.fetch()?;

    let (config, backbone) = match source {
        BaseModelSource::Random(config) => {
            log::warn!("Using a randomly initialized backbone for `{id}`");
            // Fixed seed, adapters saved against a random backbone must reload onto the same one.
            B::seed(RANDOM_SEED);
            let backbone = config.init(device);
            (config, backbone)
        }
        BaseModelSource::Safetensors { weights, config } => {
            log::info!("Loading safetensors weights from {}", weights.display());
            let args = KEY_REMAP.iter().fold(
                LoadArgs::new(weights).with_adapter_type(AdapterType::PyTorch),
                |args, (pattern, replacement)| args.with_key_remap(pattern, replacement),
            );
            let record: VisionTransformerRecord<B> =
                SafetensorsFileRecorder::<FullPrecisionSettings>::default().load(args, device)?;
            let backbone = config.init(device).load_record(record);
            (config, backbone)
        }
        BaseModelSource::Record { weights, config } => {
            log::info!("Loading burn record from {}", weights.display());
            let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
            let backbone = config.init(device).load_file(weights, &recorder, device)?;
            (config, backbone)
        }
        BaseModelSource::Hub(repo_id) => {
            return Err(Error::Model(format!("`{repo_id}` was not fetched")));
        }
    };

    check_geometry(&config, &backbone)?;

    Ok(BaseModel {
        id: id.to_string(),
        config,
        backbone,
    })
}

/// Saves a backbone in the Burn checkpoint layout understood by [load_base_model].
pub fn save_base_model<B: Backend, P: AsRef<Path>>(
    backbone: VisionTransformer<B>,
    config: &VitConfig,
    dir: P,
) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    config.save(dir.join(BURN_CONFIG_FILE))?;

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    backbone.save_file(dir.join(BURN_WEIGHTS_FILE), &recorder)?;

    Ok(())
}

fn check_geometry<B: Backend>(config: &VitConfig, backbone: &VisionTransformer<B>) -> Result<()> {
    let [_, seq_length, hidden_size] = backbone.position_embeddings.dims();

    if seq_length != config.seq_length() || hidden_size != config.hidden_size {
        return Err(Error::Model(format!(
            "position embeddings are [{seq_length}, {hidden_size}], expected [{}, {}]",
            config.seq_length(),
            config.hidden_size
        )));
    }
    if backbone.layers.len() != config.num_layers {
        return Err(Error::Model(format!(
            "found {} encoder layers, expected {}",
            backbone.layers.len(),
            config.num_layers
        )));
    }

    Ok(())
}
