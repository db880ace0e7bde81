use burn::config::Config;
use serde::{Deserialize, Serialize};

use super::LoraError;

/// Linear layers of the Vision Transformer that can receive an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoraTarget {
    /// Attention query projection.
    Query,
    /// Attention key projection.
    Key,
    /// Attention value projection.
    Value,
    /// Projection applied after the attention heads are merged.
    AttentionOutput,
    /// First MLP projection (`hidden -> intermediate`).
    Intermediate,
    /// Second MLP projection (`intermediate -> hidden`).
    Output,
}

impl LoraTarget {
    /// All targets, in encoder-layer order.
    pub const ALL: [LoraTarget; 6] = [
        LoraTarget::Query,
        LoraTarget::Key,
        LoraTarget::Value,
        LoraTarget::AttentionOutput,
        LoraTarget::Intermediate,
        LoraTarget::Output,
    ];

    /// The name used on the command line and in adapter configs.
    pub fn name(&self) -> &'static str {
        match self {
            LoraTarget::Query => "query",
            LoraTarget::Key => "key",
            LoraTarget::Value => "value",
            LoraTarget::AttentionOutput => "attention_output",
            LoraTarget::Intermediate => "intermediate",
            LoraTarget::Output => "output",
        }
    }
}

impl core::str::FromStr for LoraTarget {
    type Err = LoraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        LoraTarget::ALL
            .into_iter()
            .find(|target| target.name() == value)
            .ok_or_else(|| LoraError::UnknownTarget(value.to_string()))
    }
}

/// How the adapter matrices are initialized.
///
/// Both strategies start `B` at zero, so a freshly attached adapter leaves the
/// base layer output unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoraInit {
    /// `A` Kaiming-uniform.
    #[default]
    Kaiming,
    /// `A` normal with a standard deviation of `1 / rank`.
    Gaussian,
}

/// Configuration for Low-Rank Adaptation.
#[derive(Config, Debug)]
pub struct LoraConfig {
    /// Rank of the decomposition.
    #[config(default = 16)]
    pub rank: usize,
    /// Numerator of the scaling factor.
    #[config(default = 16.0)]
    pub alpha: f64,
    /// Dropout applied to the adapter input.
    #[config(default = 0.1)]
    pub dropout: f64,
    /// Layers that receive an adapter.
    #[config(default = "vec![LoraTarget::Query, LoraTarget::Value]")]
    pub target_modules: Vec<LoraTarget>,
    #[config(default = "LoraInit::Kaiming")]
    pub init: LoraInit,
    /// Rank-stabilized scaling: `alpha / sqrt(rank)` instead of `alpha / rank`.
    #[config(default = false)]
    pub use_rslora: bool,
}

impl LoraConfig {
    /// Scaling factor applied to `A @ B`.
    pub fn scaling(&self) -> f64 {
        if self.use_rslora {
            self.alpha / (self.rank as f64).sqrt()
        } else {
            self.alpha / self.rank as f64
        }
    }

    /// Returns true when `target` should receive an adapter.
    pub fn targets(&self, target: LoraTarget) -> bool {
        self.target_modules.contains(&target)
    }

    pub fn validate(&self) -> Result<(), LoraError> {
        if self.rank == 0 {
            return Err(LoraError::InvalidConfig("rank must be > 0".into()));
        }
        if self.alpha <= 0.0 {
            return Err(LoraError::InvalidConfig("alpha must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(LoraError::InvalidConfig(
                "dropout must be in [0, 1)".into(),
            ));
        }
        if self.target_modules.is_empty() {
            return Err(LoraError::InvalidConfig(
                "at least one target module is required".into(),
            ));
        }
        Ok(())
    }
}
