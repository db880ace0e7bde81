//! Low-Rank Adaptation for linear layers.
//!
//! A frozen linear layer `W` is augmented with two trainable matrices
//! `A: [d_input, rank]` and `B: [rank, d_output]`:
//!
//! ```text
//! output = base(x) + dropout(x) @ A @ B * scaling
//! ```
//!
//! `B` starts at zero, so attaching an adapter does not change the layer output
//! until the adapter is trained. [`LoraLinear::merge`] folds the product back
//! into the base weight for inference.

mod adapter;
mod config;
mod linear;

pub use adapter::LoraAdapter;
pub use config::{LoraConfig, LoraInit, LoraTarget};
pub use linear::LoraLinear;

/// Errors raised when building or installing adapters.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LoraError {
    #[error("invalid LoRA config: {0}")]
    InvalidConfig(String),

    #[error("unknown LoRA target `{0}`")]
    UnknownTarget(String),

    #[error(
        "adapter shape mismatch for {layer}: expected [{d_input}, r] x [r, {d_output}], got [{a_rows}, {a_cols}] x [{b_rows}, {b_cols}]"
    )]
    ShapeMismatch {
        layer: String,
        d_input: usize,
        d_output: usize,
        a_rows: usize,
        a_cols: usize,
        b_rows: usize,
        b_cols: usize,
    },

    #[error("adapter layout does not match the model: {0}")]
    LayoutMismatch(String),
}
