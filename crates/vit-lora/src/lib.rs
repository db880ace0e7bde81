//! Parameter-efficient fine-tuning of Vision Transformer image classifiers.
//!
//! A pre-trained ViT backbone is frozen, low-rank adapters are attached to its
//! attention and feed-forward projections and a fresh classification head is
//! trained on a labeled image folder. Only the adapters and the head are
//! saved, see [checkpoint].

pub mod base;
pub mod checkpoint;
pub mod data;
pub mod eval;
pub mod inference;
pub mod labels;
pub mod lora;
pub mod model;
pub mod training;

mod error;

pub use error::{Error, Result};
