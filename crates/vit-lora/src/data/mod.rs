//! Labeled image folders, train/test splitting and image preprocessing.

mod batcher;
mod folder;
mod processor;
mod split;

pub use batcher::{ImageBatch, ImageBatcher};
pub use folder::{ImageFolder, ImageItem, SUPPORTED_EXTENSIONS};
pub use processor::{ImageProcessor, ImageProcessorConfig};
pub use split::DatasetSplit;
