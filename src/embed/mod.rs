//! Embedding adapters: dense text vectors, sparse lexical vectors, and
//! the vision model used for OCR and image captioning.

mod dense;
mod sparse;
mod vision;

pub use dense::{DenseEmbedder, OllamaEmbedder};
pub use sparse::{Bm25Encoder, SparseVector};
pub use vision::{OllamaVision, VisionModel};
