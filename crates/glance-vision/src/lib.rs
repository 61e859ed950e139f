//! Glance Vision crate - image preprocessing and vision-transformer inference.
//!
//! Provides a pure-ndarray DINOv2-style forward pass, an optional ONNX Runtime
//! backend behind the `onnx` feature, a lazily-initialized backend selector
//! with permanent fallback, and an image embedder producing unit vectors.

pub mod backend;
pub mod embedder;
pub mod error;
pub mod onnx;
pub mod preprocess;
pub mod vit;
pub mod weights;

pub use backend::{BackendChoice, BackendKind, BackendSelector, InferenceBackend, Selection};
pub use embedder::{ImageEmbedder, ImageEmbedding};
pub use error::VisionError;
pub use preprocess::Preprocessor;
pub use vit::VitModel;
pub use weights::TensorMap;
