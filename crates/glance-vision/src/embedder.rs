//! Encoded image bytes to a unit-length embedding.

use image::{Rgb, RgbImage};
use ndarray::Array4;
use tracing::{debug, info};

use glance_core::config::ModelConfig;
use glance_core::types::l2_normalize;

use crate::backend::{BackendKind, BackendSelector};
use crate::error::VisionError;
use crate::preprocess::Preprocessor;

/// Epsilon added to the L2 norm of every embedding.
pub const NORM_EPS: f32 = 1e-12;

/// Anything that can turn image bytes into a fixed-length embedding.
///
/// The query orchestrator depends on this trait rather than on a concrete
/// engine, so tests can substitute a deterministic implementation.
pub trait ImageEmbedding: Send + Sync {
    /// Embed encoded image bytes. The result has `dimension()` elements.
    fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>, VisionError>;

    /// Length of every embedding this implementation returns.
    fn dimension(&self) -> usize;
}

/// Preprocessing plus a lazily selected inference backend.
#[derive(Debug)]
pub struct ImageEmbedder {
    selector: BackendSelector,
    preprocessor: Preprocessor,
}

impl ImageEmbedder {
    /// Embedder for the given model configuration. Nothing is loaded yet.
    pub fn new(config: ModelConfig) -> Self {
        let preprocessor = Preprocessor::new(config.image_size as u32);
        Self::from_selector(BackendSelector::new(config), preprocessor)
    }

    pub fn from_selector(selector: BackendSelector, preprocessor: Preprocessor) -> Self {
        Self {
            selector,
            preprocessor,
        }
    }

    /// Decode, preprocess, run the backend and L2-normalize.
    pub fn embed_bytes(&self, bytes: &[u8]) -> Result<Vec<f32>, VisionError> {
        let tensor = self.preprocessor.preprocess_bytes(bytes)?;
        self.embed_tensor(&tensor)
    }

    /// Run the backend on an already-preprocessed tensor and L2-normalize.
    pub fn embed_tensor(&self, tensor: &Array4<f32>) -> Result<Vec<f32>, VisionError> {
        let backend = self.selector.get()?;
        let output = backend.infer(tensor)?;

        let expected = self.dimension();
        if output.ncols() != expected {
            return Err(VisionError::Inference(format!(
                "backend returned {} features, expected {}",
                output.ncols(),
                expected
            )));
        }

        let mut embedding = output.row(0).to_vec();
        l2_normalize(&mut embedding, NORM_EPS);
        debug!(dim = embedding.len(), backend = %backend.kind(), "Image embedded");
        Ok(embedding)
    }

    /// Force the backend load and optionally run one inference on a flat grey
    /// image. Returns the backend that ended up serving.
    pub fn warmup(&self, run_inference: bool) -> Result<BackendKind, VisionError> {
        let kind = self.selector.get()?.kind();
        if run_inference {
            let side = self.preprocessor.target_size();
            let grey = RgbImage::from_pixel(side, side, Rgb([128, 128, 128]));
            let tensor = self.preprocessor.preprocess_rgb(&grey)?;
            self.embed_tensor(&tensor)?;
        }
        info!(backend = %kind, run_inference, "Embedder warmed up");
        Ok(kind)
    }

    /// The backend kind, if already loaded.
    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.selector.kind()
    }

    /// Reason the accelerated backend was not used, if any.
    pub fn backend_diagnostic(&self) -> Option<String> {
        self.selector.diagnostic()
    }
}

impl ImageEmbedding for ImageEmbedder {
    fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>, VisionError> {
        self.embed_bytes(bytes)
    }

    fn dimension(&self) -> usize {
        self.selector.config().hidden_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InferenceBackend;
    use crate::vit::VitModel;
    use crate::weights::TensorMap;
    use image::{DynamicImage, ImageFormat};
    use std::io::Cursor;

    fn tiny_embedder() -> ImageEmbedder {
        let config = ModelConfig {
            image_size: 28,
            hidden_size: 8,
            num_heads: 2,
            num_layers: 2,
            ..ModelConfig::default()
        };
        let model =
            VitModel::from_tensors(&config, &TensorMap::random_init(&config, 3, 4, 11)).unwrap();
        ImageEmbedder::from_selector(
            BackendSelector::with_backend(config, InferenceBackend::Reference(model)),
            Preprocessor::new(28),
        )
    }

    fn png(width: u32, height: u32, seed: u8) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([
                (x as u8).wrapping_mul(seed),
                (y as u8).wrapping_add(seed),
                seed,
            ])
        });
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_embedding_is_unit_length() {
        let embedder = tiny_embedder();
        let v = embedder.embed_bytes(&png(40, 32, 3)).unwrap();
        assert_eq!(v.len(), 8);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_embedding_is_deterministic() {
        let embedder = tiny_embedder();
        let bytes = png(30, 30, 9);
        assert_eq!(
            embedder.embed_bytes(&bytes).unwrap(),
            embedder.embed_bytes(&bytes).unwrap()
        );
    }

    #[test]
    fn test_distinct_images_differ() {
        let embedder = tiny_embedder();
        let a = embedder.embed_bytes(&png(30, 30, 1)).unwrap();
        let b = embedder.embed_bytes(&png(30, 30, 200)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_corrupt_image_is_runtime_error() {
        let embedder = tiny_embedder();
        assert!(matches!(
            embedder.embed_image(b"not an image"),
            Err(VisionError::InvalidImage(_))
        ));
    }

    #[test]
    fn test_warmup_runs_inference() {
        let embedder = tiny_embedder();
        assert_eq!(embedder.warmup(true).unwrap(), BackendKind::Reference);
        assert_eq!(embedder.backend_kind(), Some(BackendKind::Reference));
        assert!(embedder.backend_diagnostic().is_none());
    }

    #[test]
    fn test_missing_weights_surface_on_first_embed() {
        let embedder = ImageEmbedder::new(ModelConfig {
            weights_path: "/nonexistent/weights.safetensors".to_string(),
            ..ModelConfig::default()
        });
        assert_eq!(embedder.dimension(), 768);
        assert!(matches!(
            embedder.embed_bytes(&png(16, 16, 5)),
            Err(VisionError::WeightFile(_))
        ));
    }
}
