//! Error types for preprocessing, weight loading and inference.

use glance_core::error::GlanceError;

/// Errors from the vision pipeline.
///
/// Load-time variants (`WeightFile`, `MissingWeight`, `ShapeMismatch`,
/// `ModelLoad`) surface from engine construction. Run-time variants
/// (`InvalidImage`, `InvalidInput`, `Inference`) surface from the call that
/// requested the embedding.
#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("Weight file error: {0}")]
    WeightFile(String),
    #[error("Missing weight tensor: {0}")]
    MissingWeight(String),
    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("Model load failed: {0}")]
    ModelLoad(String),
    #[error("Invalid image: {0}")]
    InvalidImage(String),
    #[error("Invalid input tensor: {0}")]
    InvalidInput(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Configuration error: {0}")]
    Config(#[from] GlanceError),
}

impl From<VisionError> for GlanceError {
    fn from(err: VisionError) -> Self {
        match err {
            VisionError::Config(inner) => inner,
            VisionError::InvalidImage(_)
            | VisionError::InvalidInput(_)
            | VisionError::Inference(_) => GlanceError::Inference(err.to_string()),
            _ => GlanceError::Model(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_display() {
        let err = VisionError::ShapeMismatch {
            name: "layernorm.weight".to_string(),
            expected: vec![768],
            actual: vec![384],
        };
        assert_eq!(
            err.to_string(),
            "Shape mismatch for layernorm.weight: expected [768], got [384]"
        );
    }

    #[test]
    fn test_conversion_to_glance_error() {
        let load: GlanceError = VisionError::MissingWeight("x".into()).into();
        assert!(matches!(load, GlanceError::Model(_)));

        let run: GlanceError = VisionError::InvalidImage("truncated".into()).into();
        assert!(matches!(run, GlanceError::Inference(_)));

        let cfg: GlanceError = VisionError::Config(GlanceError::Config("bad".into())).into();
        assert!(matches!(cfg, GlanceError::Config(_)));
    }
}
