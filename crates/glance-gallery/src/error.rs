//! Error types for gallery artifacts.

use glance_core::error::GlanceError;
use glance_vision::VisionError;

/// Errors from reading or writing gallery artifacts.
///
/// Loading the index never returns these to callers; they are kept as the
/// index's last diagnostic instead. The builder and the raw readers do return
/// them.
#[derive(Debug, thiserror::Error)]
pub enum GalleryError {
    #[error("Invalid .npy file: {0}")]
    Npy(String),
    #[error("Invalid manifest: {0}")]
    Manifest(String),
    #[error("Bad feature matrix shape: {0:?}")]
    Shape(Vec<usize>),
    #[error("Embedding failed: {0}")]
    Embedding(#[from] VisionError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<GalleryError> for GlanceError {
    fn from(err: GalleryError) -> Self {
        match err {
            GalleryError::Io(e) => GlanceError::Io(e),
            other => GlanceError::Gallery(other.to_string()),
        }
    }
}
