use thiserror::Error;

/// Top-level error type for the Glance system.
///
/// Each variant wraps a subsystem-specific error. Subsystem crates define their
/// own error types and implement `From<SubsystemError> for GlanceError` so
/// that the `?` operator works across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GlanceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Gallery error: {0}")]
    Gallery(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Record not found: {0}")]
    NotFound(i64),
}

impl From<toml::de::Error> for GlanceError {
    fn from(err: toml::de::Error) -> Self {
        GlanceError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for GlanceError {
    fn from(err: toml::ser::Error) -> Self {
        GlanceError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for GlanceError {
    fn from(err: serde_json::Error) -> Self {
        GlanceError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Glance operations.
pub type Result<T> = std::result::Result<T, GlanceError>;
