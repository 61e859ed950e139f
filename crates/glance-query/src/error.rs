//! Error types for the query pipeline.

use glance_core::error::GlanceError;
use glance_vision::VisionError;

use crate::task::TaskState;

/// Errors raised while submitting or processing a query.
///
/// Errors inside the background pipeline never reach the submitter; they are
/// rendered to text and stored as the task's error status.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Embedding failed: {0}")]
    Embedding(#[from] VisionError),
    #[error("{0}")]
    Glance(#[from] GlanceError),
    #[error("Invalid task transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: Option<TaskState>,
        to: TaskState,
    },
    #[error("Query worker is not running")]
    WorkerStopped,
    #[error("Task panicked: {0}")]
    Panicked(String),
}

impl From<QueryError> for GlanceError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::Glance(inner) => inner,
            QueryError::Embedding(inner) => inner.into(),
            other => GlanceError::Query(other.to_string()),
        }
    }
}
