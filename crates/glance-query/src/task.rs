//! Per-request task state kept in the cache with a TTL.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::cache::TypedCache;
use crate::error::QueryError;
use crate::kv::KvStore;

/// Lifecycle of a submitted query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Done,
    Error,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Done => "done",
            TaskState::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskState::Pending),
            "done" => Some(TaskState::Done),
            "error" => Some(TaskState::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Pending)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allowed moves: nothing to pending, and pending (or an expired entry) to
/// done or error. Terminal states never change.
pub fn validate_transition(from: Option<TaskState>, to: TaskState) -> Result<(), QueryError> {
    let ok = match (from, to) {
        (None, TaskState::Pending) => true,
        (None | Some(TaskState::Pending), TaskState::Done | TaskState::Error) => true,
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(QueryError::InvalidTransition { from, to })
    }
}

/// Status as reported to a poller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reads and writes task status and error entries.
pub struct TaskTracker {
    status: TypedCache<TaskState>,
    errors: TypedCache<String>,
    max_error_chars: usize,
}

impl TaskTracker {
    pub fn new(
        store: Arc<dyn KvStore>,
        prefix: &str,
        ttl: Duration,
        max_error_chars: usize,
    ) -> Self {
        Self {
            status: TypedCache::new(store.clone(), prefix, "task", Some(ttl)).with_field("status"),
            errors: TypedCache::new(store, prefix, "task", Some(ttl)).with_field("error"),
            max_error_chars,
        }
    }

    fn transition(&self, request_id: i64, to: TaskState) -> Result<(), QueryError> {
        let id = request_id.to_string();
        let from = self.status.get(&id)?;
        validate_transition(from, to)?;
        self.status.set(&id, &to)?;
        debug!(request_id, from = ?from, to = %to, "Task state changed");
        Ok(())
    }

    pub fn mark_pending(&self, request_id: i64) -> Result<(), QueryError> {
        self.transition(request_id, TaskState::Pending)
    }

    pub fn mark_done(&self, request_id: i64) -> Result<(), QueryError> {
        self.transition(request_id, TaskState::Done)
    }

    /// Record a failure. The message is cut to the configured number of
    /// characters and written before the state flips.
    pub fn mark_error(&self, request_id: i64, message: &str) -> Result<(), QueryError> {
        let id = request_id.to_string();
        validate_transition(self.status.get(&id)?, TaskState::Error)?;
        self.errors
            .set(&id, &truncate_chars(message, self.max_error_chars))?;
        self.transition(request_id, TaskState::Error)
    }

    /// Current status. Unknown or expired ids read as done.
    pub fn status(&self, request_id: i64) -> Result<TaskStatus, QueryError> {
        let id = request_id.to_string();
        let state = self.status.get(&id)?.unwrap_or(TaskState::Done);
        let error = match state {
            TaskState::Error => self.errors.get(&id)?,
            _ => None,
        };
        Ok(TaskStatus { state, error })
    }
}

/// First `max` characters of `s`, never splitting a character.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((end, _)) => s[..end].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    fn tracker(max_error_chars: usize) -> TaskTracker {
        TaskTracker::new(
            Arc::new(MemoryKvStore::new(100)),
            "test",
            Duration::from_secs(60),
            max_error_chars,
        )
    }

    #[test]
    fn test_transition_table() {
        use TaskState::*;
        assert!(validate_transition(None, Pending).is_ok());
        assert!(validate_transition(Some(Pending), Done).is_ok());
        assert!(validate_transition(Some(Pending), Error).is_ok());
        assert!(validate_transition(None, Done).is_ok());
        assert!(validate_transition(None, Error).is_ok());

        assert!(validate_transition(Some(Pending), Pending).is_err());
        assert!(validate_transition(Some(Done), Error).is_err());
        assert!(validate_transition(Some(Error), Done).is_err());
        assert!(validate_transition(Some(Done), Pending).is_err());
    }

    #[test]
    fn test_lifecycle() {
        let t = tracker(100);
        t.mark_pending(1).unwrap();
        assert_eq!(t.status(1).unwrap().state, TaskState::Pending);
        t.mark_done(1).unwrap();
        assert_eq!(
            t.status(1).unwrap(),
            TaskStatus {
                state: TaskState::Done,
                error: None
            }
        );
        assert!(t.mark_error(1, "late").is_err());
        assert_eq!(t.status(1).unwrap().state, TaskState::Done);
    }

    #[test]
    fn test_unknown_id_reads_as_done() {
        let t = tracker(100);
        let status = t.status(12345).unwrap();
        assert_eq!(status.state, TaskState::Done);
        assert!(status.error.is_none());
    }

    #[test]
    fn test_error_message_truncated() {
        let t = tracker(5);
        t.mark_pending(7).unwrap();
        t.mark_error(7, "äöüßéxyz").unwrap();
        let status = t.status(7).unwrap();
        assert_eq!(status.state, TaskState::Error);
        assert_eq!(status.error.as_deref(), Some("äöüßé"));
    }

    #[test]
    fn test_state_strings() {
        for state in [TaskState::Pending, TaskState::Done, TaskState::Error] {
            assert_eq!(TaskState::parse(state.as_str()), Some(state));
        }
        assert_eq!(TaskState::parse("Done"), None);
        assert!(TaskState::Error.is_terminal());
        assert!(!TaskState::Pending.is_terminal());
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 0), "");
        assert_eq!(truncate_chars("日本語です", 3), "日本語");
    }
}
