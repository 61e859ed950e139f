//! Glance Query crate - asynchronous query orchestration.
//!
//! Submitted images are persisted, marked pending and processed in order by
//! a single background worker. Task state and query embeddings live in a
//! TTL-bounded key-value cache keyed by request id and content hash.

pub mod cache;
pub mod error;
pub mod kv;
pub mod orchestrator;
pub mod task;

pub use cache::{content_digest, CacheValue, Embedding, TypedCache};
pub use error::QueryError;
pub use kv::{KvStore, MemoryKvStore};
pub use orchestrator::{QueryOrchestrator, QueryServices, SearchRequest, TaskHandle, WaitOutcome};
pub use task::{TaskState, TaskStatus, TaskTracker};
