//! Glance Storage crate - SQLite persistence for query history.
//!
//! Wraps a rusqlite connection with WAL mode and versioned migrations, and
//! implements [`RecordStore`], the history interface the query orchestrator
//! writes through.

pub mod db;
pub mod migrations;
pub mod records;

pub use db::Database;
pub use records::{HistoryRecord, HistorySummary, RecordStore, SqliteRecordStore};
