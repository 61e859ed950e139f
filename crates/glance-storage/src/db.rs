//! The history database: one SQLite file shared by every `glance` process.
//!
//! Several CLI invocations may touch the same file at once, so the connection
//! runs in WAL mode with a busy timeout. Migrations run on every open.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, Transaction};
use tracing::{debug, info};

use glance_core::config::{expand_home, StorageConfig};
use glance_core::error::GlanceError;

use crate::migrations;

/// How long a writer waits on another process's lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// History database handle. The connection is serialized behind a mutex.
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open the database named by `[storage] db_path`.
    pub fn open(config: &StorageConfig) -> Result<Self, GlanceError> {
        Self::new(&expand_home(&config.db_path))
    }

    /// Open (or create) a database file, creating parent directories.
    pub fn new(path: &Path) -> Result<Self, GlanceError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| storage_err("open database", e))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| storage_err("set busy timeout", e))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(|e| storage_err("set pragmas", e))?;

        let db = Self::init(conn, Some(path.to_path_buf()))?;
        info!(path = %path.display(), schema = db.schema_version()?, "History database opened");
        Ok(db)
    }

    /// A private in-memory database.
    pub fn in_memory() -> Result<Self, GlanceError> {
        let conn = Connection::open_in_memory().map_err(|e| storage_err("open in-memory db", e))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| storage_err("set pragmas", e))?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, GlanceError> {
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// File backing the database, `None` when in memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Highest applied migration.
    pub fn schema_version(&self) -> Result<i64, GlanceError> {
        self.with_conn(migrations::current_version)
    }

    /// Run `f` with the connection locked.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, GlanceError>
    where
        F: FnOnce(&Connection) -> Result<T, GlanceError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| GlanceError::Storage(format!("Database lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Run `f` inside a transaction. Commits when `f` succeeds; any error
    /// rolls the whole transaction back.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, GlanceError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, GlanceError>,
    {
        self.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| storage_err("begin transaction", e))?;
            let value = f(&tx)?;
            tx.commit().map_err(|e| storage_err("commit", e))?;
            debug!("Transaction committed");
            Ok(value)
        })
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

/// Wrap a rusqlite failure with the step that caused it.
pub(crate) fn storage_err(step: &str, err: rusqlite::Error) -> GlanceError {
    GlanceError::Storage(format!("Failed to {step}: {err}"))
}
