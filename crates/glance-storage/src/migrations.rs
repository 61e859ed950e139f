//! Database schema migrations.

use rusqlite::Connection;
use tracing::info;

use glance_core::error::GlanceError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), GlanceError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| GlanceError::Storage(format!("Failed to create migrations table: {}", e)))?;

    if current_version(conn)? < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: history_schema");
    }

    Ok(())
}

/// Highest applied migration, 0 on a fresh database.
pub fn current_version(conn: &Connection) -> Result<i64, GlanceError> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| GlanceError::Storage(format!("Failed to query migration version: {}", e)))
}

/// Version 1: query history and ranked results.
fn apply_v1(conn: &Connection) -> Result<(), GlanceError> {
    conn.execute_batch(
        "
        -- One row per submitted query image.
        CREATE TABLE IF NOT EXISTS history_records (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at      INTEGER NOT NULL,
            filename        TEXT NOT NULL DEFAULT '',
            query_image     BLOB NOT NULL,
            query_feat      BLOB,
            feat_dim        INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_history_records_created
            ON history_records (created_at DESC);

        -- Ranked search results attached to a record.
        CREATE TABLE IF NOT EXISTS history_items (
            record_id       INTEGER NOT NULL,
            rank            INTEGER NOT NULL,
            url             TEXT NOT NULL,
            score           REAL NOT NULL,
            quality         TEXT NOT NULL
                            CHECK (quality IN ('strong', 'medium', 'weak', 'poor')),
            PRIMARY KEY (record_id, rank),
            FOREIGN KEY (record_id) REFERENCES history_records(id) ON DELETE CASCADE
        );

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'history_schema');
        ",
    )
    .map_err(|e| GlanceError::Storage(format!("Migration v1 failed: {}", e)))?;
    Ok(())
}
