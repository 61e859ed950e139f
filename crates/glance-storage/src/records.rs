//! Query history: one record per submitted image, plus its ranked results.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::OptionalExtension;
use serde::Serialize;
use tracing::debug;

use glance_core::error::GlanceError;
use glance_core::types::{Quality, RankedResult};

use crate::db::Database;

/// A stored query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub filename: String,
    #[serde(skip)]
    pub query_image: Vec<u8>,
    /// Query embedding, once results are attached.
    pub query_feat: Option<Vec<f32>>,
    pub feat_dim: Option<usize>,
}

/// Listing row for recent queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistorySummary {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub filename: String,
    pub result_count: usize,
    pub best_score: Option<f32>,
}

/// Persistence used by the query orchestrator.
pub trait RecordStore: Send + Sync {
    /// Store the uploaded image and return the new record id.
    fn create_record(&self, image: &[u8], filename: &str) -> Result<i64, GlanceError>;

    /// Store the query embedding and replace the record's results.
    ///
    /// # Errors
    /// `GlanceError::NotFound` if the record does not exist.
    fn attach_results(
        &self,
        record_id: i64,
        embedding: &[f32],
        results: &[RankedResult],
    ) -> Result<(), GlanceError>;

    fn get_record(&self, record_id: i64) -> Result<Option<HistoryRecord>, GlanceError>;

    /// Results of a record in rank order, at most `limit`.
    fn list_items(&self, record_id: i64, limit: usize) -> Result<Vec<RankedResult>, GlanceError>;

    /// Most recent records first.
    fn recent_records(&self, limit: usize) -> Result<Vec<HistorySummary>, GlanceError>;

    /// Delete a record and its results. Returns whether it existed.
    fn delete_record(&self, record_id: i64) -> Result<bool, GlanceError>;
}

/// SQLite-backed [`RecordStore`].
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    db: Arc<Database>,
}

impl SqliteRecordStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl RecordStore for SqliteRecordStore {
    fn create_record(&self, image: &[u8], filename: &str) -> Result<i64, GlanceError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO history_records (created_at, filename, query_image)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![Utc::now().timestamp_millis(), filename, image],
            )
            .map_err(|e| GlanceError::Storage(format!("Failed to create record: {}", e)))?;
            let id = conn.last_insert_rowid();
            debug!(record_id = id, bytes = image.len(), "History record created");
            Ok(id)
        })
    }

    fn attach_results(
        &self,
        record_id: i64,
        embedding: &[f32],
        results: &[RankedResult],
    ) -> Result<(), GlanceError> {
        self.db.with_transaction(|tx| {
            let updated = tx
                .execute(
                    "UPDATE history_records SET query_feat = ?1, feat_dim = ?2 WHERE id = ?3",
                    rusqlite::params![f32_to_blob(embedding), embedding.len() as i64, record_id],
                )
                .map_err(|e| GlanceError::Storage(format!("Failed to store embedding: {}", e)))?;
            if updated == 0 {
                return Err(GlanceError::NotFound(record_id));
            }

            tx.execute(
                "DELETE FROM history_items WHERE record_id = ?1",
                rusqlite::params![record_id],
            )
            .map_err(|e| GlanceError::Storage(format!("Failed to clear results: {}", e)))?;

            {
                let mut stmt = tx
                    .prepare(
                        "INSERT INTO history_items (record_id, rank, url, score, quality)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )
                    .map_err(|e| GlanceError::Storage(e.to_string()))?;
                for r in results {
                    stmt.execute(rusqlite::params![
                        record_id,
                        r.rank,
                        r.url,
                        r.score as f64,
                        r.quality.as_str(),
                    ])
                    .map_err(|e| GlanceError::Storage(format!("Failed to save result: {}", e)))?;
                }
            }

            debug!(record_id, results = results.len(), "Results attached");
            Ok(())
        })
    }

    fn get_record(&self, record_id: i64) -> Result<Option<HistoryRecord>, GlanceError> {
        self.db.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, created_at, filename, query_image, query_feat, feat_dim
                     FROM history_records WHERE id = ?1",
                    rusqlite::params![record_id],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Vec<u8>>(3)?,
                            row.get::<_, Option<Vec<u8>>>(4)?,
                            row.get::<_, Option<i64>>(5)?,
                        ))
                    },
                )
                .optional()
                .map_err(|e| GlanceError::Storage(e.to_string()))?;

            row.map(|(id, created, filename, image, feat, dim)| -> Result<_, GlanceError> {
                Ok(HistoryRecord {
                    id,
                    created_at: millis_to_datetime(created)?,
                    filename,
                    query_image: image,
                    query_feat: feat.map(|b| blob_to_f32(&b)),
                    feat_dim: dim.map(|d| d as usize),
                })
            })
            .transpose()
        })
    }

    fn list_items(&self, record_id: i64, limit: usize) -> Result<Vec<RankedResult>, GlanceError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT rank, url, score, quality FROM history_items
                     WHERE record_id = ?1 ORDER BY rank ASC LIMIT ?2",
                )
                .map_err(|e| GlanceError::Storage(e.to_string()))?;

            let rows = stmt
                .query_map(rusqlite::params![record_id, limit as i64], |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })
                .map_err(|e| GlanceError::Storage(e.to_string()))?;

            let mut items = Vec::new();
            for row in rows {
                let (rank, url, score, quality) =
                    row.map_err(|e| GlanceError::Storage(e.to_string()))?;
                let quality = Quality::parse(&quality).ok_or_else(|| {
                    GlanceError::Storage(format!("Unknown quality label: {}", quality))
                })?;
                items.push(RankedResult {
                    rank,
                    url,
                    score: score as f32,
                    quality,
                });
            }
            Ok(items)
        })
    }

    fn recent_records(&self, limit: usize) -> Result<Vec<HistorySummary>, GlanceError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT r.id, r.created_at, r.filename, COUNT(i.rank), MAX(i.score)
                     FROM history_records r
                     LEFT JOIN history_items i ON i.record_id = r.id
                     GROUP BY r.id
                     ORDER BY r.created_at DESC, r.id DESC
                     LIMIT ?1",
                )
                .map_err(|e| GlanceError::Storage(e.to_string()))?;

            let rows = stmt
                .query_map(rusqlite::params![limit as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                    ))
                })
                .map_err(|e| GlanceError::Storage(e.to_string()))?;

            let mut out = Vec::new();
            for row in rows {
                let (id, created, filename, count, best) =
                    row.map_err(|e| GlanceError::Storage(e.to_string()))?;
                out.push(HistorySummary {
                    id,
                    created_at: millis_to_datetime(created)?,
                    filename,
                    result_count: count as usize,
                    best_score: best.map(|s| s as f32),
                });
            }
            Ok(out)
        })
    }

    fn delete_record(&self, record_id: i64) -> Result<bool, GlanceError> {
        self.db.with_conn(|conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM history_records WHERE id = ?1",
                    rusqlite::params![record_id],
                )
                .map_err(|e| GlanceError::Storage(format!("Failed to delete record: {}", e)))?;
            Ok(deleted > 0)
        })
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, GlanceError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| GlanceError::Storage(format!("Invalid timestamp: {}", ms)))
}

/// Little-endian f32 bytes.
pub fn f32_to_blob(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn blob_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
