//! src/services/ledger.rs
//!
//! Ledger: durable metadata for uploaded files, one row per object in the
//! SQLite `files` table. Every mutation is a single statement, so SQLite's
//! writer lock gives per-row atomicity without extra locking here.

use crate::models::record::{LedgerStats, NewRecord, ObjectRecord};
use chrono::{DateTime, Utc};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{str::FromStr, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::debug;

const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");

const RECORD_COLUMNS: &str = "seq, id, original_name, storage_location, size_bytes, mime_type, \
                              extension, uploaded_at, expires_at, download_count, owner_address";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("record `{0}` not found")]
    NotFound(String),
    #[error("record `{0}` already exists")]
    DuplicateId(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Clone)]
pub struct Ledger {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl Ledger {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Open (creating if needed) the SQLite database at `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> LedgerResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self::new(Arc::new(pool)))
    }

    /// Apply the embedded schema. Safe to run on every start.
    pub async fn migrate(&self) -> LedgerResult<()> {
        let statements = MIGRATION_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("running {} migration statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Liveness check against the database.
    pub async fn ping(&self) -> LedgerResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }

    /// Insert a new record. Fails with `DuplicateId` if the id is taken.
    pub async fn insert(&self, record: NewRecord) -> LedgerResult<ObjectRecord> {
        let sql = format!(
            "INSERT INTO files (
                id, original_name, storage_location, size_bytes, mime_type,
                extension, uploaded_at, expires_at, download_count, owner_address
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
             RETURNING {RECORD_COLUMNS}"
        );

        sqlx::query_as::<_, ObjectRecord>(&sql)
            .bind(&record.id)
            .bind(&record.original_name)
            .bind(&record.storage_location)
            .bind(record.size_bytes)
            .bind(&record.mime_type)
            .bind(&record.extension)
            .bind(record.uploaded_at)
            .bind(record.expires_at)
            .bind(&record.owner_address)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                err if is_unique_violation(&err) => LedgerError::DuplicateId(record.id.clone()),
                other => LedgerError::Sqlx(other),
            })
    }

    pub async fn find_by_id(&self, id: &str) -> LedgerResult<ObjectRecord> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM files WHERE id = ?");
        sqlx::query_as::<_, ObjectRecord>(&sql)
            .bind(id)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => LedgerError::NotFound(id.to_string()),
                other => LedgerError::Sqlx(other),
            })
    }

    pub async fn exists(&self, id: &str) -> LedgerResult<bool> {
        let found = sqlx::query_scalar::<_, i64>("SELECT EXISTS(SELECT 1 FROM files WHERE id = ?)")
            .bind(id)
            .fetch_one(&*self.db)
            .await?;
        Ok(found != 0)
    }

    /// Claim one download for `id`.
    ///
    /// The counter is bumped only while the row is still servable (not
    /// expired at `now`, below `max_downloads`). Returns the updated record,
    /// or `None` if the row is gone or no longer eligible.
    pub async fn increment_download(
        &self,
        id: &str,
        max_downloads: i64,
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<ObjectRecord>> {
        let sql = format!(
            "UPDATE files SET download_count = download_count + 1
             WHERE id = ? AND download_count < ? AND expires_at > ?
             RETURNING {RECORD_COLUMNS}"
        );
        let updated = sqlx::query_as::<_, ObjectRecord>(&sql)
            .bind(id)
            .bind(max_downloads)
            .bind(now)
            .fetch_optional(&*self.db)
            .await?;
        Ok(updated)
    }

    /// Delete a row. Returns `false` if it was already gone.
    pub async fn delete(&self, id: &str) -> LedgerResult<bool> {
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Rows that are expired at `now` or have used up their downloads.
    ///
    /// Ordered by id; pass the last id seen as `after_id` to fetch the next
    /// page.
    pub async fn find_expired_or_exhausted(
        &self,
        now: DateTime<Utc>,
        max_downloads: i64,
        after_id: Option<&str>,
        limit: i64,
    ) -> LedgerResult<Vec<ObjectRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM files
             WHERE (expires_at <= ? OR download_count >= ?) AND id > ?
             ORDER BY id ASC
             LIMIT ?"
        );
        let rows = sqlx::query_as::<_, ObjectRecord>(&sql)
            .bind(now)
            .bind(max_downloads)
            .bind(after_id.unwrap_or(""))
            .bind(limit)
            .fetch_all(&*self.db)
            .await?;
        Ok(rows)
    }

    /// Count and total size of live rows.
    pub async fn aggregate_stats(&self) -> LedgerResult<LedgerStats> {
        let stats = sqlx::query_as::<_, LedgerStats>(
            "SELECT COUNT(*) AS total_files, COALESCE(SUM(size_bytes), 0) AS total_size
             FROM files",
        )
        .fetch_one(&*self.db)
        .await?;
        Ok(stats)
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
