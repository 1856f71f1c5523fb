//! Ledger rows describing uploaded files.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// A single uploaded file as recorded in the ledger.
///
/// The bytes live in the blob store under `storage_location`; this struct is
/// only the metadata. A row exists exactly as long as the bytes are expected
/// to exist.
#[derive(Serialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct ObjectRecord {
    /// Ledger row number, assigned on insert and never reused.
    pub seq: i64,

    /// Public random token used in download links.
    pub id: String,

    /// Filename supplied by the uploader. Untrusted, display only.
    pub original_name: String,

    /// Key into the blob store, derived from `id` and `extension`.
    pub storage_location: String,

    /// Bytes actually written to disk.
    pub size_bytes: i64,

    /// Content type supplied by the uploader.
    pub mime_type: Option<String>,

    /// Extension including the leading dot, e.g. `.tar.gz` is stored as `.gz`.
    pub extension: String,

    pub uploaded_at: DateTime<Utc>,

    /// Fixed at upload time, never extended.
    pub expires_at: DateTime<Utc>,

    /// Number of downloads started so far.
    pub download_count: i64,

    /// Client address at upload time.
    pub owner_address: Option<String>,
}

impl ObjectRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_exhausted(&self, max_downloads: i64) -> bool {
        self.download_count >= max_downloads
    }
}

/// Fields supplied when admitting a new upload.
#[derive(Clone, Debug)]
pub struct NewRecord {
    pub id: String,
    pub original_name: String,
    pub storage_location: String,
    pub size_bytes: i64,
    pub mime_type: Option<String>,
    pub extension: String,
    pub uploaded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub owner_address: Option<String>,
}

/// Aggregate counters over every live row.
#[derive(Serialize, Clone, Copy, FromRow, Debug, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub total_files: i64,
    pub total_size: i64,
}
