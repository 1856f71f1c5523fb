//! src/services/lifecycle.rs
//!
//! LifecycleEngine: admission, retrieval and eviction of uploaded files.
//!
//! An object moves `Uploading -> Available -> removed` and never comes back.
//! Bytes are written before the ledger row is committed, and removed again if
//! the commit fails, so a row never promises a download that would 404.
//! Lazy eviction on access and the background reclaimer both go through
//! [`LifecycleEngine::evict_if_due`].

use crate::{
    ids::{generate_id, is_valid_id},
    models::record::{LedgerStats, NewRecord, ObjectRecord},
    services::{
        blob_store::{BlobError, BlobStore},
        ledger::{Ledger, LedgerError},
    },
};
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use futures::Stream;
use std::{io, path::Path, time::Duration};
use thiserror::Error;
use tokio::fs::File;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_MAX_DOWNLOADS: i64 = 1;
pub const DEFAULT_TTL: Duration = Duration::from_secs(3 * 24 * 60 * 60);

const FALLBACK_EXTENSION: &str = ".bin";
const MAX_EXTENSION_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("payload exceeds the {limit} byte upload limit")]
    PayloadTooLarge { limit: u64 },
    #[error("file `{0}` not found")]
    NotFound(String),
    #[error("file `{0}` is no longer available")]
    Gone(String),
    #[error("failed to persist metadata for `{id}`")]
    MetadataPersist {
        id: String,
        #[source]
        source: LedgerError,
    },
    #[error(transparent)]
    Storage(#[from] BlobError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Limits applied to every object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_upload_bytes: u64,
    pub max_downloads: i64,
    pub ttl: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            max_downloads: DEFAULT_MAX_DOWNLOADS,
            ttl: DEFAULT_TTL,
        }
    }
}

impl RetentionPolicy {
    /// Expiry for an object admitted at `uploaded_at`.
    ///
    /// Capped at the end of year 9999: expiries are compared as RFC 3339 text
    /// in the ledger, and larger years no longer sort correctly.
    pub fn expiry_after(&self, uploaded_at: DateTime<Utc>) -> DateTime<Utc> {
        let latest = latest_expiry();
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| uploaded_at.checked_add_signed(ttl))
            .filter(|expiry| *expiry <= latest)
            .unwrap_or(latest)
    }
}

fn latest_expiry() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .and_then(|date| date.and_hms_opt(23, 59, 59))
        .map(|naive| naive.and_utc())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Client-supplied details that accompany an upload body.
#[derive(Debug, Clone, Default)]
pub struct UploadMeta {
    pub original_name: String,
    pub mime_type: Option<String>,
    pub owner_address: Option<String>,
    /// Size the client claims to send, e.g. from `Content-Length`. Only used
    /// for the early rejection; the measured size is authoritative.
    pub declared_size: Option<u64>,
}

/// Why an object is no longer servable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueReason {
    Expired,
    Exhausted,
}

/// A claimed download: the counter has already been bumped.
#[derive(Debug)]
pub struct Download {
    pub record: ObjectRecord,
    pub file: File,
}

#[derive(Clone)]
pub struct LifecycleEngine {
    ledger: Ledger,
    blobs: BlobStore,
    policy: RetentionPolicy,
}

impl LifecycleEngine {
    pub fn new(ledger: Ledger, blobs: BlobStore, policy: RetentionPolicy) -> Self {
        Self {
            ledger,
            blobs,
            policy,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Admit a new upload.
    ///
    /// Rejects early on an oversized declared size, streams the body to the
    /// blob store, re-checks the measured size, then commits the ledger row.
    /// If anything after the write fails the bytes are removed again.
    pub async fn store<S>(&self, meta: UploadMeta, stream: S) -> LifecycleResult<ObjectRecord>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let limit = self.policy.max_upload_bytes;
        if meta.declared_size.is_some_and(|declared| declared > limit) {
            debug!("rejecting upload with declared size {:?}", meta.declared_size);
            return Err(LifecycleError::PayloadTooLarge { limit });
        }

        let id = generate_id();
        let extension = extension_of(&meta.original_name);

        let stored = match self.blobs.put(&id, &extension, stream, Some(limit)).await {
            Ok(stored) => stored,
            Err(BlobError::LimitExceeded { .. }) => {
                return Err(LifecycleError::PayloadTooLarge { limit });
            }
            Err(err) => return Err(err.into()),
        };

        if stored.size > limit {
            self.discard(&stored.location).await;
            return Err(LifecycleError::PayloadTooLarge { limit });
        }

        let uploaded_at = Utc::now();
        let record = NewRecord {
            id: id.clone(),
            original_name: meta.original_name,
            storage_location: stored.location.clone(),
            size_bytes: stored.size as i64,
            mime_type: meta.mime_type,
            extension,
            uploaded_at,
            expires_at: self.policy.expiry_after(uploaded_at),
            owner_address: meta.owner_address,
        };

        match self.ledger.insert(record).await {
            Ok(record) => {
                info!(
                    "admitted {} ({} bytes), expires {}",
                    record.id, record.size_bytes, record.expires_at
                );
                Ok(record)
            }
            Err(source) => {
                warn!("metadata commit for {} failed, rolling back: {}", id, source);
                self.discard(&stored.location).await;
                Err(LifecycleError::MetadataPersist { id, source })
            }
        }
    }

    /// Claim a download of `id` and open its bytes for streaming.
    pub async fn retrieve(&self, id: &str) -> LifecycleResult<Download> {
        self.retrieve_at(id, Utc::now()).await
    }

    /// [`retrieve`](Self::retrieve) evaluated at a fixed instant.
    ///
    /// The counter is incremented before the caller streams anything, so an
    /// interrupted download still uses up its slot.
    pub async fn retrieve_at(&self, id: &str, now: DateTime<Utc>) -> LifecycleResult<Download> {
        let record = self.lookup(id).await?;
        if self.evict_due_for_access(&record, now).await {
            return Err(LifecycleError::Gone(record.id));
        }

        let file = match self.blobs.open(&record.storage_location).await {
            Ok(file) => file,
            Err(BlobError::NotFound(_)) => {
                warn!("ledger row {} has no bytes, dropping it", record.id);
                self.ledger.delete(&record.id).await?;
                return Err(LifecycleError::NotFound(record.id));
            }
            Err(err) => return Err(err.into()),
        };

        match self
            .ledger
            .increment_download(&record.id, self.policy.max_downloads, now)
            .await?
        {
            Some(claimed) => {
                debug!(
                    "download {}/{} of {}",
                    claimed.download_count, self.policy.max_downloads, claimed.id
                );
                Ok(Download {
                    record: claimed,
                    file,
                })
            }
            None => {
                // Lost a race for the last download, or a sweep got here first.
                drop(file);
                match self.ledger.find_by_id(&record.id).await {
                    Ok(current) => {
                        self.evict_due_for_access(&current, now).await;
                        Err(LifecycleError::Gone(record.id))
                    }
                    Err(LedgerError::NotFound(_)) => Err(LifecycleError::NotFound(record.id)),
                    Err(err) => Err(err.into()),
                }
            }
        }
    }

    /// Read a record without touching it.
    pub async fn describe(&self, id: &str) -> LifecycleResult<ObjectRecord> {
        self.lookup(id).await
    }

    pub async fn stats(&self) -> LifecycleResult<LedgerStats> {
        Ok(self.ledger.aggregate_stats().await?)
    }

    /// Evict `record` if it is expired or out of downloads at `now`.
    pub async fn evict_if_due(
        &self,
        record: &ObjectRecord,
        now: DateTime<Utc>,
    ) -> LifecycleResult<Option<DueReason>> {
        let reason = if record.is_expired_at(now) {
            DueReason::Expired
        } else if record.is_exhausted(self.policy.max_downloads) {
            DueReason::Exhausted
        } else {
            return Ok(None);
        };

        self.evict(record).await?;
        debug!("evicted {} ({:?})", record.id, reason);
        Ok(Some(reason))
    }

    /// Remove the ledger row and then the bytes.
    ///
    /// The row goes first so the object stops being servable immediately;
    /// bytes left behind by a failure here are picked up by the orphan sweep.
    pub async fn evict(&self, record: &ObjectRecord) -> LifecycleResult<()> {
        self.ledger.delete(&record.id).await?;
        self.blobs.delete(&record.storage_location).await?;
        Ok(())
    }

    /// Eviction on the request path: failures are logged, the caller still
    /// answers `Gone`.
    async fn evict_due_for_access(&self, record: &ObjectRecord, now: DateTime<Utc>) -> bool {
        match self.evict_if_due(record, now).await {
            Ok(reason) => reason.is_some(),
            Err(err) => {
                warn!("lazy eviction of {} failed: {}", record.id, err);
                true
            }
        }
    }

    async fn lookup(&self, id: &str) -> LifecycleResult<ObjectRecord> {
        if !is_valid_id(id) {
            return Err(LifecycleError::NotFound(id.to_string()));
        }
        self.ledger.find_by_id(id).await.map_err(|err| match err {
            LedgerError::NotFound(id) => LifecycleError::NotFound(id),
            other => LifecycleError::Ledger(other),
        })
    }

    /// Best-effort removal of bytes that will never get a ledger row.
    async fn discard(&self, location: &str) {
        if let Err(err) = self.blobs.delete(location).await {
            warn!("failed to discard {}: {}", location, err);
        }
    }
}

/// Extension of an uploaded filename including the dot, lowercased.
///
/// Falls back to `.bin` for missing or unusual extensions.
pub fn extension_of(original_name: &str) -> String {
    Path::new(original_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| {
            !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.bytes().all(|b| b.is_ascii_alphanumeric())
        })
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_else(|| FALLBACK_EXTENSION.to_string())
}
