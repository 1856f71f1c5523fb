//! src/services/blob_store.rs
//!
//! BlobStore: write-once payload storage on local disk. Each object lives at
//! `base_path/{shard}/{id}{ext}` where `shard` is the first two characters of
//! the id. Payloads are streamed to a temp file and renamed into place, so a
//! final path only ever holds a complete upload.

use crate::ids::is_valid_id;
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::SystemTime,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const TEMP_PREFIX: &str = ".tmp-";
const MAX_LOCATION_LEN: usize = 256;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob `{0}` not found")]
    NotFound(String),
    #[error("invalid blob location `{0}`")]
    InvalidLocation(String),
    #[error("upload exceeded the {limit} byte limit")]
    LimitExceeded { limit: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Where a completed upload ended up and how many bytes it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub location: String,
    pub size: u64,
}

/// What the orphan sweep found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobKind {
    /// A renamed, complete payload belonging to `id`.
    Object { id: String },
    /// A temp file from an upload that is in flight or was interrupted.
    Partial,
}

#[derive(Debug, Clone)]
pub struct BlobEntry {
    pub location: String,
    pub kind: BlobKind,
    pub modified: SystemTime,
}

#[derive(Clone, Debug)]
pub struct BlobStore {
    /// Base directory on disk where payloads are stored.
    pub base_path: PathBuf,
}

/// Removes a temp file when dropped unless disarmed.
///
/// Covers the case where the upload future is dropped mid-stream (client
/// went away and the server cancelled the handler).
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Blocking, but a single unlink. Drop may also run after the
            // runtime is gone, so no spawn_blocking here.
            if let Err(err) = std::fs::remove_file(&self.path) {
                if err.kind() != ErrorKind::NotFound {
                    debug!("failed to remove temp file {}: {}", self.path.display(), err);
                }
            }
        }
    }
}

impl BlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Create the base directory if it does not exist yet.
    pub async fn ensure_root(&self) -> BlobResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        Ok(())
    }

    /// Deterministic storage location for an id and extension.
    fn location_for(id: &str, extension: &str) -> String {
        format!("{}/{}{}", &id[..2], id, extension)
    }

    /// Reject locations that could escape `base_path`.
    fn ensure_location_safe(&self, location: &str) -> BlobResult<()> {
        let invalid = || BlobError::InvalidLocation(location.to_string());
        if location.is_empty() || location.len() > MAX_LOCATION_LEN {
            return Err(invalid());
        }
        if location.starts_with('/') || location.contains("..") {
            return Err(invalid());
        }
        if location
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(invalid());
        }
        Ok(())
    }

    fn blob_path(&self, location: &str) -> PathBuf {
        self.base_path.join(location)
    }

    /// Stream a payload to disk and return its location and measured size.
    ///
    /// - Writes to a temp file in the shard directory.
    /// - Aborts once more than `max_bytes` have arrived.
    /// - fsyncs, then renames into the final location.
    ///
    /// On any error no bytes are left behind.
    pub async fn put<S>(
        &self,
        id: &str,
        extension: &str,
        stream: S,
        max_bytes: Option<u64>,
    ) -> BlobResult<StoredBlob>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        if !is_valid_id(id) {
            return Err(BlobError::InvalidLocation(id.to_string()));
        }
        let location = Self::location_for(id, extension);
        self.ensure_location_safe(&location)?;

        let file_path = self.blob_path(&location);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            BlobError::InvalidLocation(location.clone())
        })?;
        let tmp_path = parent.join(format!("{}{}", TEMP_PREFIX, Uuid::new_v4()));
        let mut guard = TempFileGuard::new(tmp_path.clone());
        fs::create_dir_all(&parent).await?;
        let file = match File::create(&tmp_path).await {
            Ok(file) => file,
            // A concurrent delete pruned the empty shard directory.
            Err(err) if err.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&parent).await?;
                File::create(&tmp_path).await?
            }
            Err(err) => return Err(err.into()),
        };

        let size = write_stream(file, stream, max_bytes).await?;
        fs::rename(&tmp_path, &file_path).await?;
        guard.disarm();

        debug!("stored {} bytes at {}", size, file_path.display());
        Ok(StoredBlob { location, size })
    }

    /// Open a stored payload for streaming out.
    pub async fn open(&self, location: &str) -> BlobResult<File> {
        self.ensure_location_safe(location)?;
        File::open(self.blob_path(location))
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => BlobError::NotFound(location.to_string()),
                _ => BlobError::Io(err),
            })
    }

    /// Remove a payload. Returns `false` if it was already gone.
    pub async fn delete(&self, location: &str) -> BlobResult<bool> {
        self.ensure_location_safe(location)?;
        let file_path = self.blob_path(location);
        let removed = match fs::remove_file(&file_path).await {
            Ok(_) => {
                debug!("removed payload {}", file_path.display());
                true
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("payload {} already missing", file_path.display());
                false
            }
            Err(err) => return Err(BlobError::Io(err)),
        };

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(removed)
    }

    /// List every payload and temp file under `base_path`.
    ///
    /// Entries that do not look like ours are ignored.
    pub async fn scan(&self) -> BlobResult<Vec<BlobEntry>> {
        let mut entries = Vec::new();
        let mut shards = match fs::read_dir(&self.base_path).await {
            Ok(shards) => shards,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(entries),
            Err(err) => return Err(err.into()),
        };

        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let shard_name = shard.file_name().to_string_lossy().into_owned();
            let mut files = match fs::read_dir(shard.path()).await {
                Ok(files) => files,
                // Pruned by a concurrent delete.
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(file) = files.next_entry().await? {
                let meta = match file.metadata().await {
                    Ok(meta) if meta.is_file() => meta,
                    Ok(_) => continue,
                    // Removed between listing and stat.
                    Err(err) if err.kind() == ErrorKind::NotFound => continue,
                    Err(err) => return Err(err.into()),
                };
                let name = file.file_name().to_string_lossy().into_owned();
                let kind = if name.starts_with(TEMP_PREFIX) {
                    BlobKind::Partial
                } else {
                    let stem = name.split('.').next().unwrap_or_default();
                    if !is_valid_id(stem) || !stem.starts_with(&shard_name) {
                        continue;
                    }
                    BlobKind::Object {
                        id: stem.to_string(),
                    }
                };
                entries.push(BlobEntry {
                    location: format!("{}/{}", shard_name, name),
                    kind,
                    modified: meta.modified()?,
                });
            }
        }

        Ok(entries)
    }

    /// Remove empty shard directories up to (not including) `base_path`.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Copy `stream` into `file`, returning the number of bytes written.
async fn write_stream<S>(mut file: File, stream: S, max_bytes: Option<u64>) -> BlobResult<u64>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let mut written: u64 = 0;
    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        written += chunk.len() as u64;
        if let Some(limit) = max_bytes {
            if written > limit {
                return Err(BlobError::LimitExceeded { limit });
            }
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}
