//! JSON-file progress store.
//!
//! One document holds the progress of every stream, keyed by stream id:
//!
//! ```json
//! {
//!   "streams": {
//!     "1:0x5FbDB2315678afecb367f032d93F642f64180aa3": {
//!       "last_scanned_block": 19000000,
//!       "relayed_ids": ["0xab…"],
//!       "updated_at": "2026-01-01T00:00:00Z"
//!     }
//!   }
//! }
//! ```
//!
//! Every write takes an exclusive lock on `<path>.lock`, re-reads the
//! document, changes only its own stream's entry and writes the result to a
//! sibling temp file which is synced and renamed over the original. Handles in
//! other tasks or processes therefore never overwrite each other's progress,
//! and readers only ever see a complete document.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use eventrelay_core::error::RelayError;
use eventrelay_core::store::ProgressStore;
use eventrelay_core::types::ProgressRecord;

use crate::ProgressSnapshot;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StreamProgress {
    #[serde(default)]
    last_scanned_block: Option<u64>,
    #[serde(default)]
    relayed_ids: BTreeSet<String>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    streams: BTreeMap<String, StreamProgress>,
}

/// Progress store persisted as a JSON document on local disk.
pub struct FileProgressStore {
    path: PathBuf,
    stream_id: String,
    /// This stream's entry as of the last read or write through this handle.
    cached: Mutex<StreamProgress>,
}

impl FileProgressStore {
    /// Open the document at `path` (created on first write) and bind to `stream_id`.
    pub async fn open(path: impl AsRef<Path>, stream_id: impl Into<String>) -> Result<Self, RelayError> {
        let path = path.as_ref().to_path_buf();
        let stream_id = stream_id.into();
        let stream = read_stream(&path, &stream_id).await?;
        Ok(Self {
            path,
            stream_id,
            cached: Mutex::new(stream),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> Result<ProgressSnapshot, RelayError> {
        let stream = self.refresh().await?;
        Ok(ProgressSnapshot {
            stream_id: self.stream_id.clone(),
            last_scanned_block: stream.last_scanned_block,
            relayed_count: stream.relayed_ids.len() as u64,
            updated_at: stream.updated_at,
        })
    }

    /// Forget the scan checkpoint. Relayed ids are kept.
    pub async fn reset_checkpoint(&self) -> Result<(), RelayError> {
        self.update(|s| s.last_scanned_block = None).await
    }

    /// Re-read this stream's entry from disk.
    async fn refresh(&self) -> Result<StreamProgress, RelayError> {
        let mut cached = self.cached.lock().await;
        *cached = read_stream(&self.path, &self.stream_id).await?;
        Ok(cached.clone())
    }

    /// Apply `f` to this stream's entry on disk under the file lock. The
    /// cached entry only changes once the write has landed.
    async fn update<F>(&self, f: F) -> Result<(), RelayError>
    where
        F: FnOnce(&mut StreamProgress) + Send + 'static,
    {
        let mut cached = self.cached.lock().await;
        let path = self.path.clone();
        let stream_id = self.stream_id.clone();
        let stream = tokio::task::spawn_blocking(move || locked_update(&path, &stream_id, f))
            .await
            .map_err(|e| RelayError::Store(format!("progress write task failed: {e}")))??;
        *cached = stream;
        Ok(())
    }
}

async fn read_stream(path: &Path, stream_id: &str) -> Result<StreamProgress, RelayError> {
    let path = path.to_path_buf();
    let stream_id = stream_id.to_string();
    tokio::task::spawn_blocking(move || {
        let mut doc = read_document(&path)?;
        Ok(doc.streams.remove(&stream_id).unwrap_or_default())
    })
    .await
    .map_err(|e| RelayError::Store(format!("progress read task failed: {e}")))?
}

fn read_document(path: &Path) -> Result<Document, RelayError> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
            RelayError::Store(format!("corrupt progress file {}: {e}", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Document::default()),
        Err(e) => Err(RelayError::Store(format!(
            "cannot read progress file {}: {e}",
            path.display()
        ))),
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Read-modify-write of one stream entry while holding `<path>.lock`.
fn locked_update(
    path: &Path,
    stream_id: &str,
    f: impl FnOnce(&mut StreamProgress),
) -> Result<StreamProgress, RelayError> {
    let lock_at = lock_path(path);
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&lock_at)
        .map_err(|e| RelayError::Store(format!("cannot open {}: {e}", lock_at.display())))?;
    let mut lock = fd_lock::RwLock::new(lock_file);
    let _guard = lock
        .write()
        .map_err(|e| RelayError::Store(format!("cannot lock {}: {e}", lock_at.display())))?;

    let mut doc = read_document(path)?;
    let stream = doc.streams.entry(stream_id.to_string()).or_default();
    f(stream);
    stream.updated_at = Some(Utc::now());
    let updated = stream.clone();
    write_document(path, &doc)?;
    Ok(updated)
}

fn write_document(path: &Path, doc: &Document) -> Result<(), RelayError> {
    let bytes = serde_json::to_vec_pretty(doc).map_err(|e| RelayError::Store(e.to_string()))?;
    let tmp = path.with_extension("tmp");
    let store_err =
        |e: std::io::Error| RelayError::Store(format!("cannot write {}: {e}", tmp.display()));

    let mut file = std::fs::File::create(&tmp).map_err(store_err)?;
    file.write_all(&bytes).map_err(store_err)?;
    file.sync_all().map_err(store_err)?;
    drop(file);
    std::fs::rename(&tmp, path)
        .map_err(|e| RelayError::Store(format!("cannot replace {}: {e}", path.display())))?;
    debug!(path = %path.display(), "progress file written");
    Ok(())
}

#[async_trait]
impl ProgressStore for FileProgressStore {
    async fn load(&self) -> Result<Option<ProgressRecord>, RelayError> {
        let stream = self.refresh().await?;
        Ok(stream.last_scanned_block.map(|block| ProgressRecord {
            last_scanned_block: block,
            relayed_ids: stream.relayed_ids,
        }))
    }

    async fn record_range(&self, to_block: u64) -> Result<(), RelayError> {
        self.update(move |s| {
            s.last_scanned_block = Some(s.last_scanned_block.map_or(to_block, |b| b.max(to_block)));
        })
        .await
    }

    async fn has_processed(&self, id: &str) -> Result<bool, RelayError> {
        Ok(self.cached.lock().await.relayed_ids.contains(id))
    }

    async fn mark_processed(&self, id: &str) -> Result<(), RelayError> {
        if self.has_processed(id).await? {
            return Ok(());
        }
        let id = id.to_string();
        self.update(move |s| {
            s.relayed_ids.insert(id);
        })
        .await
    }
}
