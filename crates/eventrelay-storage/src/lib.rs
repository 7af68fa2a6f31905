//! eventrelay-storage: durable progress stores for EventRelay.
//!
//! Backends:
//! - [`file`]: a single JSON document, locked and atomically replaced on every write
//! - [`sqlite`]: SQLite via `sqlx` (feature `sqlite`)
//!
//! Both key their data by stream id (`<chain-id>:<contract>`), so several
//! relays can share one file or database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use eventrelay_core::error::RelayError;
use eventrelay_core::store::ProgressStore;
use eventrelay_core::types::ProgressRecord;

pub mod file;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use file::FileProgressStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteProgressStore;

/// Read-only view of one stream's progress, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub stream_id: String,
    pub last_scanned_block: Option<u64>,
    pub relayed_count: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Where progress lives, parsed from a location string.
///
/// `sqlite:<path>` selects SQLite; anything else is a JSON file path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    File(String),
    Sqlite(String),
}

impl std::str::FromStr for StoreLocation {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RelayError::Config("progress store location is empty".into()));
        }
        Ok(match s.strip_prefix("sqlite:") {
            Some(path) if !path.is_empty() => Self::Sqlite(path.to_string()),
            Some(_) => return Err(RelayError::Config("sqlite location needs a path".into())),
            None => Self::File(s.to_string()),
        })
    }
}

impl std::fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(path) => write!(f, "{path}"),
            Self::Sqlite(path) => write!(f, "sqlite:{path}"),
        }
    }
}

/// A progress store opened from a [`StoreLocation`].
pub enum ProgressBackend {
    File(FileProgressStore),
    #[cfg(feature = "sqlite")]
    Sqlite(SqliteProgressStore),
}

impl ProgressBackend {
    pub async fn open(location: &StoreLocation, stream_id: &str) -> Result<Self, RelayError> {
        match location {
            StoreLocation::File(path) => {
                Ok(Self::File(FileProgressStore::open(path, stream_id).await?))
            }
            #[cfg(feature = "sqlite")]
            StoreLocation::Sqlite(path) => {
                Ok(Self::Sqlite(SqliteProgressStore::open(path, stream_id).await?))
            }
            #[cfg(not(feature = "sqlite"))]
            StoreLocation::Sqlite(_) => Err(RelayError::Config(
                "built without the `sqlite` feature".into(),
            )),
        }
    }

    pub async fn snapshot(&self) -> Result<ProgressSnapshot, RelayError> {
        match self {
            Self::File(s) => s.snapshot().await,
            #[cfg(feature = "sqlite")]
            Self::Sqlite(s) => s.snapshot().await,
        }
    }

    /// Forget the scan checkpoint so the next run starts from the head offset.
    /// Relayed ids are kept.
    pub async fn reset_checkpoint(&self) -> Result<(), RelayError> {
        match self {
            Self::File(s) => s.reset_checkpoint().await,
            #[cfg(feature = "sqlite")]
            Self::Sqlite(s) => s.reset_checkpoint().await,
        }
    }

    fn inner(&self) -> &dyn ProgressStore {
        match self {
            Self::File(s) => s,
            #[cfg(feature = "sqlite")]
            Self::Sqlite(s) => s,
        }
    }
}

#[async_trait]
impl ProgressStore for ProgressBackend {
    async fn load(&self) -> Result<Option<ProgressRecord>, RelayError> {
        self.inner().load().await
    }

    async fn record_range(&self, to_block: u64) -> Result<(), RelayError> {
        self.inner().record_range(to_block).await
    }

    async fn has_processed(&self, id: &str) -> Result<bool, RelayError> {
        self.inner().has_processed(id).await
    }

    async fn mark_processed(&self, id: &str) -> Result<(), RelayError> {
        self.inner().mark_processed(id).await
    }
}
