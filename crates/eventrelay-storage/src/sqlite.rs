//! SQLite progress store.
//!
//! Persists scan checkpoints and relayed transaction ids to a single SQLite
//! file, keyed by stream id. Uses `sqlx` with WAL mode.
//!
//! # Usage
//! ```rust,no_run
//! use eventrelay_storage::sqlite::SqliteProgressStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteProgressStore::open("./relay.db", "1:0xbridge").await?;
//! let scratch = SqliteProgressStore::in_memory("1:0xbridge").await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use eventrelay_core::error::RelayError;
use eventrelay_core::store::ProgressStore;
use eventrelay_core::types::ProgressRecord;

use crate::ProgressSnapshot;

fn store_err(e: sqlx::Error) -> RelayError {
    RelayError::Store(e.to_string())
}

fn to_i64(block: u64) -> Result<i64, RelayError> {
    i64::try_from(block).map_err(|_| RelayError::Store(format!("block {block} out of range")))
}

/// SQLite-backed progress for one stream.
pub struct SqliteProgressStore {
    pool: SqlitePool,
    stream_id: String,
}

impl SqliteProgressStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./relay.db"`) or a full
    /// SQLite URL (`"sqlite:./relay.db?mode=rwc"`).
    pub async fn open(path: &str, stream_id: impl Into<String>) -> Result<Self, RelayError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePool::connect(&url).await.map_err(store_err)?;
        Self::with_pool(pool, stream_id).await
    }

    /// Open an in-memory database. All data is lost when the store is dropped.
    pub async fn in_memory(stream_id: impl Into<String>) -> Result<Self, RelayError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(store_err)?;
        Self::with_pool(pool, stream_id).await
    }

    async fn with_pool(pool: SqlitePool, stream_id: impl Into<String>) -> Result<Self, RelayError> {
        let store = Self {
            pool,
            stream_id: stream_id.into(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), RelayError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                stream_id    TEXT    NOT NULL PRIMARY KEY,
                block_number INTEGER NOT NULL,
                updated_at   INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS relayed_ids (
                stream_id  TEXT    NOT NULL,
                tx_id      TEXT    NOT NULL,
                relayed_at INTEGER NOT NULL,
                PRIMARY KEY (stream_id, tx_id)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    /// Forget the scan checkpoint. Relayed ids are kept.
    pub async fn reset_checkpoint(&self) -> Result<(), RelayError> {
        sqlx::query("DELETE FROM checkpoints WHERE stream_id = ?")
            .bind(&self.stream_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    pub async fn relayed_count(&self) -> Result<u64, RelayError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM relayed_ids WHERE stream_id = ?")
            .bind(&self.stream_id)
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.get::<i64, _>("cnt") as u64)
    }

    pub async fn snapshot(&self) -> Result<ProgressSnapshot, RelayError> {
        let row = sqlx::query(
            "SELECT block_number, updated_at FROM checkpoints WHERE stream_id = ?",
        )
        .bind(&self.stream_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(ProgressSnapshot {
            stream_id: self.stream_id.clone(),
            last_scanned_block: row.as_ref().map(|r| r.get::<i64, _>("block_number") as u64),
            relayed_count: self.relayed_count().await?,
            updated_at: row.and_then(|r| DateTime::<Utc>::from_timestamp(r.get("updated_at"), 0)),
        })
    }
}

#[async_trait]
impl ProgressStore for SqliteProgressStore {
    async fn load(&self) -> Result<Option<ProgressRecord>, RelayError> {
        let row = sqlx::query("SELECT block_number FROM checkpoints WHERE stream_id = ?")
            .bind(&self.stream_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        let Some(row) = row else {
            return Ok(None);
        };

        let ids = sqlx::query("SELECT tx_id FROM relayed_ids WHERE stream_id = ?")
            .bind(&self.stream_id)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

        Ok(Some(ProgressRecord {
            last_scanned_block: row.get::<i64, _>("block_number") as u64,
            relayed_ids: ids.iter().map(|r| r.get::<String, _>("tx_id")).collect(),
        }))
    }

    async fn record_range(&self, to_block: u64) -> Result<(), RelayError> {
        sqlx::query(
            "INSERT INTO checkpoints (stream_id, block_number, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT (stream_id) DO UPDATE SET
                block_number = MAX(block_number, excluded.block_number),
                updated_at   = excluded.updated_at",
        )
        .bind(&self.stream_id)
        .bind(to_i64(to_block)?)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        debug!(stream_id = %self.stream_id, block = to_block, "checkpoint saved");
        Ok(())
    }

    async fn has_processed(&self, id: &str) -> Result<bool, RelayError> {
        let row = sqlx::query("SELECT 1 FROM relayed_ids WHERE stream_id = ? AND tx_id = ?")
            .bind(&self.stream_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.is_some())
    }

    async fn mark_processed(&self, id: &str) -> Result<(), RelayError> {
        sqlx::query(
            "INSERT OR IGNORE INTO relayed_ids (stream_id, tx_id, relayed_at) VALUES (?, ?, ?)",
        )
        .bind(&self.stream_id)
        .bind(id)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }
}
