//! Progress store: the durable record of how far the relay has scanned
//! and which transaction ids it has already delivered.
//!
//! Two checkpoints live here on purpose. `last_scanned_block` is a coarse
//! resumption hint; the relayed-id set is what actually prevents a second
//! delivery. A crash between [`ProgressStore::mark_processed`] and
//! [`ProgressStore::record_range`] therefore rescans the range, and the
//! marked ids are filtered out again.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::error::RelayError;
use crate::types::ProgressRecord;

/// Trait for persisting relay progress.
///
/// Implementations include `MemoryProgressStore` (here), and
/// `FileProgressStore` / `SqliteProgressStore` in `eventrelay-storage`.
/// Each write must be atomic from the caller's point of view.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Load persisted progress. `None` means no range has ever been recorded.
    async fn load(&self) -> Result<Option<ProgressRecord>, RelayError>;

    /// Advance `last_scanned_block` to `to_block`. Lower values are ignored.
    async fn record_range(&self, to_block: u64) -> Result<(), RelayError>;

    /// Returns `true` if `id` was marked as delivered.
    async fn has_processed(&self, id: &str) -> Result<bool, RelayError>;

    /// Mark `id` as delivered. Idempotent.
    async fn mark_processed(&self, id: &str) -> Result<(), RelayError>;
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryState {
    last_scanned_block: Option<u64>,
    relayed_ids: BTreeSet<String>,
}

/// In-memory progress store for tests and dry runs.
///
/// Not durable: everything is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    state: Mutex<MemoryState>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store as if a previous run had scanned up to `block`.
    pub fn with_checkpoint(block: u64) -> Self {
        let store = Self::default();
        store.lock().last_scanned_block = Some(block);
        store
    }

    /// Snapshot of the relayed ids.
    pub fn relayed_ids(&self) -> BTreeSet<String> {
        self.lock().relayed_ids.clone()
    }

    /// Current checkpoint, if any.
    pub fn last_scanned_block(&self) -> Option<u64> {
        self.lock().last_scanned_block
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock only means another test thread panicked mid-write.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn load(&self) -> Result<Option<ProgressRecord>, RelayError> {
        let state = self.lock();
        Ok(state.last_scanned_block.map(|block| ProgressRecord {
            last_scanned_block: block,
            relayed_ids: state.relayed_ids.clone(),
        }))
    }

    async fn record_range(&self, to_block: u64) -> Result<(), RelayError> {
        let mut state = self.lock();
        let next = state.last_scanned_block.map_or(to_block, |b| b.max(to_block));
        state.last_scanned_block = Some(next);
        Ok(())
    }

    async fn has_processed(&self, id: &str) -> Result<bool, RelayError> {
        Ok(self.lock().relayed_ids.contains(id))
    }

    async fn mark_processed(&self, id: &str) -> Result<(), RelayError> {
        self.lock().relayed_ids.insert(id.to_string());
        Ok(())
    }
}
