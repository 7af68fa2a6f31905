//! Deduplication policy: which key identifies an event, and whether it was seen.

use std::sync::Arc;

use crate::error::RelayError;
use crate::store::ProgressStore;
use crate::types::NormalizedPayload;

/// Decides whether a payload still needs to be relayed.
///
/// The key is the payload's `transaction_id`; membership is delegated to the
/// [`ProgressStore`].
#[derive(Clone)]
pub struct Deduplicator {
    store: Arc<dyn ProgressStore>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn ProgressStore>) -> Self {
        Self { store }
    }

    /// The dedup key for a payload.
    pub fn key(payload: &NormalizedPayload) -> &str {
        &payload.transaction_id
    }

    /// Returns `true` if the payload has not been delivered yet.
    pub async fn is_new(&self, payload: &NormalizedPayload) -> Result<bool, RelayError> {
        Ok(!self.store.has_processed(Self::key(payload)).await?)
    }
}
