//! The chain query capability consumed by the pipeline.

use async_trait::async_trait;

use crate::error::RelayError;
use crate::types::{BlockRange, RawEvent};

/// Read-only access to the monitored event stream on one chain.
///
/// A reader is bound to a contract address and event signature when it is
/// built; it does no filtering beyond that.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Current chain head height.
    ///
    /// Fails with [`RelayError::Connectivity`] if the node is unreachable.
    async fn current_height(&self) -> Result<u64, RelayError>;

    /// All matching events in `range`, ordered by `(block_number, log_index)`
    /// ascending.
    ///
    /// Fails with [`RelayError::ChainQuery`] if `range.from > range.to` or the
    /// node rejects the query, and with [`RelayError::Connectivity`] on
    /// network faults.
    async fn fetch_events(&self, range: BlockRange) -> Result<Vec<RawEvent>, RelayError>;
}
