//! Pipeline configuration and state types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::RelayError;
use crate::relayer::RelayerConfig;

/// Configuration for a [`Pipeline`](crate::pipeline::Pipeline) instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Stream name used in logs and as the progress key (e.g. `"1:0xbridge"`).
    pub id: String,
    /// Sleep between polling cycles (milliseconds).
    pub poll_interval_ms: u64,
    /// On first run, start this many blocks behind the current head.
    pub start_block_offset: u64,
    /// Bound on each chain query (milliseconds).
    pub chain_timeout_ms: u64,
    /// Widest block range scanned in one cycle.
    pub max_blocks_per_cycle: u64,
    /// Capacity of the in-memory redelivery queue.
    pub max_pending: usize,
    pub relayer: RelayerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            id: "default".into(),
            poll_interval_ms: 15_000,
            start_block_offset: 100,
            chain_timeout_ms: 30_000,
            max_blocks_per_cycle: 2_000,
            max_pending: 1_024,
            relayer: RelayerConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn chain_timeout(&self) -> Duration {
        Duration::from_millis(self.chain_timeout_ms)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), RelayError> {
        let retry = &self.relayer.retry;
        if retry.max_attempts == 0 {
            return Err(RelayError::Config("max relay attempts must be at least 1".into()));
        }
        if retry.base_delay_ms > retry.max_delay_ms {
            return Err(RelayError::Config(format!(
                "base delay {}ms exceeds max delay {}ms",
                retry.base_delay_ms, retry.max_delay_ms
            )));
        }
        if self.chain_timeout_ms == 0 || self.relayer.request_timeout_ms == 0 {
            return Err(RelayError::Config("timeouts must be non-zero".into()));
        }
        if self.max_blocks_per_cycle == 0 {
            return Err(RelayError::Config("max blocks per cycle must be at least 1".into()));
        }
        if self.max_pending == 0 {
            return Err(RelayError::Config("redelivery queue capacity must be at least 1".into()));
        }
        Ok(())
    }
}

/// Where the pipeline is within its polling cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    /// Loading progress; entered once at startup.
    Initializing,
    /// Between cycles.
    Idle,
    RangeComputed,
    EventsFetched,
    EventsFiltered,
    Delivering,
    Checkpointing,
    /// Shut down by cancellation.
    Stopped,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Idle => write!(f, "idle"),
            Self::RangeComputed => write!(f, "range-computed"),
            Self::EventsFetched => write!(f, "events-fetched"),
            Self::EventsFiltered => write!(f, "events-filtered"),
            Self::Delivering => write!(f, "delivering"),
            Self::Checkpointing => write!(f, "checkpointing"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
