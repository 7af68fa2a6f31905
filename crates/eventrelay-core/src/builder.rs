//! Fluent builder API for pipeline configuration.
//!
//! # Example
//!
//! ```rust
//! use eventrelay_core::PipelineBuilder;
//!
//! let config = PipelineBuilder::new()
//!     .id("1:0xbridge")
//!     .poll_interval_ms(15_000)
//!     .start_block_offset(100)
//!     .max_attempts(5)
//!     .base_delay_ms(500)
//!     .build_config()
//!     .expect("valid config");
//! assert_eq!(config.relayer.retry.max_attempts, 5);
//! ```

use crate::config::PipelineConfig;
use crate::error::RelayError;

/// Fluent builder for [`PipelineConfig`].
#[derive(Default)]
pub struct PipelineBuilder {
    config: PipelineConfig,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
        }
    }

    /// Set the stream id (log label and progress key).
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    /// Set the sleep between cycles in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    /// Set how far behind the head a first run starts.
    pub fn start_block_offset(mut self, blocks: u64) -> Self {
        self.config.start_block_offset = blocks;
        self
    }

    /// Set the timeout for each chain query in milliseconds.
    pub fn chain_timeout_ms(mut self, ms: u64) -> Self {
        self.config.chain_timeout_ms = ms;
        self
    }

    /// Set the widest block range scanned in one cycle.
    pub fn max_blocks_per_cycle(mut self, blocks: u64) -> Self {
        self.config.max_blocks_per_cycle = blocks;
        self
    }

    /// Set the redelivery queue capacity.
    pub fn max_pending(mut self, n: usize) -> Self {
        self.config.max_pending = n;
        self
    }

    /// Set the total number of relay attempts per payload.
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.relayer.retry.max_attempts = n;
        self
    }

    /// Set the delay before the second relay attempt in milliseconds.
    pub fn base_delay_ms(mut self, ms: u64) -> Self {
        self.config.relayer.retry.base_delay_ms = ms;
        self
    }

    /// Set the cap on any single backoff delay in milliseconds.
    pub fn max_delay_ms(mut self, ms: u64) -> Self {
        self.config.relayer.retry.max_delay_ms = ms;
        self
    }

    /// Set the timeout for a single relay request in milliseconds.
    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.relayer.request_timeout_ms = ms;
        self
    }

    /// Validate and build the [`PipelineConfig`].
    pub fn build_config(self) -> Result<PipelineConfig, RelayError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
