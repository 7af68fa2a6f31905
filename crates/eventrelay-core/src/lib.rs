//! eventrelay-core: the ingestion, dedup and relay pipeline.
//!
//! # Architecture
//!
//! ```text
//! PipelineBuilder → Pipeline
//!                      ├── ChainReader    (head height, events in a block range)
//!                      ├── Deduplicator   (transaction-id policy)
//!                      ├── Relayer        (bounded retry + exponential backoff)
//!                      └── ProgressStore  (scan checkpoint + relayed ids)
//! ```

pub mod builder;
pub mod chain;
pub mod config;
pub mod dedup;
pub mod error;
pub mod pipeline;
pub mod relayer;
pub mod store;
pub mod types;

pub use builder::PipelineBuilder;
pub use chain::ChainReader;
pub use config::{PipelineConfig, PipelineState};
pub use dedup::Deduplicator;
pub use error::{DeliveryError, RelayError};
pub use pipeline::{CycleOutcome, CycleReport, Pipeline};
pub use relayer::{RelayTransport, Relayer, RelayerConfig, RetryConfig, RetryPolicy};
pub use store::{MemoryProgressStore, ProgressStore};
pub use types::{BlockRange, NormalizedPayload, ProgressRecord, RawEvent};
