//! eventrelay-evm: EVM chain reader for the relay pipeline.
//!
//! Polls a JSON-RPC node with `eth_blockNumber` / `eth_getLogs` and decodes
//! the bridge contract's `TokensLocked` logs into [`RawEvent`]s.
//!
//! [`RawEvent`]: eventrelay_core::types::RawEvent

pub mod log;
pub mod reader;
pub mod rpc;
pub mod tokens_locked;

pub use log::RawLog;
pub use reader::{EvmChainReader, EvmReaderConfig};
pub use rpc::{EvmRpc, HttpRpcClient};
