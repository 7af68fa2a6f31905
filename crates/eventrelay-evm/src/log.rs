//! Raw EVM log as returned by `eth_getLogs`.

use serde::{Deserialize, Serialize};

use eventrelay_core::error::RelayError;

/// A raw EVM log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<bool>,
}

impl RawLog {
    pub fn block_number_u64(&self) -> Result<u64, RelayError> {
        parse_hex_u64(&self.block_number)
    }

    pub fn log_index_u64(&self) -> Result<u64, RelayError> {
        parse_hex_u64(&self.log_index)
    }

    /// Returns `true` if this log was removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }
}

/// Parse a hex-encoded quantity (with or without `0x`) to u64.
pub fn parse_hex_u64(s: &str) -> Result<u64, RelayError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16)
        .map_err(|e| RelayError::ChainQuery(format!("invalid hex quantity '{s}': {e}")))
}

/// Decode a `0x`-prefixed hex string into bytes.
pub fn decode_hex(s: &str) -> Result<Vec<u8>, RelayError> {
    hex::decode(s.strip_prefix("0x").unwrap_or(s))
        .map_err(|e| RelayError::ChainQuery(format!("invalid hex data: {e}")))
}
