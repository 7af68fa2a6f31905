//! Shared types for the relay pipeline.

use std::collections::BTreeSet;
use std::fmt;

use alloy_primitives::U256;
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::RelayError;

// ─── BlockRange ───────────────────────────────────────────────────────────────

/// An inclusive block range `[from, to]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    /// The range that follows `cursor` up to `head`, or `None` if the cursor is at the head.
    pub fn after(cursor: u64, head: u64) -> Option<Self> {
        let from = cursor.checked_add(1)?;
        (from <= head).then_some(Self { from, to: head })
    }

    /// Keep at most `max_len` blocks from the start of the range.
    pub fn capped(self, max_len: u64) -> Self {
        let to = self.from.saturating_add(max_len.max(1) - 1).min(self.to);
        Self { from: self.from, to }
    }

    /// Returns `true` if `from > to`.
    pub fn is_empty(&self) -> bool {
        self.from > self.to
    }

    /// Number of blocks covered.
    pub fn len(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.to - self.from + 1
        }
    }

    /// Split into consecutive sub-ranges of at most `max_len` blocks.
    pub fn chunks(&self, max_len: u64) -> Vec<BlockRange> {
        let max_len = max_len.max(1);
        let mut out = Vec::new();
        let mut start = self.from;
        while start <= self.to {
            let end = start.saturating_add(max_len - 1).min(self.to);
            out.push(BlockRange::new(start, end));
            if end == u64::MAX {
                break;
            }
            start = end + 1;
        }
        out
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

// ─── RawEvent ─────────────────────────────────────────────────────────────────

/// Field names carried in [`RawEvent::fields`].
pub mod field {
    pub const TRANSACTION_ID: &str = "transactionId";
    pub const SENDER: &str = "sender";
    pub const RECIPIENT: &str = "recipient";
    pub const AMOUNT: &str = "amount";
    pub const SOURCE_CHAIN_ID: &str = "sourceChainId";
    pub const DESTINATION_CHAIN_ID: &str = "destinationChainId";
}

/// An event occurrence as reported by the chain. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub block_number: u64,
    /// Hash of the emitting transaction (`0x…`).
    pub tx_hash: String,
    /// Log index within the block.
    pub log_index: u64,
    /// Decoded event fields (see [`field`]). Amounts are decimal strings.
    pub fields: Value,
}

impl RawEvent {
    /// Sort key used for ordered delivery.
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }

    fn str_field(&self, name: &str) -> Result<&str, RelayError> {
        self.fields
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| self.decode_err(format!("missing string field '{name}'")))
    }

    fn u64_field(&self, name: &str) -> Result<u64, RelayError> {
        match self.fields.get(name) {
            Some(Value::Number(n)) => n
                .as_u64()
                .ok_or_else(|| self.decode_err(format!("field '{name}' is not a u64"))),
            Some(Value::String(s)) => s
                .parse::<U256>()
                .ok()
                .and_then(|v| u64::try_from(v).ok())
                .ok_or_else(|| self.decode_err(format!("field '{name}' is not a u64: {s}"))),
            _ => Err(self.decode_err(format!("missing integer field '{name}'"))),
        }
    }

    fn decode_err(&self, reason: String) -> RelayError {
        RelayError::Decode {
            tx_hash: self.tx_hash.clone(),
            reason,
        }
    }
}

// ─── NormalizedPayload ───────────────────────────────────────────────────────

/// The relay-ready form of exactly one [`RawEvent`].
///
/// Serializes to the endpoint's JSON body. `amount` is written as a decimal
/// string so values above 2^53 survive JSON consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedPayload {
    /// Dedup key.
    pub transaction_id: String,
    pub sender: String,
    pub recipient: String,
    #[serde(serialize_with = "decimal_string")]
    pub amount: U256,
    pub source_chain_id: u64,
    pub destination_chain_id: u64,
    #[serde(rename = "sourceTransactionHash")]
    pub source_tx_hash: String,
}

fn decimal_string<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

impl NormalizedPayload {
    /// Pure, deterministic mapping from a raw event.
    pub fn from_raw(event: &RawEvent) -> Result<Self, RelayError> {
        let amount_str = event.str_field(field::AMOUNT)?;
        let amount = amount_str
            .parse::<U256>()
            .map_err(|e| event.decode_err(format!("invalid amount '{amount_str}': {e}")))?;

        Ok(Self {
            transaction_id: event.str_field(field::TRANSACTION_ID)?.to_string(),
            sender: event.str_field(field::SENDER)?.to_string(),
            recipient: event.str_field(field::RECIPIENT)?.to_string(),
            amount,
            source_chain_id: event.u64_field(field::SOURCE_CHAIN_ID)?,
            destination_chain_id: event.u64_field(field::DESTINATION_CHAIN_ID)?,
            source_tx_hash: event.tx_hash.clone(),
        })
    }
}

// ─── ProgressRecord ──────────────────────────────────────────────────────────

/// Persisted relay progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressRecord {
    /// Last block whose range was fully scanned. Never decreases.
    pub last_scanned_block: u64,
    /// Transaction ids confirmed delivered.
    pub relayed_ids: BTreeSet<String>,
}
