//! Decoding of the bridge's `TokensLocked` event.
//!
//! ```text
//! event TokensLocked(
//!     address indexed sender,
//!     uint256 destinationChainId,
//!     address indexed recipient,
//!     uint256 amount,
//!     bytes32 indexed transactionId
//! )
//! ```
//!
//! Indexed parameters land in `topics[1..=3]` in declaration order; the two
//! `uint256` values are ABI-encoded back to back in `data`.

use alloy_primitives::{keccak256, Address, U256};
use serde_json::json;

use eventrelay_core::error::RelayError;
use eventrelay_core::types::{field, RawEvent};

use crate::log::{decode_hex, RawLog};

pub const SIGNATURE: &str = "TokensLocked(address,uint256,address,uint256,bytes32)";

const WORD: usize = 32;

/// `keccak256(SIGNATURE)` as a `0x`-prefixed hex string.
pub fn topic0() -> String {
    format!("0x{}", hex::encode(keccak256(SIGNATURE.as_bytes())))
}

/// Decode a `TokensLocked` log emitted on chain `source_chain_id`.
pub fn decode_log(log: &RawLog, source_chain_id: u64) -> Result<RawEvent, RelayError> {
    let decode_err = |reason: String| RelayError::Decode {
        tx_hash: log.tx_hash.clone(),
        reason,
    };

    if log.topics.len() != 4 {
        return Err(decode_err(format!("expected 4 topics, got {}", log.topics.len())));
    }
    if !log.topics[0].eq_ignore_ascii_case(&topic0()) {
        return Err(decode_err(format!("unexpected topic0 {}", log.topics[0])));
    }

    let word = |hex: &str| -> Result<Vec<u8>, RelayError> {
        let bytes = decode_hex(hex).map_err(|e| decode_err(e.to_string()))?;
        if bytes.len() != WORD {
            return Err(decode_err(format!("topic is {} bytes, expected {WORD}", bytes.len())));
        }
        Ok(bytes)
    };
    let sender = Address::from_slice(&word(&log.topics[1])?[12..]);
    let recipient = Address::from_slice(&word(&log.topics[2])?[12..]);
    let transaction_id = format!("0x{}", hex::encode(word(&log.topics[3])?));

    let data = decode_hex(&log.data).map_err(|e| decode_err(e.to_string()))?;
    if data.len() != 2 * WORD {
        return Err(decode_err(format!(
            "data is {} bytes, expected {}",
            data.len(),
            2 * WORD
        )));
    }
    let destination_chain_id = U256::from_be_slice(&data[..WORD]);
    let amount = U256::from_be_slice(&data[WORD..]);

    Ok(RawEvent {
        block_number: log.block_number_u64()?,
        tx_hash: log.tx_hash.clone(),
        log_index: log.log_index_u64()?,
        fields: json!({
            field::TRANSACTION_ID: transaction_id,
            field::SENDER: sender.to_checksum(None),
            field::RECIPIENT: recipient.to_checksum(None),
            field::AMOUNT: amount.to_string(),
            field::SOURCE_CHAIN_ID: source_chain_id,
            field::DESTINATION_CHAIN_ID: destination_chain_id.to_string(),
        }),
    })
}
