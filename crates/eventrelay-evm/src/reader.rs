//! [`ChainReader`] over an EVM JSON-RPC node.

use alloy_primitives::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use eventrelay_core::chain::ChainReader;
use eventrelay_core::error::RelayError;
use eventrelay_core::types::{BlockRange, RawEvent};

use crate::rpc::{EvmRpc, HttpRpcClient};
use crate::tokens_locked;

/// Connection settings for [`EvmChainReader`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmReaderConfig {
    pub rpc_url: String,
    /// Bridge contract emitting `TokensLocked`.
    pub contract_address: String,
    /// Largest block span sent in one `eth_getLogs` call.
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_max_block_range() -> u64 {
    2_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl EvmReaderConfig {
    pub fn new(rpc_url: impl Into<String>, contract_address: impl Into<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            contract_address: contract_address.into(),
            max_block_range: default_max_block_range(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }

    /// Parse the contract address, rejecting anything that is not 20 hex bytes.
    pub fn contract(&self) -> Result<Address, RelayError> {
        self.contract_address.parse::<Address>().map_err(|e| {
            RelayError::Config(format!(
                "invalid contract address '{}': {e}",
                self.contract_address
            ))
        })
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.rpc_url.trim().is_empty() {
            return Err(RelayError::Config("RPC URL must be set".into()));
        }
        if self.max_block_range == 0 {
            return Err(RelayError::Config("max block range must be at least 1".into()));
        }
        self.contract().map(|_| ())
    }
}

/// Reads `TokensLocked` events from one bridge contract.
///
/// Ranges wider than `max_block_range` are fetched in consecutive chunks.
/// Logs flagged `removed` and logs that fail to decode are skipped.
pub struct EvmChainReader<C> {
    client: C,
    contract: Address,
    chain_id: u64,
    topic0: String,
    max_block_range: u64,
}

impl EvmChainReader<HttpRpcClient> {
    /// Build an HTTP-backed reader and resolve the chain id from the node.
    pub async fn connect(config: &EvmReaderConfig) -> Result<Self, RelayError> {
        config.validate()?;
        let client = HttpRpcClient::new(
            config.rpc_url.clone(),
            Duration::from_millis(config.request_timeout_ms),
        )?;
        Self::with_client(client, config).await
    }
}

impl<C: EvmRpc> EvmChainReader<C> {
    pub async fn with_client(client: C, config: &EvmReaderConfig) -> Result<Self, RelayError> {
        let contract = config.contract()?;
        let chain_id = client.chain_id().await?;
        tracing::info!(chain_id, contract = %contract, "connected to source chain");
        Ok(Self {
            client,
            contract,
            chain_id,
            topic0: tokens_locked::topic0(),
            max_block_range: config.max_block_range.max(1),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn contract(&self) -> Address {
        self.contract
    }

    /// Progress key for this reader: `<chain-id>:<contract>`.
    pub fn stream_id(&self) -> String {
        format!("{}:{}", self.chain_id, self.contract.to_checksum(None))
    }
}

#[async_trait]
impl<C: EvmRpc> ChainReader for EvmChainReader<C> {
    async fn current_height(&self) -> Result<u64, RelayError> {
        self.client.block_number().await
    }

    async fn fetch_events(&self, range: BlockRange) -> Result<Vec<RawEvent>, RelayError> {
        if range.is_empty() {
            return Err(RelayError::ChainQuery(format!("empty block range {range}")));
        }

        let address = self.contract.to_string();
        let mut events = Vec::new();
        for chunk in range.chunks(self.max_block_range) {
            let logs = self.client.get_logs(chunk, &address, &self.topic0).await?;
            tracing::debug!(range = %chunk, logs = logs.len(), "fetched logs");

            for log in logs {
                if log.is_removed() {
                    tracing::debug!(tx_hash = %log.tx_hash, "skipping removed log");
                    continue;
                }
                let from_contract = log
                    .address
                    .parse::<Address>()
                    .map(|a| a == self.contract)
                    .unwrap_or(false);
                if !from_contract {
                    continue;
                }
                match tokens_locked::decode_log(&log, self.chain_id) {
                    Ok(ev) => events.push(ev),
                    Err(e) => tracing::error!(tx_hash = %log.tx_hash, error = %e, "cannot decode log"),
                }
            }
        }

        events.sort_by_key(RawEvent::position);
        Ok(events)
    }
}
