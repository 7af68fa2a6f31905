//! JSON-RPC 2.0 wire types and a minimal HTTP client for the EVM methods
//! the reader needs (`eth_chainId`, `eth_blockNumber`, `eth_getLogs`).

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use eventrelay_core::error::RelayError;
use eventrelay_core::types::BlockRange;

use crate::log::{parse_hex_u64, RawLog};

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<Value>,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Node-side errors become [`RelayError::ChainQuery`].
    pub fn into_result(self) -> Result<Value, RelayError> {
        match (self.error, self.result) {
            (Some(err), _) => Err(RelayError::ChainQuery(err.to_string())),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// The EVM node methods used by the reader.
#[async_trait]
pub trait EvmRpc: Send + Sync {
    async fn chain_id(&self) -> Result<u64, RelayError>;
    async fn block_number(&self) -> Result<u64, RelayError>;
    async fn get_logs(
        &self,
        range: BlockRange,
        address: &str,
        topic0: &str,
    ) -> Result<Vec<RawLog>, RelayError>;
}

/// HTTP JSON-RPC client backed by `reqwest`.
///
/// Transport faults and non-2xx statuses map to [`RelayError::Connectivity`];
/// node error objects and undecodable results to [`RelayError::ChainQuery`].
pub struct HttpRpcClient {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, RelayError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RelayError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Call `method` and deserialize its result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, RelayError> {
        let req = JsonRpcRequest::new(self.next_id.fetch_add(1, Ordering::Relaxed), method, params);

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| RelayError::Connectivity(format!("{method}: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::Connectivity(format!("{method}: HTTP {status}: {body}")));
        }

        let resp: JsonRpcResponse = resp
            .json()
            .await
            .map_err(|e| RelayError::Connectivity(format!("{method}: unreadable response: {e}")))?;
        let result = resp.into_result()?;
        serde_json::from_value(result)
            .map_err(|e| RelayError::ChainQuery(format!("{method}: unexpected result: {e}")))
    }
}

#[async_trait]
impl EvmRpc for HttpRpcClient {
    async fn chain_id(&self) -> Result<u64, RelayError> {
        let hex: String = self.call("eth_chainId", vec![]).await?;
        parse_hex_u64(&hex)
    }

    async fn block_number(&self) -> Result<u64, RelayError> {
        let hex: String = self.call("eth_blockNumber", vec![]).await?;
        parse_hex_u64(&hex)
    }

    async fn get_logs(
        &self,
        range: BlockRange,
        address: &str,
        topic0: &str,
    ) -> Result<Vec<RawLog>, RelayError> {
        let filter = json!({
            "fromBlock": format!("0x{:x}", range.from),
            "toBlock": format!("0x{:x}", range.to),
            "address": address,
            "topics": [topic0],
        });
        self.call("eth_getLogs", vec![filter]).await
    }
}
