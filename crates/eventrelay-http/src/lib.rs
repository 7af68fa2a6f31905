//! eventrelay-http: POSTs relay payloads to the downstream endpoint.
//!
//! One call to [`RelayTransport::post`] is one HTTP attempt; retries and
//! backoff live in [`eventrelay_core::Relayer`].

use async_trait::async_trait;
use std::time::Duration;

use eventrelay_core::error::{DeliveryError, RelayError};
use eventrelay_core::relayer::RelayTransport;
use eventrelay_core::types::NormalizedPayload;

/// `User-Agent` sent with every delivery.
pub const USER_AGENT: &str = concat!("eventrelay/", env!("CARGO_PKG_VERSION"));

/// JSON-over-HTTP relay transport backed by `reqwest`.
pub struct HttpRelayTransport {
    endpoint: String,
    http: reqwest::Client,
}

impl HttpRelayTransport {
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Result<Self, RelayError> {
        let endpoint = endpoint.into();
        reqwest::Url::parse(&endpoint)
            .map_err(|e| RelayError::Config(format!("invalid relay endpoint '{endpoint}': {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| RelayError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { endpoint, http })
    }
}

#[async_trait]
impl RelayTransport for HttpRelayTransport {
    async fn post(&self, payload: &NormalizedPayload) -> Result<(), DeliveryError> {
        let body =
            serde_json::to_vec(payload).map_err(|e| DeliveryError::Serialization(e.to_string()))?;

        let resp = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| DeliveryError::network(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        tracing::debug!(status = status.as_u16(), body = %text, "relay endpoint returned an error");
        Err(DeliveryError::from_status(status.as_u16(), text))
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}
