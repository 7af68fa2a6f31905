//! Relayer: delivers payloads to the downstream endpoint with bounded,
//! exponentially backed-off retries.
//!
//! ```text
//! deliver → [timeout] → RelayTransport::post
//!              │ transient (network / 5xx / 429)  → sleep base·2^(n−1) → retry
//!              │ permanent (other 4xx)            → fail now
//!              └ attempts used up                 → Exhausted
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::DeliveryError;
use crate::types::NormalizedPayload;

// ─── Retry policy ─────────────────────────────────────────────────────────────

/// Configuration for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt (milliseconds).
    pub base_delay_ms: u64,
    /// Upper bound on any single delay (milliseconds).
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

/// Stateless retry policy: computes the delay given the attempt number.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the delay to wait after the `attempt`-th failure (1-based),
    /// or `None` if no attempts remain.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.config.max_attempts {
            return None;
        }
        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        let ms = self
            .config
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.config.max_delay_ms);
        Some(Duration::from_millis(ms))
    }
}

// ─── Transport ────────────────────────────────────────────────────────────────

/// A single outbound delivery attempt.
///
/// Implementations classify failures: network faults, 5xx and 429 map to
/// [`DeliveryError::Transient`], other non-2xx statuses to
/// [`DeliveryError::Permanent`].
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn post(&self, payload: &NormalizedPayload) -> Result<(), DeliveryError>;

    /// The endpoint's identifier (URL or name).
    fn endpoint(&self) -> &str;
}

// ─── Relayer ──────────────────────────────────────────────────────────────────

/// Configuration for [`Relayer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayerConfig {
    pub retry: RetryConfig,
    /// Bound on a single attempt (milliseconds).
    pub request_timeout_ms: u64,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            request_timeout_ms: 10_000,
        }
    }
}

/// Delivers payloads through a [`RelayTransport`]. Keeps no state between calls.
pub struct Relayer<T> {
    transport: T,
    policy: RetryPolicy,
    request_timeout: Duration,
}

impl<T: RelayTransport> Relayer<T> {
    pub fn new(transport: T, config: RelayerConfig) -> Self {
        Self {
            transport,
            policy: RetryPolicy::new(config.retry),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Deliver one payload. Returns the number of attempts used on success.
    ///
    /// Terminal errors are `Permanent`, `Exhausted`, `Serialization` and
    /// `Cancelled`.
    pub async fn deliver(
        &self,
        payload: &NormalizedPayload,
        cancel: &CancellationToken,
    ) -> Result<u32, DeliveryError> {
        let tx_id = payload.transaction_id.as_str();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DeliveryError::Cancelled),
                res = tokio::time::timeout(self.request_timeout, self.transport.post(payload)) => {
                    res.unwrap_or_else(|_| Err(DeliveryError::network(format!(
                        "request timed out after {}ms",
                        self.request_timeout.as_millis()
                    ))))
                }
            };

            match outcome {
                Ok(()) => {
                    tracing::info!(tx_id, attempt, endpoint = self.transport.endpoint(), "relayed");
                    return Ok(attempt);
                }
                Err(e) if e.is_retryable() => match self.policy.delay_after(attempt) {
                    Some(delay) => {
                        tracing::warn!(
                            tx_id,
                            attempt,
                            max_attempts = self.policy.config.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "relay attempt failed; retrying"
                        );
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(DeliveryError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => {
                        tracing::error!(tx_id, attempt, error = %e, "max relay attempts exceeded");
                        return Err(DeliveryError::Exhausted {
                            attempts: attempt,
                            last: e.to_string(),
                        });
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }
}
