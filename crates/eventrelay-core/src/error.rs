//! Error types for the relay pipeline.

use thiserror::Error;

/// Errors raised by the chain reader, the progress store and the pipeline.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Chain node unreachable, or the call timed out.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Malformed range or node-side rejection of a query.
    #[error("Chain query error: {0}")]
    ChainQuery(String),

    /// A progress store read or write failed.
    #[error("Storage error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A raw event could not be turned into a relay payload.
    #[error("Cannot decode event in tx {tx_hash}: {reason}")]
    Decode { tx_hash: String, reason: String },

    #[error("Cancelled")]
    Cancelled,
}

impl RelayError {
    /// Returns `true` if the cycle should simply be skipped and retried on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connectivity(_) | Self::ChainQuery(_))
    }

    /// Short, stable label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connectivity(_) => "connectivity",
            Self::ChainQuery(_) => "chain_query",
            Self::Store(_) => "store",
            Self::Config(_) => "config",
            Self::Decode { .. } => "decode",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Outcome of a failed delivery attempt (or of a whole delivery).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Network failure, timeout, 5xx or 429; a retry may succeed.
    #[error("Transient relay failure: {reason}")]
    Transient {
        status: Option<u16>,
        reason: String,
    },

    /// The endpoint rejected the payload (4xx other than 429).
    #[error("Relay rejected payload with HTTP {status}: {body}")]
    Permanent { status: u16, body: String },

    /// Every configured attempt failed transiently.
    #[error("Relay failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("Cannot serialize payload: {0}")]
    Serialization(String),

    #[error("Delivery cancelled")]
    Cancelled,
}

impl DeliveryError {
    /// Build a transient error without an HTTP status (network fault, timeout).
    pub fn network(reason: impl Into<String>) -> Self {
        Self::Transient {
            status: None,
            reason: reason.into(),
        }
    }

    /// Classify a non-2xx HTTP status: 429 and 5xx are transient, other codes permanent.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        if status == 429 || (500..600).contains(&status) {
            Self::Transient {
                status: Some(status),
                reason: format!("HTTP {status}: {body}"),
            }
        } else {
            Self::Permanent { status, body }
        }
    }

    /// Returns `true` if another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}
