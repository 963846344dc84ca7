//! Delivery transport port.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::info;

use courier_core::PayloadRef;

/// Opaque success payload returned by a transport (e.g. a provider message id).
pub type Confirmation = serde_json::Value;

/// Failure of a single delivery attempt. Every variant is treated as transient.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("delivery rejected: {0}")]
    Rejected(String),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("delivery attempt timed out after {0:?}")]
    Timeout(Duration),
}

/// Attempts delivery of the record behind a payload reference.
///
/// One call is one attempt; retry bookkeeping belongs to the queue. Calls may
/// be repeated for the same payload after a timeout, so implementations that
/// are not naturally idempotent should deduplicate on `payload_ref`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, payload_ref: &PayloadRef) -> Result<Confirmation, TransportError>;
}

/// Dry-run transport: logs the delivery and confirms it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn send(&self, payload_ref: &PayloadRef) -> Result<Confirmation, TransportError> {
        info!(payload_ref = %payload_ref, "dry-run delivery");
        Ok(serde_json::json!({
            "transport": "log",
            "payload_ref": payload_ref.as_str(),
            "delivered_at": Utc::now(),
        }))
    }
}
