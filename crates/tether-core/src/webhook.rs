//! Outbound webhook collaborator.
//!
//! When a central-bound request or telemetry payload has no live or
//! retained path, the router falls back to an HTTP webhook. The concrete
//! client lives in the server crate; the router only sees this trait.

use async_trait::async_trait;
use tether_protocol::{PayloadValue, Uid};

/// Decoded 2xx webhook reply (`{Code, Payload, Format}`).
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookReply {
    pub code: u8,
    pub value: PayloadValue,
}

/// One-shot outbound webhook delivery.
#[async_trait]
pub trait Webhook: Send + Sync {
    /// POST `{UID, Payload, Format}` to the configured endpoint.
    ///
    /// Returns the decoded reply for a 2xx response carrying a valid JSON
    /// envelope, `None` on failure, timeout, non-2xx status, or an empty or
    /// undecodable body.
    async fn post(&self, uid: &Uid, value: &PayloadValue) -> Option<WebhookReply>;
}
