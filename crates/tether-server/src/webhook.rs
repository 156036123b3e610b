//! Outbound webhook client.
//!
//! While no central session exists, object requests and telemetry are
//! posted as JSON envelopes to configured URLs, authenticated with the
//! central shared secret as a bearer token.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tether_core::{Webhook, WebhookReply};
use tether_protocol::{PayloadFormat, PayloadValue, Uid};
use tracing::{debug, warn};

/// Webhook target posting `{UID, Payload, Format}` envelopes.
pub struct HttpWebhook {
    client: reqwest::Client,
    url: String,
    bearer: String,
}

impl HttpWebhook {
    /// Build a webhook client for one URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(url: String, auth_key_hex: String, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url, bearer: auth_key_hex })
    }

    fn parse_reply(body: &Value) -> Option<WebhookReply> {
        let code = u8::try_from(body.get("Code")?.as_u64()?).ok()?;
        let format = PayloadFormat::from_str(body.get("Format")?.as_str()?).ok()?;
        let value = PayloadValue::from_json(format, body.get("Payload")?).ok()?;
        Some(WebhookReply { code, value })
    }
}

#[async_trait]
impl Webhook for HttpWebhook {
    async fn post(&self, uid: &Uid, value: &PayloadValue) -> Option<WebhookReply> {
        let envelope = json!({
            "UID": uid.name().ok()?,
            "Payload": value.to_json(),
            "Format": value.format().as_str(),
        });

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.bearer)
            .json(&envelope)
            .send()
            .await;
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %self.url, error = %e, "webhook post failed");
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(url = %self.url, status = %response.status(), "webhook refused");
            return None;
        }

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                debug!(url = %self.url, error = %e, "webhook reply is not json");
                return None;
            }
        };
        Self::parse_reply(&body)
    }
}
