//! Outbound delivery of a signed webhook body.

use super::signing::{DELIVERY_ID_HEADER, SIGNATURE_HEADER, TOPIC_HEADER};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;
use ucp_core::{AttemptOutcome, CheckoutError, CheckoutResult, EventTopic};

/// One signed POST, ready to send
#[derive(Debug, Clone)]
pub struct OutgoingDelivery {
    pub url: String,
    pub delivery_id: String,
    pub topic: EventTopic,
    pub body: Vec<u8>,
    /// `UCP-Signature` header value
    pub signature: String,
}

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// Attempt one delivery. Never fails: transport errors are an outcome.
    async fn send(&self, delivery: &OutgoingDelivery) -> AttemptOutcome;
}

/// reqwest-backed transport
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> CheckoutResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CheckoutError::Configuration(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn send(&self, delivery: &OutgoingDelivery) -> AttemptOutcome {
        let result = self
            .client
            .post(&delivery.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, &delivery.signature)
            .header(DELIVERY_ID_HEADER, &delivery.delivery_id)
            .header(TOPIC_HEADER, delivery.topic.as_str())
            .body(delivery.body.clone())
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                debug!("Webhook {} -> {}: {}", delivery.delivery_id, delivery.url, status);
                AttemptOutcome::from_status(status)
            }
            Err(e) => {
                let message = if e.is_timeout() {
                    format!("timed out: {e}")
                } else {
                    e.to_string()
                };
                AttemptOutcome::NetworkError { message }
            }
        }
    }
}
