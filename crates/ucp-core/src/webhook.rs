//! # Webhook Types
//!
//! Lifecycle events pushed to platform endpoints. Each endpoint has its own
//! FIFO queue ordered by `sequence`; a `delivery_id` is stable across retries
//! of the same event so receivers can deduplicate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event topics the engine publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTopic {
    #[serde(rename = "checkout.completed")]
    CheckoutCompleted,
    #[serde(rename = "checkout.cancelled")]
    CheckoutCancelled,
    #[serde(rename = "order.created")]
    OrderCreated,
    #[serde(rename = "order.shipped")]
    OrderShipped,
    #[serde(rename = "order.delivered")]
    OrderDelivered,
    #[serde(rename = "order.fulfillment_updated")]
    OrderFulfillmentUpdated,
    #[serde(rename = "order.adjusted")]
    OrderAdjusted,
}

impl EventTopic {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventTopic::CheckoutCompleted => "checkout.completed",
            EventTopic::CheckoutCancelled => "checkout.cancelled",
            EventTopic::OrderCreated => "order.created",
            EventTopic::OrderShipped => "order.shipped",
            EventTopic::OrderDelivered => "order.delivered",
            EventTopic::OrderFulfillmentUpdated => "order.fulfillment_updated",
            EventTopic::OrderAdjusted => "order.adjusted",
        }
    }
}

impl std::fmt::Display for EventTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A platform endpoint registered for lifecycle events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub endpoint_id: String,
    pub url: String,
    /// HMAC signing secret shared with the receiver
    pub secret: String,
    /// Subscribed topics. Empty means every topic.
    #[serde(default)]
    pub topics: Vec<EventTopic>,
}

impl WebhookSubscription {
    pub fn new(
        endpoint_id: impl Into<String>,
        url: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            url: url.into(),
            secret: secret.into(),
            topics: Vec::new(),
        }
    }

    /// Builder: restrict to a set of topics
    pub fn with_topics(mut self, topics: impl IntoIterator<Item = EventTopic>) -> Self {
        self.topics = topics.into_iter().collect();
        self
    }

    pub fn wants(&self, topic: EventTopic) -> bool {
        self.topics.is_empty() || self.topics.contains(&topic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    DeadLettered,
}

/// A queued delivery to one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub delivery_id: String,
    pub endpoint_id: String,
    /// Position in the endpoint's queue, assigned by the ledger on enqueue
    pub sequence: u64,
    pub topic: EventTopic,
    pub payload: serde_json::Value,
    pub target_url: String,
    pub attempts: u32,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Result of a single delivery attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// 2xx response
    Delivered { status: u16 },
    /// 4xx response, not retried
    Rejected { status: u16 },
    /// 5xx response, retried
    ServerError { status: u16 },
    /// Connection failure or timeout, retried
    NetworkError { message: String },
}

impl AttemptOutcome {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AttemptOutcome::ServerError { .. } | AttemptOutcome::NetworkError { .. }
        )
    }

    /// Classify an HTTP status code
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => AttemptOutcome::Delivered { status },
            400..=499 => AttemptOutcome::Rejected { status },
            _ => AttemptOutcome::ServerError { status },
        }
    }
}

/// Audit record of one attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub delivery_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    /// Delay scheduled before the next attempt, if one was scheduled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Endpoint answered 4xx
    Rejected { status: u16 },
    /// Retries exhausted
    Exhausted { attempts: u32, last_error: String },
}

/// An event that will not be delivered automatically
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub event: WebhookEvent,
    pub reason: DeadLetterReason,
    pub dead_lettered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_wire_names() {
        assert_eq!(
            serde_json::to_string(&EventTopic::OrderShipped).unwrap(),
            "\"order.shipped\""
        );
        let topic: EventTopic = serde_json::from_str("\"checkout.cancelled\"").unwrap();
        assert_eq!(topic, EventTopic::CheckoutCancelled);
    }

    #[test]
    fn test_subscription_topic_filter() {
        let all = WebhookSubscription::new("ep1", "https://p.example/hooks", "s");
        assert!(all.wants(EventTopic::OrderCreated));

        let orders = WebhookSubscription::new("ep2", "https://p.example/hooks", "s")
            .with_topics([EventTopic::OrderShipped, EventTopic::OrderDelivered]);
        assert!(orders.wants(EventTopic::OrderShipped));
        assert!(!orders.wants(EventTopic::CheckoutCompleted));
    }

    #[test]
    fn test_outcome_classification() {
        assert_eq!(AttemptOutcome::from_status(204), AttemptOutcome::Delivered { status: 204 });
        assert!(!AttemptOutcome::from_status(410).is_retryable());
        assert!(AttemptOutcome::from_status(503).is_retryable());
        assert!(AttemptOutcome::NetworkError {
            message: "timeout".into()
        }
        .is_retryable());
    }
}
