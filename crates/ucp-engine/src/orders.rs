//! # Order Service
//!
//! Post-purchase updates. Fulfillment events and adjustments are appended,
//! never edited, and each one is announced to subscribed platforms. Updates
//! to one order are serialized by a per-order lock.

use crate::locks::KeyedLocks;
use crate::retry::RetryPolicy;
use crate::webhook::WebhookDispatcher;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use ucp_core::{
    Adjustment, AdjustmentKind, CheckoutError, CheckoutResult, EventTopic, FulfillmentEvent,
    FulfillmentEventKind, Money, Order, OrderStatus, SharedClock, SharedLedger,
};
use uuid::Uuid;

pub struct OrderService {
    ledger: SharedLedger,
    clock: SharedClock,
    webhooks: Arc<WebhookDispatcher>,
    retry: RetryPolicy,
    locks: KeyedLocks,
}

impl OrderService {
    pub fn new(ledger: SharedLedger, clock: SharedClock, webhooks: Arc<WebhookDispatcher>) -> Self {
        Self {
            ledger,
            clock,
            webhooks,
            retry: RetryPolicy::default(),
            locks: KeyedLocks::new("order"),
        }
    }

    /// Builder: override the ledger retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn locks(&self) -> &KeyedLocks {
        &self.locks
    }

    pub async fn get(&self, order_id: &str) -> CheckoutResult<Order> {
        self.retry
            .run("get_order", || self.ledger.get_order(order_id))
            .await?
            .ok_or_else(|| CheckoutError::OrderNotFound {
                order_id: order_id.to_string(),
            })
    }

    /// Append a fulfillment event and emit `order.shipped`,
    /// `order.delivered` or `order.fulfillment_updated`.
    #[instrument(skip(self, tracking_number, description))]
    pub async fn record_fulfillment_event(
        &self,
        order_id: &str,
        kind: FulfillmentEventKind,
        tracking_number: Option<String>,
        description: Option<String>,
    ) -> CheckoutResult<Order> {
        let _guard = self.locks.lock(order_id).await;
        let mut order = self.get(order_id).await?;
        if order.status() == OrderStatus::Canceled {
            return Err(CheckoutError::Validation(format!(
                "order {order_id} is canceled"
            )));
        }

        let event = FulfillmentEvent {
            id: format!("fe_{}", Uuid::new_v4().simple()),
            kind,
            tracking_number,
            description,
            occurred_at: self.clock.now(),
        };
        order.fulfillment.events.push(event.clone());
        self.save(&order).await?;

        let topic = match kind {
            FulfillmentEventKind::Shipped => EventTopic::OrderShipped,
            FulfillmentEventKind::Delivered => EventTopic::OrderDelivered,
            _ => EventTopic::OrderFulfillmentUpdated,
        };
        self.notify(
            topic,
            json!({ "order_id": order.id, "status": order.status(), "event": event }),
        )
        .await;

        info!("📦 Order {} fulfillment: {:?}", order.id, kind);
        Ok(order)
    }

    /// Append an adjustment and emit `order.adjusted`.
    ///
    /// Refunds need an amount, and all refunds together cannot exceed the
    /// order total.
    #[instrument(skip(self, reason))]
    pub async fn record_adjustment(
        &self,
        order_id: &str,
        kind: AdjustmentKind,
        amount: Option<Money>,
        reason: Option<String>,
    ) -> CheckoutResult<Order> {
        let _guard = self.locks.lock(order_id).await;
        let mut order = self.get(order_id).await?;
        let total = order.totals.total;

        if let Some(amount) = amount {
            if amount.amount <= 0 {
                return Err(CheckoutError::Validation(
                    "adjustment amount must be positive".into(),
                ));
            }
            if amount.currency != total.currency {
                return Err(CheckoutError::Validation(format!(
                    "adjustment is in {}, order {} is in {}",
                    amount.currency, order_id, total.currency
                )));
            }
        }

        if kind == AdjustmentKind::Refund {
            let amount = amount.ok_or_else(|| {
                CheckoutError::Validation("a refund needs an amount".into())
            })?;
            let remaining = total.amount - order.refunded_amount();
            if amount.amount > remaining {
                return Err(CheckoutError::Validation(format!(
                    "refund of {} exceeds the {} left on order {}",
                    amount.display(),
                    Money::new(remaining, total.currency).display(),
                    order_id
                )));
            }
        }

        let adjustment = Adjustment {
            id: format!("adj_{}", Uuid::new_v4().simple()),
            kind,
            amount,
            reason,
            occurred_at: self.clock.now(),
        };
        order.adjustments.push(adjustment.clone());
        self.save(&order).await?;

        self.notify(
            EventTopic::OrderAdjusted,
            json!({ "order_id": order.id, "status": order.status(), "adjustment": adjustment }),
        )
        .await;

        info!("Order {} adjusted: {:?}", order.id, kind);
        Ok(order)
    }

    async fn save(&self, order: &Order) -> CheckoutResult<()> {
        self.retry
            .run("update_order", || self.ledger.update_order(order))
            .await?;
        Ok(())
    }

    /// The update is already stored; a failed enqueue is logged, not returned
    async fn notify(&self, topic: EventTopic, payload: serde_json::Value) {
        if let Err(e) = self.webhooks.enqueue(topic, payload).await {
            warn!("Failed to queue {}: {}", topic, e);
        }
    }
}
