//! # Order Types
//!
//! Orders are created only by a successful checkout completion. Line items
//! are frozen at creation; fulfillment events and adjustments are append-only,
//! and the order status is derived from whichever was recorded last.

use crate::money::Money;
use crate::session::{Address, Buyer, CheckoutSession, LineItem, PaymentRef, Totals};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the buyer receives the goods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentMethod {
    Shipping,
    Pickup,
}

/// What the business committed to deliver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentExpectation {
    pub id: String,
    pub method: FulfillmentMethod,
    pub skus: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Address>,
}

/// Fulfillment progress reported by the business
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentEventKind {
    Processing,
    Shipped,
    InTransit,
    OutForDelivery,
    Delivered,
    FailedAttempt,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentEvent {
    pub id: String,
    pub kind: FulfillmentEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Post-purchase money or state changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentKind {
    Refund,
    Return,
    Credit,
    Dispute,
    Cancellation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjustment {
    pub id: String,
    pub kind: AdjustmentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Money>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Derived order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Confirmed,
    Processing,
    Shipped,
    Delivered,
    DeliveryFailed,
    Refunded,
    Returned,
    Disputed,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fulfillment {
    pub expectations: Vec<FulfillmentExpectation>,
    #[serde(default)]
    pub events: Vec<FulfillmentEvent>,
}

/// A completed purchase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    /// Originating checkout session
    pub session_id: String,
    pub line_items: Vec<LineItem>,
    pub totals: Totals,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buyer: Option<Buyer>,
    pub payment: PaymentRef,
    pub fulfillment: Fulfillment,
    #[serde(default)]
    pub adjustments: Vec<Adjustment>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Build the order for a session whose payment has been redeemed
    pub fn from_session(
        id: impl Into<String>,
        session: &CheckoutSession,
        payment: PaymentRef,
        now: DateTime<Utc>,
    ) -> Self {
        let id = id.into();
        let method = if session.shipping_address.is_some() {
            FulfillmentMethod::Shipping
        } else {
            FulfillmentMethod::Pickup
        };
        Self {
            fulfillment: Fulfillment {
                expectations: vec![FulfillmentExpectation {
                    id: format!("{id}_fx1"),
                    method,
                    skus: session.line_items.iter().map(|i| i.sku.clone()).collect(),
                    destination: session.shipping_address.clone(),
                }],
                events: Vec::new(),
            },
            id,
            session_id: session.id.clone(),
            line_items: session.line_items.clone(),
            totals: session.totals,
            buyer: session.buyer.clone(),
            payment,
            adjustments: Vec::new(),
            created_at: now,
        }
    }

    /// Status derived from the most recent fulfillment event or adjustment
    pub fn status(&self) -> OrderStatus {
        let last_event = self.fulfillment.events.last();
        let last_adjustment = self.adjustments.last();

        let from_event = |e: &FulfillmentEvent| match e.kind {
            FulfillmentEventKind::Processing => OrderStatus::Processing,
            FulfillmentEventKind::Shipped
            | FulfillmentEventKind::InTransit
            | FulfillmentEventKind::OutForDelivery => OrderStatus::Shipped,
            FulfillmentEventKind::Delivered => OrderStatus::Delivered,
            FulfillmentEventKind::FailedAttempt => OrderStatus::DeliveryFailed,
            FulfillmentEventKind::Canceled => OrderStatus::Canceled,
        };
        let from_adjustment = |a: &Adjustment| match a.kind {
            AdjustmentKind::Refund | AdjustmentKind::Credit => OrderStatus::Refunded,
            AdjustmentKind::Return => OrderStatus::Returned,
            AdjustmentKind::Dispute => OrderStatus::Disputed,
            AdjustmentKind::Cancellation => OrderStatus::Canceled,
        };

        match (last_event, last_adjustment) {
            (None, None) => OrderStatus::Confirmed,
            (Some(e), None) => from_event(e),
            (None, Some(a)) => from_adjustment(a),
            (Some(e), Some(a)) if a.occurred_at >= e.occurred_at => from_adjustment(a),
            (Some(e), Some(_)) => from_event(e),
        }
    }

    /// Sum of refunded amounts so far
    pub fn refunded_amount(&self) -> i64 {
        self.adjustments
            .iter()
            .filter(|a| a.kind == AdjustmentKind::Refund)
            .filter_map(|a| a.amount.map(|m| m.amount))
            .sum()
    }
}
