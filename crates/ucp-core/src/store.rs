//! # Ledger Store Trait
//!
//! The ledger is the single source of truth for every component. Engine
//! components read and write through it instead of caching mutable state.
//!
//! Implementations must make the following calls atomic:
//! - [`LedgerStore::consume_token`]: compare-and-set on `consumed_at`,
//!   storing the receipt in the same step
//! - [`LedgerStore::insert_order`] and [`LedgerStore::insert_idempotency`]:
//!   insert-if-absent
//! - [`LedgerStore::enqueue_webhooks`]: the whole batch lands or none of
//!   it does, each event taking the next sequence of its endpoint
//! - [`LedgerStore::write_reservation`]: reservation and stock level together
//!
//! Everything else is plain get/put; callers serialize per key with locks.

use crate::error::StoreResult;
use crate::inventory::{Reservation, StockLevel};
use crate::order::Order;
use crate::session::{CheckoutSession, SessionStatus};
use crate::token::{PaymentReceipt, PaymentToken, TokenAuditEntry};
use crate::webhook::{DeadLetter, DeliveryAttempt, WebhookEvent, WebhookSubscription};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Binds a client idempotency key to the order it produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub session_id: String,
    pub order_id: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ---- sessions -------------------------------------------------------

    /// Active or archived session
    async fn get_session(&self, id: &str) -> StoreResult<Option<CheckoutSession>>;

    async fn put_session(&self, session: &CheckoutSession) -> StoreResult<()>;

    /// Move a terminal session to the archive. It stays readable.
    async fn archive_session(&self, id: &str) -> StoreResult<()>;

    /// Active (non-archived) sessions in any of the given states
    async fn sessions_in(&self, statuses: &[SessionStatus]) -> StoreResult<Vec<CheckoutSession>>;

    /// Session created with a given creation idempotency key
    async fn session_by_creation_key(&self, key: &str) -> StoreResult<Option<CheckoutSession>>;

    // ---- inventory ------------------------------------------------------

    async fn get_stock(&self, sku: &str) -> StoreResult<Option<StockLevel>>;

    async fn put_stock(&self, sku: &str, level: StockLevel) -> StoreResult<()>;

    async fn get_reservation(&self, id: &str) -> StoreResult<Option<Reservation>>;

    /// Persist a reservation together with the new stock level of its SKU.
    /// Both writes land or neither does.
    async fn write_reservation(
        &self,
        level: StockLevel,
        reservation: &Reservation,
    ) -> StoreResult<()>;

    /// Active reservations whose `expires_at <= now`
    async fn expired_reservations(&self, now: DateTime<Utc>) -> StoreResult<Vec<Reservation>>;

    // ---- tokens ---------------------------------------------------------

    async fn get_token(&self, id: &str) -> StoreResult<Option<PaymentToken>>;

    async fn put_token(&self, token: &PaymentToken) -> StoreResult<()>;

    /// If `receipt.token_id` is not yet consumed, store the receipt and set
    /// `consumed_at`/`consumed_by` from it. Returns `false`, writing
    /// nothing, if the token was already consumed.
    async fn consume_token(&self, receipt: &PaymentReceipt) -> StoreResult<bool>;

    async fn get_receipt(&self, id: &str) -> StoreResult<Option<PaymentReceipt>>;

    async fn put_receipt(&self, receipt: &PaymentReceipt) -> StoreResult<()>;

    async fn append_token_audit(&self, entry: &TokenAuditEntry) -> StoreResult<()>;

    async fn token_audit(&self, token_id: &str) -> StoreResult<Vec<TokenAuditEntry>>;

    // ---- orders ---------------------------------------------------------

    /// Insert if absent. Returns `false` if an order with this id exists.
    async fn insert_order(&self, order: &Order) -> StoreResult<bool>;

    async fn get_order(&self, id: &str) -> StoreResult<Option<Order>>;

    /// Replace an existing order (appends happen through the order service)
    async fn update_order(&self, order: &Order) -> StoreResult<()>;

    // ---- idempotency ----------------------------------------------------

    async fn get_idempotency(&self, key: &str) -> StoreResult<Option<IdempotencyRecord>>;

    /// Insert if absent. Returns `false` if the key is already recorded.
    async fn insert_idempotency(&self, record: &IdempotencyRecord) -> StoreResult<bool>;

    // ---- webhooks -------------------------------------------------------

    async fn put_subscription(&self, subscription: &WebhookSubscription) -> StoreResult<()>;

    async fn subscriptions(&self) -> StoreResult<Vec<WebhookSubscription>>;

    /// Append each event to its endpoint queue; returns the events with
    /// their sequences set, in input order
    async fn enqueue_webhooks(&self, events: Vec<WebhookEvent>) -> StoreResult<Vec<WebhookEvent>>;

    /// Lowest-sequence pending event for an endpoint
    async fn next_pending_webhook(&self, endpoint_id: &str) -> StoreResult<Option<WebhookEvent>>;

    async fn update_webhook(&self, event: &WebhookEvent) -> StoreResult<()>;

    /// Remove a delivered or dead-lettered event from the live queue
    async fn archive_webhook(&self, delivery_id: &str) -> StoreResult<()>;

    /// Endpoints with at least one pending event
    async fn endpoints_with_pending(&self) -> StoreResult<Vec<String>>;

    async fn append_delivery_attempt(&self, attempt: &DeliveryAttempt) -> StoreResult<()>;

    async fn delivery_attempts(&self, delivery_id: &str) -> StoreResult<Vec<DeliveryAttempt>>;

    async fn put_dead_letter(&self, entry: &DeadLetter) -> StoreResult<()>;

    async fn dead_letters(&self) -> StoreResult<Vec<DeadLetter>>;
}

/// Type alias for a shared ledger (dynamic dispatch)
pub type SharedLedger = Arc<dyn LedgerStore>;
