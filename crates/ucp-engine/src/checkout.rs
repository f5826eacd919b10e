//! # Checkout Session State Machine
//!
//! Drives a session from `created` to `completed` or `cancelled` and runs the
//! completion saga:
//!
//! ```text
//!  complete ─▶ idempotency record? ──yes──▶ stored order (replayed)
//!                    │ no
//!              price lock lapsed? ──yes──▶ release, back to created,
//!                    │ no                   PriceChanged / SessionExpired
//!                    ▼
//!               completing ─▶ redeem ─▶ commit ─▶ order ─▶ idempotency ─▶ notify ─▶ completed
//!                               │          │                                │
//!                               │          └──────── any failure ───────────┴─▶ stays completing
//!                               └─ token rejected ─▶ ready_for_complete        (reconcile)
//! ```
//!
//! Every transition of a session runs under that session's lock. `complete`
//! takes the idempotency-key lock before the session lock.

use crate::config::EngineConfig;
use crate::inventory::InventoryManager;
use crate::locks::KeyedLocks;
use crate::profile::ProfileCache;
use crate::retry::RetryPolicy;
use crate::webhook::WebhookDispatcher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use ucp_core::{
    validate_items, Address, BusinessProfile, Buyer, CancelReason, CheckoutError, CheckoutResult,
    CheckoutSession, EventTopic, IdempotencyRecord, LineItem, Order, PaymentCredential,
    PaymentRef, PendingCompletion, RedeemRequest, SessionStatus, SharedClock, SharedExchange,
    SharedLedger, StoreError, Totals,
};
use uuid::Uuid;

/// Request to open a checkout session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub line_items: Vec<LineItem>,

    #[serde(default)]
    pub buyer: Option<Buyer>,

    #[serde(default)]
    pub shipping_address: Option<Address>,

    #[serde(default)]
    pub discount_codes: Vec<String>,

    /// Repeating a create with the same key returns the original session
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl CreateSessionRequest {
    pub fn new(line_items: Vec<LineItem>) -> Self {
        Self {
            line_items,
            buyer: None,
            shipping_address: None,
            discount_codes: Vec::new(),
            idempotency_key: None,
        }
    }

    pub fn with_buyer(mut self, buyer: Buyer) -> Self {
        self.buyer = Some(buyer);
        self
    }

    pub fn with_shipping_address(mut self, address: Address) -> Self {
        self.shipping_address = Some(address);
        self
    }

    pub fn with_discount_code(mut self, code: impl Into<String>) -> Self {
        self.discount_codes.push(code.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Changes to a session. `None` leaves a field as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPatch {
    #[serde(default)]
    pub line_items: Option<Vec<LineItem>>,

    #[serde(default)]
    pub buyer: Option<Buyer>,

    #[serde(default)]
    pub shipping_address: Option<Address>,

    #[serde(default)]
    pub discount_codes: Option<Vec<String>>,
}

impl SessionPatch {
    pub fn items(line_items: Vec<LineItem>) -> Self {
        Self {
            line_items: Some(line_items),
            ..Self::default()
        }
    }

    pub fn with_buyer(mut self, buyer: Buyer) -> Self {
        self.buyer = Some(buyer);
        self
    }

    pub fn with_shipping_address(mut self, address: Address) -> Self {
        self.shipping_address = Some(address);
        self
    }

    pub fn with_discount_codes(mut self, codes: Vec<String>) -> Self {
        self.discount_codes = Some(codes);
        self
    }
}

/// Request to pay for and complete a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub session_id: String,
    pub payment: PaymentCredential,
    pub idempotency_key: String,
}

impl CompleteRequest {
    pub fn new(
        session_id: impl Into<String>,
        payment: PaymentCredential,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            payment,
            idempotency_key: idempotency_key.into(),
        }
    }
}

/// Outcome of a successful `complete`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionResult {
    pub session: CheckoutSession,
    pub order: Order,
    /// True when an earlier call with the same idempotency key produced this order
    pub replayed: bool,
}

/// What a reconciliation pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Sessions driven to `completed`
    pub completed: usize,
    /// Sessions whose token was rejected on retry, back in `ready_for_complete`
    pub reverted: usize,
    /// Sessions cancelled with their payment voided
    pub voided: usize,
    /// Sessions that could not be resolved this pass
    pub pending: usize,
}

enum Resolution {
    Completed,
    Reverted,
    Voided,
    Skipped,
}

pub struct CheckoutService {
    ledger: SharedLedger,
    clock: SharedClock,
    /// Merchant every redemption is made for. Profile reloads never change it.
    merchant_id: String,
    profiles: Arc<ProfileCache>,
    inventory: Arc<InventoryManager>,
    exchange: SharedExchange,
    webhooks: Arc<WebhookDispatcher>,
    config: EngineConfig,
    retry: RetryPolicy,
    sessions: KeyedLocks,
    keys: KeyedLocks,
}

impl CheckoutService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: SharedLedger,
        clock: SharedClock,
        merchant_id: impl Into<String>,
        profiles: Arc<ProfileCache>,
        inventory: Arc<InventoryManager>,
        exchange: SharedExchange,
        webhooks: Arc<WebhookDispatcher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            ledger,
            clock,
            merchant_id: merchant_id.into(),
            profiles,
            inventory,
            exchange,
            webhooks,
            retry: config.store_retry,
            config,
            sessions: KeyedLocks::new("session"),
            keys: KeyedLocks::new("idempotency-key"),
        }
    }

    /// Drop idle session and idempotency-key locks
    pub fn prune_locks(&self) -> usize {
        self.sessions.prune() + self.keys.prune()
    }

    /// Open a session in `created`. No stock is reserved yet.
    #[instrument(skip(self, request), fields(items = request.line_items.len()))]
    pub async fn create(&self, request: CreateSessionRequest) -> CheckoutResult<CheckoutSession> {
        let _key_guard = match request.idempotency_key.as_deref() {
            Some(key) if key.trim().is_empty() => {
                return Err(CheckoutError::Validation(
                    "idempotency_key must not be empty".into(),
                ));
            }
            Some(key) => {
                let guard = self.keys.lock(&format!("create:{key}")).await;
                let existing = self
                    .retry
                    .run("session_by_creation_key", || {
                        self.ledger.session_by_creation_key(key)
                    })
                    .await?;
                if let Some(existing) = existing {
                    if !same_items(&existing.line_items, &request.line_items) {
                        return Err(CheckoutError::IdempotencyConflict {
                            key: key.to_string(),
                        });
                    }
                    debug!("Create replayed for key {} -> {}", key, existing.id);
                    return Ok(existing);
                }
                Some(guard)
            }
            None => None,
        };

        let currency = validate_items(&request.line_items)?;
        let profile = self.profiles.get().await?;
        let line_items = check_catalog(&profile, request.line_items)?;
        let totals = Totals::compute(&line_items, currency, &profile, &request.discount_codes)?;

        let now = self.clock.now();
        let mut session = CheckoutSession {
            id: format!("cs_{}", Uuid::new_v4().simple()),
            status: SessionStatus::Created,
            line_items,
            currency,
            buyer: request.buyer,
            shipping_address: request.shipping_address,
            discount_codes: request.discount_codes,
            totals,
            reservation_ids: Vec::new(),
            payment: None,
            pending_completion: None,
            order_id: None,
            cancel_reason: None,
            idempotency_key: request.idempotency_key,
            price_lock_expires_at: now + self.config.price_lock_ttl,
            created_at: now,
            updated_at: now,
        };
        self.save(&mut session).await?;

        info!(
            "🛒 Created checkout session {} ({} items, {})",
            session.id,
            session.item_count(),
            session.totals.total.display()
        );
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> CheckoutResult<CheckoutSession> {
        self.load(session_id).await
    }

    /// Change items, buyer, address or discounts.
    ///
    /// Totals are recomputed and the price lock refreshed. Changing the items
    /// of a `ready_for_complete` session swaps its reservations.
    #[instrument(skip(self, patch))]
    pub async fn update(
        &self,
        session_id: &str,
        patch: SessionPatch,
    ) -> CheckoutResult<CheckoutSession> {
        let _guard = self.sessions.lock(session_id).await;
        let mut session = self.load(session_id).await?;
        if !session.status.is_mutable() {
            return Err(CheckoutError::invalid_state(
                session_id,
                session.status,
                "update",
            ));
        }

        let profile = self.profiles.get().await?;

        let new_items = match patch.line_items {
            Some(items) => {
                let currency = validate_items(&items)?;
                if currency != session.currency {
                    return Err(CheckoutError::Validation(format!(
                        "session {} is priced in {}, items are in {}",
                        session_id, session.currency, currency
                    )));
                }
                let items = check_catalog(&profile, items)?;
                (!same_items(&items, &session.line_items)).then_some(items)
            }
            None => None,
        };

        let totals = {
            let items = new_items.as_deref().unwrap_or(&session.line_items);
            let codes = patch
                .discount_codes
                .as_deref()
                .unwrap_or(&session.discount_codes);
            Totals::compute(items, session.currency, &profile, codes)?
        };

        if let Some(items) = new_items {
            if session.status == SessionStatus::ReadyForComplete {
                self.swap_reservations(&mut session, &items).await?;
            }
            session.line_items = items;
        }
        if let Some(buyer) = patch.buyer {
            session.buyer = Some(buyer);
        }
        if let Some(address) = patch.shipping_address {
            session.shipping_address = Some(address);
        }
        if let Some(codes) = patch.discount_codes {
            session.discount_codes = codes;
        }
        session.totals = totals;
        session.price_lock_expires_at = self.clock.now() + self.config.price_lock_ttl;
        self.save(&mut session).await?;

        debug!(
            "Updated session {} (total {})",
            session.id,
            session.totals.total.display()
        );
        Ok(session)
    }

    /// Reserve stock for every item and move `created -> ready_for_complete`.
    /// If any SKU cannot be reserved, nothing is held and the session stays
    /// in `created`.
    #[instrument(skip(self))]
    pub async fn mark_ready_for_complete(&self, session_id: &str) -> CheckoutResult<CheckoutSession> {
        let _guard = self.sessions.lock(session_id).await;
        let mut session = self.load(session_id).await?;
        match session.status {
            SessionStatus::Created => {}
            SessionStatus::ReadyForComplete => return Ok(session),
            status => return Err(CheckoutError::invalid_state(session_id, status, "mark ready")),
        }

        let profile = self.profiles.get().await?;
        self.check_price_lock(&mut session, &profile).await?;

        let has_email = session
            .buyer
            .as_ref()
            .and_then(|b| b.email.as_deref())
            .is_some_and(|email| !email.trim().is_empty());
        if profile.require_buyer_email && !has_email {
            return Err(CheckoutError::Validation(
                "buyer email is required before completing".into(),
            ));
        }

        let reservations = self
            .inventory
            .reserve_all(&session.line_items, &session.id, self.config.reservation_ttl)
            .await?;
        session.reservation_ids = reservations.into_iter().map(|r| r.id).collect();
        session.status = SessionStatus::ReadyForComplete;

        if let Err(e) = self.save(&mut session).await {
            if let Err(release_err) = self.inventory.release_all(&session.reservation_ids).await {
                warn!(
                    "Failed to release reservations of unsaved session {}: {}",
                    session.id, release_err
                );
            }
            return Err(e);
        }

        info!(
            "Session {} ready for complete ({} reservation(s))",
            session.id,
            session.reservation_ids.len()
        );
        Ok(session)
    }

    /// Pay for the session and turn it into an order.
    ///
    /// Safe to retry with the same idempotency key: a completed key returns
    /// the stored order without repeating any side effect.
    #[instrument(
        skip(self, request),
        fields(session_id = %request.session_id, idempotency_key = %request.idempotency_key)
    )]
    pub async fn complete(&self, request: CompleteRequest) -> CheckoutResult<CompletionResult> {
        let key = request.idempotency_key.trim();
        if key.is_empty() {
            return Err(CheckoutError::Validation(
                "idempotency_key must not be empty".into(),
            ));
        }
        if request.payment.token_id.trim().is_empty() || request.payment.psp_id.trim().is_empty() {
            return Err(CheckoutError::Validation(
                "payment token_id and psp_id are required".into(),
            ));
        }

        let _key_guard = self.keys.lock(&completion_key(key)).await;
        let _session_guard = self.sessions.lock(&request.session_id).await;

        if let Some(result) = self.replay(key, &request.session_id).await? {
            return Ok(result);
        }

        let mut session = self.load(&request.session_id).await?;
        match session.status {
            SessionStatus::ReadyForComplete => {}
            SessionStatus::Completing => {
                return Err(CheckoutError::CompletionPending {
                    session_id: session.id,
                });
            }
            SessionStatus::Cancelled if session.cancel_reason == Some(CancelReason::Expired) => {
                return Err(CheckoutError::SessionExpired {
                    session_id: session.id,
                });
            }
            status => {
                return Err(CheckoutError::invalid_state(&session.id, status, "complete"));
            }
        }

        let profile = self.profiles.get().await?;
        self.check_price_lock(&mut session, &profile).await?;
        self.check_reservations(&mut session).await?;

        let pending = PendingCompletion {
            transaction_id: format!("txn_{}", Uuid::new_v4().simple()),
            idempotency_key: key.to_string(),
            order_id: format!("ord_{}", Uuid::new_v4().simple()),
            token_id: request.payment.token_id.clone(),
            psp_id: request.payment.psp_id.clone(),
            proof: request.payment.proof.clone(),
            started_at: self.clock.now(),
        };
        session.pending_completion = Some(pending.clone());
        session.status = SessionStatus::Completing;
        self.save(&mut session).await?;
        debug!(
            "Session {} completing (txn {})",
            session.id, pending.transaction_id
        );

        let redeem = redeem_request(&session, &pending, &self.merchant_id);
        let receipt = match self.exchange.redeem(&redeem).await {
            Ok(receipt) => receipt,
            Err(CheckoutError::Token(reason)) => {
                session.status = SessionStatus::ReadyForComplete;
                session.pending_completion = None;
                self.save(&mut session).await?;
                info!(
                    "Payment for session {} rejected: {}",
                    session.id,
                    reason.code()
                );
                return Err(reason.into());
            }
            Err(e @ CheckoutError::InvariantViolation(_)) => return Err(e),
            Err(e) => {
                warn!(
                    "Redemption for session {} did not finish, leaving it to reconciliation: {}",
                    session.id, e
                );
                return Err(CheckoutError::CompletionPending {
                    session_id: session.id,
                });
            }
        };
        let payment = payment_ref(&receipt);

        match self.finish(&mut session, &pending, payment.clone()).await {
            Ok(order) => {
                info!(
                    "✅ Session {} completed as order {} ({})",
                    session.id,
                    order.id,
                    order.totals.total.display()
                );
                Ok(CompletionResult {
                    session,
                    order,
                    replayed: false,
                })
            }
            Err(e @ CheckoutError::ReservationNotActive { .. }) => {
                match self.compensate(&mut session, &payment).await {
                    Ok(()) => Err(e),
                    Err(comp_err) => {
                        warn!(
                            "Compensation for session {} failed, leaving it to reconciliation: {}",
                            session.id, comp_err
                        );
                        Err(CheckoutError::CompletionPending {
                            session_id: session.id,
                        })
                    }
                }
            }
            Err(e @ CheckoutError::InvariantViolation(_)) => Err(e),
            Err(e) => {
                warn!(
                    "Completion of session {} interrupted after payment, leaving it to reconciliation: {}",
                    session.id, e
                );
                Err(CheckoutError::CompletionPending {
                    session_id: session.id,
                })
            }
        }
    }

    /// Cancel a session that has not started completing. Cancelling a
    /// cancelled session returns it unchanged.
    #[instrument(skip(self))]
    pub async fn cancel(&self, session_id: &str) -> CheckoutResult<CheckoutSession> {
        let _guard = self.sessions.lock(session_id).await;
        let mut session = self.load(session_id).await?;
        match session.status {
            SessionStatus::Created | SessionStatus::ReadyForComplete => {}
            SessionStatus::Cancelled => return Ok(session),
            status => return Err(CheckoutError::invalid_state(session_id, status, "cancel")),
        }

        self.inventory.release_all(&session.reservation_ids).await?;
        self.close(&mut session, CancelReason::Requested).await?;
        info!("Cancelled checkout session {}", session.id);
        Ok(session)
    }

    /// Cancel every `created`/`ready_for_complete` session whose price lock
    /// lapsed at or before `now`. Returns how many were cancelled.
    #[instrument(skip(self))]
    pub async fn expire_sessions(&self, now: DateTime<Utc>) -> CheckoutResult<usize> {
        let candidates = self
            .retry
            .run("sessions_in", || {
                self.ledger
                    .sessions_in(&[SessionStatus::Created, SessionStatus::ReadyForComplete])
            })
            .await?;

        let mut expired = 0;
        for candidate in candidates.iter().filter(|s| s.price_lock_expired(now)) {
            match self.expire_one(&candidate.id, now).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to expire session {}: {}", candidate.id, e),
            }
        }

        if expired > 0 {
            info!("⏰ Expired {} checkout session(s)", expired);
        }
        Ok(expired)
    }

    /// Resolve sessions stuck in `completing` for longer than the configured
    /// threshold.
    ///
    /// A session without a receipt is redeemed again with its stored
    /// transaction id; the broker answers a repeat with the original
    /// receipt. The saga then resumes from the commit step. If the stock can
    /// no longer be committed the payment is voided and the session
    /// cancelled.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, now: DateTime<Utc>) -> CheckoutResult<ReconcileReport> {
        let stuck = self
            .retry
            .run("sessions_in", || {
                self.ledger.sessions_in(&[SessionStatus::Completing])
            })
            .await?;

        let mut report = ReconcileReport::default();
        for candidate in stuck {
            let Some(pending) = candidate.pending_completion.as_ref() else {
                error!(
                    session_id = %candidate.id,
                    "Session is completing without saga state"
                );
                report.pending += 1;
                continue;
            };
            if now < pending.started_at + self.config.completing_stale_after {
                continue;
            }

            match self.resume(&candidate.id, &pending.idempotency_key).await {
                Ok(Resolution::Completed) => report.completed += 1,
                Ok(Resolution::Reverted) => report.reverted += 1,
                Ok(Resolution::Voided) => report.voided += 1,
                Ok(Resolution::Skipped) => {}
                Err(e) => {
                    warn!("Reconciliation of session {} failed: {}", candidate.id, e);
                    report.pending += 1;
                }
            }
        }

        if report != ReconcileReport::default() {
            info!(
                "🔧 Reconciliation: {} completed, {} reverted, {} voided, {} pending",
                report.completed, report.reverted, report.voided, report.pending
            );
        }
        Ok(report)
    }

    // ---- saga steps -----------------------------------------------------

    /// Everything after a successful redemption: commit, order, idempotency
    /// record, notifications, `completed`. Each step tolerates having run
    /// before, so reconciliation can call this again.
    async fn finish(
        &self,
        session: &mut CheckoutSession,
        pending: &PendingCompletion,
        payment: PaymentRef,
    ) -> CheckoutResult<Order> {
        if session.payment.as_ref() != Some(&payment) {
            session.payment = Some(payment.clone());
            self.save(session).await?;
        }

        self.inventory.commit_all(&session.reservation_ids).await?;

        let now = self.clock.now();
        let order = Order::from_session(&pending.order_id, session, payment, now);
        let inserted = self
            .retry
            .run("insert_order", || self.ledger.insert_order(&order))
            .await?;
        let order = if inserted {
            order
        } else {
            debug!("Order {} already persisted", order.id);
            self.retry
                .run("get_order", || self.ledger.get_order(&pending.order_id))
                .await?
                .ok_or_else(|| {
                    CheckoutError::InvariantViolation(format!(
                        "order {} reported present but not found",
                        pending.order_id
                    ))
                })?
        };

        let record = IdempotencyRecord {
            key: pending.idempotency_key.clone(),
            session_id: session.id.clone(),
            order_id: order.id.clone(),
            created_at: now,
        };
        let recorded = self
            .retry
            .run("insert_idempotency", || self.ledger.insert_idempotency(&record))
            .await?;
        if !recorded {
            let existing = self
                .retry
                .run("get_idempotency", || self.ledger.get_idempotency(&record.key))
                .await?;
            if existing.as_ref().map(|r| (&r.session_id, &r.order_id))
                != Some((&record.session_id, &record.order_id))
            {
                error!(
                    key = %record.key,
                    session_id = %session.id,
                    order_id = %order.id,
                    "Idempotency key bound to a different completion"
                );
                return Err(CheckoutError::InvariantViolation(format!(
                    "idempotency key {} bound twice",
                    record.key
                )));
            }
        }

        let order_payload = serde_json::to_value(&order)
            .map_err(|e| CheckoutError::Store(StoreError::Serialization(e.to_string())))?;
        self.notify(
            EventTopic::CheckoutCompleted,
            json!({
                "session_id": session.id,
                "order_id": order.id,
                "total": order.totals.total,
            }),
        )
        .await?;
        self.notify(EventTopic::OrderCreated, order_payload).await?;

        session.status = SessionStatus::Completed;
        session.order_id = Some(order.id.clone());
        session.pending_completion = None;
        self.save(session).await?;
        self.archive(&session.id).await;

        Ok(order)
    }

    /// Undo a redemption whose stock could not be committed
    async fn compensate(
        &self,
        session: &mut CheckoutSession,
        payment: &PaymentRef,
    ) -> CheckoutResult<()> {
        warn!(
            "Voiding payment {} for session {}: reservations could not be committed",
            payment.receipt_id, session.id
        );
        self.exchange.void(&payment.receipt_id).await?;
        self.inventory.release_all(&session.reservation_ids).await?;
        self.close(session, CancelReason::PaymentVoided).await
    }

    async fn resume(&self, session_id: &str, idempotency_key: &str) -> CheckoutResult<Resolution> {
        let _key_guard = self.keys.lock(&completion_key(idempotency_key)).await;
        let _session_guard = self.sessions.lock(session_id).await;

        let mut session = self.load(session_id).await?;
        if session.status != SessionStatus::Completing {
            return Ok(Resolution::Skipped);
        }
        let pending = session.pending_completion.clone().ok_or_else(|| {
            CheckoutError::InvariantViolation(format!(
                "session {session_id} is completing without saga state"
            ))
        })?;

        let payment = match session.payment.clone() {
            Some(payment) => payment,
            None => {
                let redeem = redeem_request(&session, &pending, &self.merchant_id);
                match self.exchange.redeem(&redeem).await {
                    Ok(receipt) => payment_ref(&receipt),
                    Err(CheckoutError::Token(reason)) => {
                        session.status = SessionStatus::ReadyForComplete;
                        session.pending_completion = None;
                        self.save(&mut session).await?;
                        info!(
                            "Reconciliation returned session {} to ready_for_complete: {}",
                            session.id,
                            reason.code()
                        );
                        return Ok(Resolution::Reverted);
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        match self.finish(&mut session, &pending, payment.clone()).await {
            Ok(order) => {
                info!(
                    "✅ Reconciled session {} as order {}",
                    session.id, order.id
                );
                Ok(Resolution::Completed)
            }
            Err(CheckoutError::ReservationNotActive { .. }) => {
                self.compensate(&mut session, &payment).await?;
                Ok(Resolution::Voided)
            }
            Err(e) => Err(e),
        }
    }

    // ---- helpers --------------------------------------------------------

    async fn replay(
        &self,
        key: &str,
        session_id: &str,
    ) -> CheckoutResult<Option<CompletionResult>> {
        let record = self
            .retry
            .run("get_idempotency", || self.ledger.get_idempotency(key))
            .await?;
        let Some(record) = record else {
            return Ok(None);
        };
        if record.session_id != session_id {
            return Err(CheckoutError::IdempotencyConflict {
                key: key.to_string(),
            });
        }

        let order = self
            .retry
            .run("get_order", || self.ledger.get_order(&record.order_id))
            .await?
            .ok_or_else(|| {
                error!(
                    key,
                    order_id = %record.order_id,
                    "Idempotency record points at a missing order"
                );
                CheckoutError::InvariantViolation(format!(
                    "order {} for idempotency key {} is missing",
                    record.order_id, key
                ))
            })?;
        let session = self.load(session_id).await?;

        debug!("Replayed completion of {} -> {}", session_id, order.id);
        Ok(Some(CompletionResult {
            session,
            order,
            replayed: true,
        }))
    }

    /// Fail with `PriceChanged` or `SessionExpired` if the price lock has
    /// lapsed. Before the error is returned the session's stock is released,
    /// its items are repriced from the catalog, and it is saved back in
    /// `created` with a fresh lock.
    async fn check_price_lock(
        &self,
        session: &mut CheckoutSession,
        profile: &BusinessProfile,
    ) -> CheckoutResult<()> {
        let now = self.clock.now();
        if !session.price_lock_expired(now) {
            return Ok(());
        }

        self.inventory.release_all(&session.reservation_ids).await?;
        session.reservation_ids.clear();
        let changed = reprice(profile, &mut session.line_items);
        session.totals = Totals::compute(
            &session.line_items,
            session.currency,
            profile,
            &session.discount_codes,
        )?;
        session.status = SessionStatus::Created;
        session.price_lock_expires_at = now + self.config.price_lock_ttl;
        self.save(session).await?;

        info!(
            "Price lock lapsed for session {} (prices changed: {})",
            session.id, changed
        );
        let session_id = session.id.clone();
        if changed {
            Err(CheckoutError::PriceChanged { session_id })
        } else {
            Err(CheckoutError::SessionExpired { session_id })
        }
    }

    /// Refuse to take payment against a hold that has lapsed
    async fn check_reservations(&self, session: &mut CheckoutSession) -> CheckoutResult<()> {
        let now = self.clock.now();
        let mut lapsed = None;
        for id in &session.reservation_ids {
            let reservation = self.inventory.get(id).await?;
            if !reservation.is_active() || reservation.is_expired_at(now) {
                lapsed = Some(reservation);
                break;
            }
        }
        let Some(lapsed) = lapsed else {
            return Ok(());
        };

        self.inventory.release_all(&session.reservation_ids).await?;
        session.reservation_ids.clear();
        session.status = SessionStatus::Created;
        self.save(session).await?;

        info!(
            "Reservation {} for session {} is {}; session back to created",
            lapsed.id, session.id, lapsed.status
        );
        Err(CheckoutError::SessionExpired {
            session_id: session.id.clone(),
        })
    }

    /// Swap a ready session's reservations for ones matching `items`.
    ///
    /// If the new set cannot be reserved the previous set is taken again; if
    /// that fails too the session drops back to `created`. Either way the
    /// session is saved before the reservation error is returned.
    async fn swap_reservations(
        &self,
        session: &mut CheckoutSession,
        items: &[LineItem],
    ) -> CheckoutResult<()> {
        let ttl = self.config.reservation_ttl;
        self.inventory.release_all(&session.reservation_ids).await?;
        session.reservation_ids.clear();

        let err = match self.inventory.reserve_all(items, &session.id, ttl).await {
            Ok(reservations) => {
                session.reservation_ids = reservations.into_iter().map(|r| r.id).collect();
                return Ok(());
            }
            Err(e) => e,
        };

        match self
            .inventory
            .reserve_all(&session.line_items, &session.id, ttl)
            .await
        {
            Ok(reservations) => {
                session.reservation_ids = reservations.into_iter().map(|r| r.id).collect();
                debug!("Restored previous reservations for session {}", session.id);
            }
            Err(restore_err) => {
                warn!(
                    "Could not restore reservations for session {}, back to created: {}",
                    session.id, restore_err
                );
                session.status = SessionStatus::Created;
            }
        }
        self.save(session).await?;
        Err(err)
    }

    async fn expire_one(&self, session_id: &str, now: DateTime<Utc>) -> CheckoutResult<bool> {
        let _guard = self.sessions.lock(session_id).await;
        let mut session = self.load(session_id).await?;
        // Activity may have refreshed the lock since the scan
        if !session.status.is_mutable() || !session.price_lock_expired(now) {
            return Ok(false);
        }
        self.inventory.release_all(&session.reservation_ids).await?;
        self.close(&mut session, CancelReason::Expired).await?;
        Ok(true)
    }

    /// Move to `cancelled`, archive and announce
    async fn close(&self, session: &mut CheckoutSession, reason: CancelReason) -> CheckoutResult<()> {
        session.status = SessionStatus::Cancelled;
        session.cancel_reason = Some(reason);
        session.pending_completion = None;
        self.save(session).await?;
        self.archive(&session.id).await;

        let payload = json!({ "session_id": session.id, "reason": reason });
        if let Err(e) = self.notify(EventTopic::CheckoutCancelled, payload).await {
            warn!(
                "Failed to queue checkout.cancelled for session {}: {}",
                session.id, e
            );
        }
        Ok(())
    }

    async fn notify(&self, topic: EventTopic, payload: serde_json::Value) -> CheckoutResult<()> {
        self.webhooks.enqueue(topic, payload).await.map(|_| ())
    }

    async fn load(&self, session_id: &str) -> CheckoutResult<CheckoutSession> {
        self.retry
            .run("get_session", || self.ledger.get_session(session_id))
            .await?
            .ok_or_else(|| CheckoutError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    async fn save(&self, session: &mut CheckoutSession) -> CheckoutResult<()> {
        session.updated_at = self.clock.now();
        let snapshot: &CheckoutSession = session;
        self.retry
            .run("put_session", || self.ledger.put_session(snapshot))
            .await?;
        Ok(())
    }

    async fn archive(&self, session_id: &str) {
        if let Err(e) = self
            .retry
            .run("archive_session", || self.ledger.archive_session(session_id))
            .await
        {
            warn!("Failed to archive session {}: {}", session_id, e);
        }
    }
}

fn completion_key(key: &str) -> String {
    format!("complete:{key}")
}

/// Check items against the catalog and fill in display names.
/// An empty catalog accepts any SKU at any price.
fn check_catalog(profile: &BusinessProfile, items: Vec<LineItem>) -> CheckoutResult<Vec<LineItem>> {
    if profile.catalog.is_empty() {
        return Ok(items);
    }
    items
        .into_iter()
        .map(|mut item| {
            let entry = profile
                .item(&item.sku)
                .ok_or_else(|| CheckoutError::UnknownSku {
                    sku: item.sku.clone(),
                })?;
            if !entry.active {
                return Err(CheckoutError::Validation(format!(
                    "{} is not available for sale",
                    item.sku
                )));
            }
            if entry.unit_price != item.unit_price {
                return Err(CheckoutError::Validation(format!(
                    "unit price for {} is {}, expected {}",
                    item.sku,
                    item.unit_price.display(),
                    entry.unit_price.display()
                )));
            }
            if item.name.is_none() {
                item.name = Some(entry.name.clone());
            }
            Ok(item)
        })
        .collect()
}

/// Bring catalogued items up to current prices. Returns whether anything moved.
fn reprice(profile: &BusinessProfile, items: &mut [LineItem]) -> bool {
    let mut changed = false;
    for item in items.iter_mut() {
        if let Some(entry) = profile.item(&item.sku) {
            if entry.unit_price != item.unit_price {
                item.unit_price = entry.unit_price;
                changed = true;
            }
        }
    }
    changed
}

fn same_items(a: &[LineItem], b: &[LineItem]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.sku == y.sku && x.quantity == y.quantity && x.unit_price == y.unit_price
        })
}

fn redeem_request(
    session: &CheckoutSession,
    pending: &PendingCompletion,
    merchant_id: &str,
) -> RedeemRequest {
    RedeemRequest {
        token_id: pending.token_id.clone(),
        merchant_id: merchant_id.to_string(),
        psp_id: pending.psp_id.clone(),
        amount: session.totals.total,
        transaction_id: pending.transaction_id.clone(),
        proof: pending.proof.clone(),
    }
}

fn payment_ref(receipt: &ucp_core::PaymentReceipt) -> PaymentRef {
    PaymentRef {
        token_id: receipt.token_id.clone(),
        psp_id: receipt.psp_id.clone(),
        transaction_id: receipt.transaction_id.clone(),
        receipt_id: receipt.id.clone(),
    }
}
