//! # In-memory Ledger
//!
//! A [`LedgerStore`] backed by `tokio::sync::RwLock`-protected maps. Nothing
//! survives a restart; the daemon runs on
//! [`RedbLedger`](crate::redb_ledger::RedbLedger) and tests run on this.
//!
//! Atomic primitives hold the relevant write lock for the whole
//! check-and-mutate, so concurrent callers observe them as single steps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use ucp_core::{
    CheckoutSession, DeadLetter, DeliveryAttempt, DeliveryStatus, IdempotencyRecord, LedgerStore,
    Order, PaymentReceipt, PaymentToken, Reservation, SessionStatus, StockLevel, StoreError,
    StoreResult, TokenAuditEntry, WebhookEvent, WebhookSubscription,
};

#[derive(Debug, Default)]
struct WebhookQueues {
    /// endpoint_id -> sequence -> event
    live: HashMap<String, BTreeMap<u64, WebhookEvent>>,
    /// Last sequence handed out per endpoint
    sequences: HashMap<String, u64>,
    /// Delivered or dead-lettered events, by delivery id
    archived: HashMap<String, WebhookEvent>,
}

#[derive(Debug, Default)]
pub struct MemoryLedger {
    sessions: RwLock<HashMap<String, CheckoutSession>>,
    archived_sessions: RwLock<HashMap<String, CheckoutSession>>,
    stock: RwLock<HashMap<String, StockLevel>>,
    reservations: RwLock<HashMap<String, Reservation>>,
    tokens: RwLock<HashMap<String, PaymentToken>>,
    receipts: RwLock<HashMap<String, PaymentReceipt>>,
    token_audit: RwLock<Vec<TokenAuditEntry>>,
    orders: RwLock<HashMap<String, Order>>,
    idempotency: RwLock<HashMap<String, IdempotencyRecord>>,
    subscriptions: RwLock<BTreeMap<String, WebhookSubscription>>,
    webhooks: RwLock<WebhookQueues>,
    attempts: RwLock<Vec<DeliveryAttempt>>,
    dead_letters: RwLock<Vec<DeadLetter>>,

    #[cfg(test)]
    faults: std::sync::Mutex<HashMap<&'static str, u32>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// A delivered or dead-lettered event
    pub async fn archived_webhook(&self, delivery_id: &str) -> Option<WebhookEvent> {
        self.webhooks.read().await.archived.get(delivery_id).cloned()
    }

    /// Number of orders persisted
    pub async fn order_count(&self) -> usize {
        self.orders.read().await.len()
    }

    /// Number of payment receipts persisted
    pub async fn receipt_count(&self) -> usize {
        self.receipts.read().await.len()
    }

    /// Make the next `times` calls to `operation` fail with `Unavailable`
    #[cfg(test)]
    pub fn fail_next(&self, operation: &'static str, times: u32) {
        let mut faults = self.faults.lock().unwrap_or_else(|p| p.into_inner());
        faults.insert(operation, times);
    }

    fn check(&self, operation: &'static str) -> StoreResult<()> {
        #[cfg(test)]
        {
            let mut faults = self.faults.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(remaining) = faults.get_mut(operation) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StoreError::Unavailable(format!(
                        "injected fault on {operation}"
                    )));
                }
            }
        }
        let _ = operation;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    // ---- sessions -------------------------------------------------------

    async fn get_session(&self, id: &str) -> StoreResult<Option<CheckoutSession>> {
        self.check("get_session")?;
        if let Some(session) = self.sessions.read().await.get(id) {
            return Ok(Some(session.clone()));
        }
        Ok(self.archived_sessions.read().await.get(id).cloned())
    }

    async fn put_session(&self, session: &CheckoutSession) -> StoreResult<()> {
        self.check("put_session")?;
        let mut archived = self.archived_sessions.write().await;
        if let Some(existing) = archived.get_mut(&session.id) {
            *existing = session.clone();
            return Ok(());
        }
        drop(archived);
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn archive_session(&self, id: &str) -> StoreResult<()> {
        self.check("archive_session")?;
        let removed = self.sessions.write().await.remove(id);
        if let Some(session) = removed {
            self.archived_sessions
                .write()
                .await
                .insert(id.to_string(), session);
        }
        Ok(())
    }

    async fn sessions_in(&self, statuses: &[SessionStatus]) -> StoreResult<Vec<CheckoutSession>> {
        self.check("sessions_in")?;
        let mut sessions: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| statuses.contains(&s.status))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn session_by_creation_key(&self, key: &str) -> StoreResult<Option<CheckoutSession>> {
        self.check("session_by_creation_key")?;
        let matches = |s: &&CheckoutSession| s.idempotency_key.as_deref() == Some(key);
        if let Some(session) = self.sessions.read().await.values().find(matches) {
            return Ok(Some(session.clone()));
        }
        Ok(self
            .archived_sessions
            .read()
            .await
            .values()
            .find(matches)
            .cloned())
    }

    // ---- inventory ------------------------------------------------------

    async fn get_stock(&self, sku: &str) -> StoreResult<Option<StockLevel>> {
        self.check("get_stock")?;
        Ok(self.stock.read().await.get(sku).copied())
    }

    async fn put_stock(&self, sku: &str, level: StockLevel) -> StoreResult<()> {
        self.check("put_stock")?;
        self.stock.write().await.insert(sku.to_string(), level);
        Ok(())
    }

    async fn get_reservation(&self, id: &str) -> StoreResult<Option<Reservation>> {
        self.check("get_reservation")?;
        Ok(self.reservations.read().await.get(id).cloned())
    }

    async fn write_reservation(
        &self,
        level: StockLevel,
        reservation: &Reservation,
    ) -> StoreResult<()> {
        self.check("write_reservation")?;
        // Fixed order: stock, then reservations
        let mut stock = self.stock.write().await;
        let mut reservations = self.reservations.write().await;
        stock.insert(reservation.sku.clone(), level);
        reservations.insert(reservation.id.clone(), reservation.clone());
        Ok(())
    }

    async fn expired_reservations(&self, now: DateTime<Utc>) -> StoreResult<Vec<Reservation>> {
        self.check("expired_reservations")?;
        Ok(self
            .reservations
            .read()
            .await
            .values()
            .filter(|r| r.is_expired_at(now))
            .cloned()
            .collect())
    }

    // ---- tokens ---------------------------------------------------------

    async fn get_token(&self, id: &str) -> StoreResult<Option<PaymentToken>> {
        self.check("get_token")?;
        Ok(self.tokens.read().await.get(id).cloned())
    }

    async fn put_token(&self, token: &PaymentToken) -> StoreResult<()> {
        self.check("put_token")?;
        self.tokens
            .write()
            .await
            .insert(token.id.clone(), token.clone());
        Ok(())
    }

    async fn consume_token(&self, receipt: &PaymentReceipt) -> StoreResult<bool> {
        self.check("consume_token")?;
        let mut tokens = self.tokens.write().await;
        let token = tokens.get_mut(&receipt.token_id).ok_or_else(|| {
            StoreError::Conflict(format!("token {} does not exist", receipt.token_id))
        })?;
        if token.is_consumed() {
            return Ok(false);
        }
        // Tokens before receipts, the only order both locks are taken in
        self.receipts
            .write()
            .await
            .insert(receipt.id.clone(), receipt.clone());
        token.consumed_at = Some(receipt.redeemed_at);
        token.consumed_by = Some(receipt.id.clone());
        Ok(true)
    }

    async fn get_receipt(&self, id: &str) -> StoreResult<Option<PaymentReceipt>> {
        self.check("get_receipt")?;
        Ok(self.receipts.read().await.get(id).cloned())
    }

    async fn put_receipt(&self, receipt: &PaymentReceipt) -> StoreResult<()> {
        self.check("put_receipt")?;
        self.receipts
            .write()
            .await
            .insert(receipt.id.clone(), receipt.clone());
        Ok(())
    }

    async fn append_token_audit(&self, entry: &TokenAuditEntry) -> StoreResult<()> {
        self.check("append_token_audit")?;
        self.token_audit.write().await.push(entry.clone());
        Ok(())
    }

    async fn token_audit(&self, token_id: &str) -> StoreResult<Vec<TokenAuditEntry>> {
        self.check("token_audit")?;
        Ok(self
            .token_audit
            .read()
            .await
            .iter()
            .filter(|e| e.token_id == token_id)
            .cloned()
            .collect())
    }

    // ---- orders ---------------------------------------------------------

    async fn insert_order(&self, order: &Order) -> StoreResult<bool> {
        self.check("insert_order")?;
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.id) {
            return Ok(false);
        }
        orders.insert(order.id.clone(), order.clone());
        Ok(true)
    }

    async fn get_order(&self, id: &str) -> StoreResult<Option<Order>> {
        self.check("get_order")?;
        Ok(self.orders.read().await.get(id).cloned())
    }

    async fn update_order(&self, order: &Order) -> StoreResult<()> {
        self.check("update_order")?;
        let mut orders = self.orders.write().await;
        match orders.get_mut(&order.id) {
            Some(existing) => {
                *existing = order.clone();
                Ok(())
            }
            None => Err(StoreError::Conflict(format!(
                "order {} does not exist",
                order.id
            ))),
        }
    }

    // ---- idempotency ----------------------------------------------------

    async fn get_idempotency(&self, key: &str) -> StoreResult<Option<IdempotencyRecord>> {
        self.check("get_idempotency")?;
        Ok(self.idempotency.read().await.get(key).cloned())
    }

    async fn insert_idempotency(&self, record: &IdempotencyRecord) -> StoreResult<bool> {
        self.check("insert_idempotency")?;
        let mut records = self.idempotency.write().await;
        if records.contains_key(&record.key) {
            return Ok(false);
        }
        records.insert(record.key.clone(), record.clone());
        Ok(true)
    }

    // ---- webhooks -------------------------------------------------------

    async fn put_subscription(&self, subscription: &WebhookSubscription) -> StoreResult<()> {
        self.check("put_subscription")?;
        self.subscriptions
            .write()
            .await
            .insert(subscription.endpoint_id.clone(), subscription.clone());
        Ok(())
    }

    async fn subscriptions(&self) -> StoreResult<Vec<WebhookSubscription>> {
        self.check("subscriptions")?;
        Ok(self.subscriptions.read().await.values().cloned().collect())
    }

    async fn enqueue_webhooks(&self, events: Vec<WebhookEvent>) -> StoreResult<Vec<WebhookEvent>> {
        self.check("enqueue_webhooks")?;
        let mut queues = self.webhooks.write().await;
        let mut enqueued = Vec::with_capacity(events.len());
        for mut event in events {
            let sequence = queues
                .sequences
                .entry(event.endpoint_id.clone())
                .or_insert(0);
            *sequence += 1;
            event.sequence = *sequence;
            queues
                .live
                .entry(event.endpoint_id.clone())
                .or_default()
                .insert(event.sequence, event.clone());
            enqueued.push(event);
        }
        Ok(enqueued)
    }

    async fn next_pending_webhook(&self, endpoint_id: &str) -> StoreResult<Option<WebhookEvent>> {
        self.check("next_pending_webhook")?;
        let queues = self.webhooks.read().await;
        Ok(queues.live.get(endpoint_id).and_then(|queue| {
            queue
                .values()
                .find(|e| e.status == DeliveryStatus::Pending)
                .cloned()
        }))
    }

    async fn update_webhook(&self, event: &WebhookEvent) -> StoreResult<()> {
        self.check("update_webhook")?;
        let mut queues = self.webhooks.write().await;
        if let Some(slot) = queues
            .live
            .get_mut(&event.endpoint_id)
            .and_then(|queue| queue.get_mut(&event.sequence))
        {
            *slot = event.clone();
        }
        Ok(())
    }

    async fn archive_webhook(&self, delivery_id: &str) -> StoreResult<()> {
        self.check("archive_webhook")?;
        let mut queues = self.webhooks.write().await;
        let mut removed = None;
        for queue in queues.live.values_mut() {
            let sequence = queue
                .iter()
                .find(|(_, e)| e.delivery_id == delivery_id)
                .map(|(seq, _)| *seq);
            if let Some(seq) = sequence {
                removed = queue.remove(&seq);
                break;
            }
        }
        if let Some(event) = removed {
            queues.archived.insert(delivery_id.to_string(), event);
        }
        Ok(())
    }

    async fn endpoints_with_pending(&self) -> StoreResult<Vec<String>> {
        self.check("endpoints_with_pending")?;
        let queues = self.webhooks.read().await;
        let mut endpoints: Vec<_> = queues
            .live
            .iter()
            .filter(|(_, queue)| queue.values().any(|e| e.status == DeliveryStatus::Pending))
            .map(|(endpoint, _)| endpoint.clone())
            .collect();
        endpoints.sort();
        Ok(endpoints)
    }

    async fn append_delivery_attempt(&self, attempt: &DeliveryAttempt) -> StoreResult<()> {
        self.check("append_delivery_attempt")?;
        self.attempts.write().await.push(attempt.clone());
        Ok(())
    }

    async fn delivery_attempts(&self, delivery_id: &str) -> StoreResult<Vec<DeliveryAttempt>> {
        self.check("delivery_attempts")?;
        Ok(self
            .attempts
            .read()
            .await
            .iter()
            .filter(|a| a.delivery_id == delivery_id)
            .cloned()
            .collect())
    }

    async fn put_dead_letter(&self, entry: &DeadLetter) -> StoreResult<()> {
        self.check("put_dead_letter")?;
        self.dead_letters.write().await.push(entry.clone());
        Ok(())
    }

    async fn dead_letters(&self) -> StoreResult<Vec<DeadLetter>> {
        self.check("dead_letters")?;
        Ok(self.dead_letters.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;
    use ucp_core::{Currency, EventTopic, Money};

    fn token(id: &str) -> PaymentToken {
        PaymentToken {
            id: id.into(),
            issuer_id: "cp".into(),
            psp_id: "psp".into(),
            merchant_id: "m".into(),
            max_amount: Money::new(1000, Currency::USD),
            expires_at: Utc::now() + Duration::hours(1),
            single_use: true,
            consumed_at: None,
            consumed_by: None,
        }
    }

    fn receipt(token_id: &str, id: &str) -> PaymentReceipt {
        PaymentReceipt {
            id: id.into(),
            token_id: token_id.into(),
            transaction_id: format!("txn_{id}"),
            merchant_id: "m".into(),
            psp_id: "psp".into(),
            amount: Money::new(500, Currency::USD),
            redeemed_at: Utc::now(),
            voided_at: None,
        }
    }

    fn event(endpoint: &str, delivery_id: &str) -> WebhookEvent {
        WebhookEvent {
            delivery_id: delivery_id.into(),
            endpoint_id: endpoint.into(),
            sequence: 0,
            topic: EventTopic::OrderCreated,
            payload: serde_json::json!({}),
            target_url: "http://localhost/hooks".into(),
            attempts: 0,
            status: DeliveryStatus::Pending,
            next_attempt_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_consume_token_is_compare_and_set() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.put_token(&token("tok")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                let receipt = receipt("tok", &format!("rcpt_{i}"));
                let won = ledger.consume_token(&receipt).await.unwrap();
                (won, receipt.id)
            }));
        }
        let mut winners = Vec::new();
        let mut losers = Vec::new();
        for h in handles {
            match h.await.unwrap() {
                (true, id) => winners.push(id),
                (false, id) => losers.push(id),
            }
        }
        assert_eq!(winners.len(), 1);

        let token = ledger.get_token("tok").await.unwrap().unwrap();
        assert_eq!(token.consumed_by.as_ref(), Some(&winners[0]));
        assert!(ledger.get_receipt(&winners[0]).await.unwrap().is_some());
        // A losing call leaves no receipt behind
        for id in losers {
            assert!(ledger.get_receipt(&id).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_insert_idempotency_is_insert_if_absent() {
        let ledger = MemoryLedger::new();
        let record = IdempotencyRecord {
            key: "k".into(),
            session_id: "cs_1".into(),
            order_id: "ord_1".into(),
            created_at: Utc::now(),
        };
        assert!(ledger.insert_idempotency(&record).await.unwrap());

        let other = IdempotencyRecord {
            session_id: "cs_2".into(),
            ..record.clone()
        };
        assert!(!ledger.insert_idempotency(&other).await.unwrap());
        assert_eq!(
            ledger.get_idempotency("k").await.unwrap().unwrap().session_id,
            "cs_1"
        );
    }

    #[tokio::test]
    async fn test_webhook_sequences_are_per_endpoint() {
        let ledger = MemoryLedger::new();
        let first = ledger
            .enqueue_webhooks(vec![event("a", "d1"), event("b", "d2")])
            .await
            .unwrap();
        let second = ledger.enqueue_webhooks(vec![event("a", "d3")]).await.unwrap();
        let sequences: Vec<_> = first.iter().chain(&second).map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 1, 2]);

        let head = ledger.next_pending_webhook("a").await.unwrap().unwrap();
        assert_eq!(head.delivery_id, "d1");

        ledger.archive_webhook("d1").await.unwrap();
        let head = ledger.next_pending_webhook("a").await.unwrap().unwrap();
        assert_eq!(head.delivery_id, "d3");
        assert!(ledger.archived_webhook("d1").await.is_some());
        assert_eq!(ledger.endpoints_with_pending().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_fault_injection_fails_then_recovers() {
        let ledger = MemoryLedger::new();
        ledger.fail_next("get_stock", 2);
        assert!(matches!(
            ledger.get_stock("A").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(ledger.get_stock("A").await.is_err());
        assert!(ledger.get_stock("A").await.unwrap().is_none());
    }
}
