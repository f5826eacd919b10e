//! # Durable Ledger
//!
//! A [`LedgerStore`] on a single redb file. Records are stored as JSON.
//!
//! | Table | Key | Value |
//! |-------|-----|-------|
//! | `sessions` | session id | `CheckoutSession` |
//! | `archived_sessions` | session id | `CheckoutSession` |
//! | `creation_keys` | creation idempotency key | session id |
//! | `stock` | sku | `StockLevel` |
//! | `reservations` | reservation id | `Reservation` |
//! | `tokens` | token id | `PaymentToken` |
//! | `receipts` | receipt id | `PaymentReceipt` |
//! | `token_audit` | `(token_id, n)` | `TokenAuditEntry` |
//! | `orders` | order id | `Order` |
//! | `idempotency` | key | `IdempotencyRecord` |
//! | `subscriptions` | endpoint id | `WebhookSubscription` |
//! | `webhook_queue` | `(endpoint_id, sequence)` | `WebhookEvent` |
//! | `webhook_index` | delivery id | `(endpoint_id, sequence)` |
//! | `archived_webhooks` | delivery id | `WebhookEvent` |
//! | `delivery_attempts` | `(delivery_id, n)` | `DeliveryAttempt` |
//! | `dead_letters` | n | `DeadLetter` |
//! | `counters` | name | `u64` |
//!
//! Every atomic primitive of the trait runs in one write transaction. redb
//! serializes write transactions, so a check-and-mutate inside one is a
//! single step to every other caller. Commits are durable when they return.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use ucp_core::{
    CheckoutSession, DeadLetter, DeliveryAttempt, DeliveryStatus, IdempotencyRecord, LedgerStore,
    Order, PaymentReceipt, PaymentToken, Reservation, SessionStatus, StockLevel, StoreError,
    StoreResult, TokenAuditEntry, WebhookEvent, WebhookSubscription,
};

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;
type SeqTable = TableDefinition<'static, (&'static str, u64), &'static [u8]>;

const SESSIONS: JsonTable = TableDefinition::new("sessions");
const ARCHIVED_SESSIONS: JsonTable = TableDefinition::new("archived_sessions");
const CREATION_KEYS: TableDefinition<&str, &str> = TableDefinition::new("creation_keys");
const STOCK: JsonTable = TableDefinition::new("stock");
const RESERVATIONS: JsonTable = TableDefinition::new("reservations");
const TOKENS: JsonTable = TableDefinition::new("tokens");
const RECEIPTS: JsonTable = TableDefinition::new("receipts");
const TOKEN_AUDIT: SeqTable = TableDefinition::new("token_audit");
const ORDERS: JsonTable = TableDefinition::new("orders");
const IDEMPOTENCY: JsonTable = TableDefinition::new("idempotency");
const SUBSCRIPTIONS: JsonTable = TableDefinition::new("subscriptions");
const WEBHOOK_QUEUE: SeqTable = TableDefinition::new("webhook_queue");
const WEBHOOK_INDEX: JsonTable = TableDefinition::new("webhook_index");
const ARCHIVED_WEBHOOKS: JsonTable = TableDefinition::new("archived_webhooks");
const DELIVERY_ATTEMPTS: SeqTable = TableDefinition::new("delivery_attempts");
const DEAD_LETTERS: TableDefinition<u64, &[u8]> = TableDefinition::new("dead_letters");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

const DEAD_LETTER_COUNTER: &str = "dead_letters";

/// Errors from the redb file, before they are mapped to [`StoreError`]
#[derive(Debug, Error)]
pub enum LedgerDbError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Conflict(String),
}

type DbResult<T> = Result<T, LedgerDbError>;

impl From<LedgerDbError> for StoreError {
    fn from(e: LedgerDbError) -> Self {
        match e {
            LedgerDbError::Serialization(e) => StoreError::Serialization(e.to_string()),
            LedgerDbError::Conflict(msg) => StoreError::Conflict(msg),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Ledger backed by a redb database file
#[derive(Clone)]
pub struct RedbLedger {
    db: Arc<Database>,
}

impl RedbLedger {
    /// Open or create the ledger file at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerDbError> {
        let path = path.as_ref();
        let ledger = Self::init(Database::create(path)?)?;
        info!("📒 Ledger opened at {}", path.display());
        Ok(ledger)
    }

    /// Open a ledger that lives only as long as this value (for tests)
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, LedgerDbError> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> DbResult<Self> {
        // Create every table up front so read transactions never miss one
        let txn = db.begin_write()?;
        {
            for table in [
                SESSIONS,
                ARCHIVED_SESSIONS,
                STOCK,
                RESERVATIONS,
                TOKENS,
                RECEIPTS,
                ORDERS,
                IDEMPOTENCY,
                SUBSCRIPTIONS,
                WEBHOOK_INDEX,
                ARCHIVED_WEBHOOKS,
            ] {
                let _ = txn.open_table(table)?;
            }
            for table in [TOKEN_AUDIT, WEBHOOK_QUEUE, DELIVERY_ATTEMPTS] {
                let _ = txn.open_table(table)?;
            }
            let _ = txn.open_table(CREATION_KEYS)?;
            let _ = txn.open_table(DEAD_LETTERS)?;
            let _ = txn.open_table(COUNTERS)?;
        }
        txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Run `f` on the blocking pool; redb calls do file I/O
    async fn with_db<T, F>(&self, operation: &'static str, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> DbResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        match tokio::task::spawn_blocking(move || f(&db)).await {
            Ok(result) => result.map_err(|e| {
                debug!(operation, "ledger call failed: {}", e);
                StoreError::from(e)
            }),
            Err(e) => Err(StoreError::Unavailable(format!(
                "{operation} did not complete: {e}"
            ))),
        }
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> DbResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn read<T: DeserializeOwned>(db: &Database, table: JsonTable, key: &str) -> DbResult<Option<T>> {
    let txn = db.begin_read()?;
    let table = txn.open_table(table)?;
    let value = table.get(key)?;
    value.map(|guard| decode(guard.value())).transpose()
}

fn read_all<T: DeserializeOwned>(db: &Database, table: JsonTable) -> DbResult<Vec<T>> {
    let txn = db.begin_read()?;
    let table = txn.open_table(table)?;
    let mut values = Vec::new();
    for result in table.iter()? {
        let (_key, value) = result?;
        values.push(decode(value.value())?);
    }
    Ok(values)
}

fn read_seq<T: DeserializeOwned>(db: &Database, table: SeqTable, prefix: &str) -> DbResult<Vec<T>> {
    let txn = db.begin_read()?;
    let table = txn.open_table(table)?;
    let mut values = Vec::new();
    for result in table.range((prefix, 0u64)..=(prefix, u64::MAX))? {
        let (_key, value) = result?;
        values.push(decode(value.value())?);
    }
    Ok(values)
}

fn put<T: Serialize>(txn: &WriteTransaction, table: JsonTable, key: &str, value: &T) -> DbResult<()> {
    let bytes = serde_json::to_vec(value)?;
    let mut table = txn.open_table(table)?;
    table.insert(key, bytes.as_slice())?;
    Ok(())
}

fn write<T: Serialize>(db: &Database, table: JsonTable, key: &str, value: &T) -> DbResult<()> {
    let txn = db.begin_write()?;
    put(&txn, table, key, value)?;
    txn.commit()?;
    Ok(())
}

/// Increment a named counter and return its new value
fn bump(txn: &WriteTransaction, name: &str) -> DbResult<u64> {
    let mut counters = txn.open_table(COUNTERS)?;
    let next = counters.get(name)?.map(|guard| guard.value()).unwrap_or(0) + 1;
    counters.insert(name, next)?;
    Ok(next)
}

/// Append under the next `n` for `prefix`; `kind` namespaces the counter
fn append_seq<T: Serialize>(
    db: &Database,
    table: SeqTable,
    kind: &str,
    prefix: &str,
    value: &T,
) -> DbResult<()> {
    let bytes = serde_json::to_vec(value)?;
    let txn = db.begin_write()?;
    let n = bump(&txn, &format!("{kind}:{prefix}"))?;
    {
        let mut table = txn.open_table(table)?;
        table.insert((prefix, n), bytes.as_slice())?;
    }
    txn.commit()?;
    Ok(())
}

#[async_trait]
impl LedgerStore for RedbLedger {
    // ---- sessions -------------------------------------------------------

    async fn get_session(&self, id: &str) -> StoreResult<Option<CheckoutSession>> {
        let id = id.to_string();
        self.with_db("get_session", move |db| {
            match read(db, SESSIONS, &id)? {
                Some(session) => Ok(Some(session)),
                None => read(db, ARCHIVED_SESSIONS, &id),
            }
        })
        .await
    }

    async fn put_session(&self, session: &CheckoutSession) -> StoreResult<()> {
        let session = session.clone();
        self.with_db("put_session", move |db| {
            let txn = db.begin_write()?;
            let archived = txn.open_table(ARCHIVED_SESSIONS)?.get(session.id.as_str())?.is_some();
            if archived {
                put(&txn, ARCHIVED_SESSIONS, &session.id, &session)?;
            } else {
                put(&txn, SESSIONS, &session.id, &session)?;
            }
            if let Some(key) = &session.idempotency_key {
                let mut keys = txn.open_table(CREATION_KEYS)?;
                keys.insert(key.as_str(), session.id.as_str())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn archive_session(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.with_db("archive_session", move |db| {
            let txn = db.begin_write()?;
            {
                let mut active = txn.open_table(SESSIONS)?;
                let removed = active.remove(id.as_str())?.map(|guard| guard.value().to_vec());
                if let Some(bytes) = removed {
                    let mut archived = txn.open_table(ARCHIVED_SESSIONS)?;
                    archived.insert(id.as_str(), bytes.as_slice())?;
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn sessions_in(&self, statuses: &[SessionStatus]) -> StoreResult<Vec<CheckoutSession>> {
        let statuses = statuses.to_vec();
        self.with_db("sessions_in", move |db| {
            let mut sessions: Vec<CheckoutSession> = read_all(db, SESSIONS)?;
            sessions.retain(|s| statuses.contains(&s.status));
            sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            Ok(sessions)
        })
        .await
    }

    async fn session_by_creation_key(&self, key: &str) -> StoreResult<Option<CheckoutSession>> {
        let key = key.to_string();
        self.with_db("session_by_creation_key", move |db| {
            let session_id = {
                let txn = db.begin_read()?;
                let keys = txn.open_table(CREATION_KEYS)?;
                let id = keys.get(key.as_str())?.map(|guard| guard.value().to_string());
                id
            };
            let Some(session_id) = session_id else {
                return Ok(None);
            };
            match read(db, SESSIONS, &session_id)? {
                Some(session) => Ok(Some(session)),
                None => read(db, ARCHIVED_SESSIONS, &session_id),
            }
        })
        .await
    }

    // ---- inventory ------------------------------------------------------

    async fn get_stock(&self, sku: &str) -> StoreResult<Option<StockLevel>> {
        let sku = sku.to_string();
        self.with_db("get_stock", move |db| read(db, STOCK, &sku)).await
    }

    async fn put_stock(&self, sku: &str, level: StockLevel) -> StoreResult<()> {
        let sku = sku.to_string();
        self.with_db("put_stock", move |db| write(db, STOCK, &sku, &level))
            .await
    }

    async fn get_reservation(&self, id: &str) -> StoreResult<Option<Reservation>> {
        let id = id.to_string();
        self.with_db("get_reservation", move |db| read(db, RESERVATIONS, &id))
            .await
    }

    async fn write_reservation(
        &self,
        level: StockLevel,
        reservation: &Reservation,
    ) -> StoreResult<()> {
        let reservation = reservation.clone();
        self.with_db("write_reservation", move |db| {
            let txn = db.begin_write()?;
            put(&txn, STOCK, &reservation.sku, &level)?;
            put(&txn, RESERVATIONS, &reservation.id, &reservation)?;
            txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn expired_reservations(&self, now: DateTime<Utc>) -> StoreResult<Vec<Reservation>> {
        self.with_db("expired_reservations", move |db| {
            let mut reservations: Vec<Reservation> = read_all(db, RESERVATIONS)?;
            reservations.retain(|r| r.is_expired_at(now));
            Ok(reservations)
        })
        .await
    }

    // ---- tokens ---------------------------------------------------------

    async fn get_token(&self, id: &str) -> StoreResult<Option<PaymentToken>> {
        let id = id.to_string();
        self.with_db("get_token", move |db| read(db, TOKENS, &id)).await
    }

    async fn put_token(&self, token: &PaymentToken) -> StoreResult<()> {
        let token = token.clone();
        self.with_db("put_token", move |db| write(db, TOKENS, &token.id, &token))
            .await
    }

    async fn consume_token(&self, receipt: &PaymentReceipt) -> StoreResult<bool> {
        let receipt = receipt.clone();
        self.with_db("consume_token", move |db| {
            let txn = db.begin_write()?;
            let token: Option<PaymentToken> = {
                let tokens = txn.open_table(TOKENS)?;
                let value = tokens.get(receipt.token_id.as_str())?;
                value.map(|guard| decode(guard.value())).transpose()?
            };
            let mut token = token.ok_or_else(|| {
                LedgerDbError::Conflict(format!("token {} does not exist", receipt.token_id))
            })?;
            if token.is_consumed() {
                // Dropping the transaction aborts it
                return Ok(false);
            }
            token.consumed_at = Some(receipt.redeemed_at);
            token.consumed_by = Some(receipt.id.clone());
            put(&txn, RECEIPTS, &receipt.id, &receipt)?;
            put(&txn, TOKENS, &token.id, &token)?;
            txn.commit()?;
            Ok(true)
        })
        .await
    }

    async fn get_receipt(&self, id: &str) -> StoreResult<Option<PaymentReceipt>> {
        let id = id.to_string();
        self.with_db("get_receipt", move |db| read(db, RECEIPTS, &id)).await
    }

    async fn put_receipt(&self, receipt: &PaymentReceipt) -> StoreResult<()> {
        let receipt = receipt.clone();
        self.with_db("put_receipt", move |db| {
            write(db, RECEIPTS, &receipt.id, &receipt)
        })
        .await
    }

    async fn append_token_audit(&self, entry: &TokenAuditEntry) -> StoreResult<()> {
        let entry = entry.clone();
        self.with_db("append_token_audit", move |db| {
            append_seq(db, TOKEN_AUDIT, "audit", &entry.token_id, &entry)
        })
        .await
    }

    async fn token_audit(&self, token_id: &str) -> StoreResult<Vec<TokenAuditEntry>> {
        let token_id = token_id.to_string();
        self.with_db("token_audit", move |db| read_seq(db, TOKEN_AUDIT, &token_id))
            .await
    }

    // ---- orders ---------------------------------------------------------

    async fn insert_order(&self, order: &Order) -> StoreResult<bool> {
        let order = order.clone();
        self.with_db("insert_order", move |db| {
            let txn = db.begin_write()?;
            if txn.open_table(ORDERS)?.get(order.id.as_str())?.is_some() {
                return Ok(false);
            }
            put(&txn, ORDERS, &order.id, &order)?;
            txn.commit()?;
            Ok(true)
        })
        .await
    }

    async fn get_order(&self, id: &str) -> StoreResult<Option<Order>> {
        let id = id.to_string();
        self.with_db("get_order", move |db| read(db, ORDERS, &id)).await
    }

    async fn update_order(&self, order: &Order) -> StoreResult<()> {
        let order = order.clone();
        self.with_db("update_order", move |db| {
            let txn = db.begin_write()?;
            if txn.open_table(ORDERS)?.get(order.id.as_str())?.is_none() {
                return Err(LedgerDbError::Conflict(format!(
                    "order {} does not exist",
                    order.id
                )));
            }
            put(&txn, ORDERS, &order.id, &order)?;
            txn.commit()?;
            Ok(())
        })
        .await
    }

    // ---- idempotency ----------------------------------------------------

    async fn get_idempotency(&self, key: &str) -> StoreResult<Option<IdempotencyRecord>> {
        let key = key.to_string();
        self.with_db("get_idempotency", move |db| read(db, IDEMPOTENCY, &key))
            .await
    }

    async fn insert_idempotency(&self, record: &IdempotencyRecord) -> StoreResult<bool> {
        let record = record.clone();
        self.with_db("insert_idempotency", move |db| {
            let txn = db.begin_write()?;
            if txn.open_table(IDEMPOTENCY)?.get(record.key.as_str())?.is_some() {
                return Ok(false);
            }
            put(&txn, IDEMPOTENCY, &record.key, &record)?;
            txn.commit()?;
            Ok(true)
        })
        .await
    }

    // ---- webhooks -------------------------------------------------------

    async fn put_subscription(&self, subscription: &WebhookSubscription) -> StoreResult<()> {
        let subscription = subscription.clone();
        self.with_db("put_subscription", move |db| {
            write(db, SUBSCRIPTIONS, &subscription.endpoint_id, &subscription)
        })
        .await
    }

    async fn subscriptions(&self) -> StoreResult<Vec<WebhookSubscription>> {
        self.with_db("subscriptions", |db| read_all(db, SUBSCRIPTIONS))
            .await
    }

    async fn enqueue_webhooks(&self, events: Vec<WebhookEvent>) -> StoreResult<Vec<WebhookEvent>> {
        self.with_db("enqueue_webhooks", move |db| {
            let txn = db.begin_write()?;
            let mut enqueued = Vec::with_capacity(events.len());
            for mut event in events {
                event.sequence = bump(&txn, &format!("webhook:{}", event.endpoint_id))?;
                let bytes = serde_json::to_vec(&event)?;
                {
                    let mut queue = txn.open_table(WEBHOOK_QUEUE)?;
                    queue.insert((event.endpoint_id.as_str(), event.sequence), bytes.as_slice())?;
                }
                put(
                    &txn,
                    WEBHOOK_INDEX,
                    &event.delivery_id,
                    &(event.endpoint_id.as_str(), event.sequence),
                )?;
                enqueued.push(event);
            }
            txn.commit()?;
            Ok(enqueued)
        })
        .await
    }

    async fn next_pending_webhook(&self, endpoint_id: &str) -> StoreResult<Option<WebhookEvent>> {
        let endpoint_id = endpoint_id.to_string();
        self.with_db("next_pending_webhook", move |db| {
            let queue: Vec<WebhookEvent> = read_seq(db, WEBHOOK_QUEUE, &endpoint_id)?;
            Ok(queue
                .into_iter()
                .find(|e| e.status == DeliveryStatus::Pending))
        })
        .await
    }

    async fn update_webhook(&self, event: &WebhookEvent) -> StoreResult<()> {
        let event = event.clone();
        self.with_db("update_webhook", move |db| {
            let key = (event.endpoint_id.as_str(), event.sequence);
            let bytes = serde_json::to_vec(&event)?;
            let txn = db.begin_write()?;
            {
                let mut queue = txn.open_table(WEBHOOK_QUEUE)?;
                // Archived events are final
                if queue.get(key)?.is_some() {
                    queue.insert(key, bytes.as_slice())?;
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn archive_webhook(&self, delivery_id: &str) -> StoreResult<()> {
        let delivery_id = delivery_id.to_string();
        self.with_db("archive_webhook", move |db| {
            let txn = db.begin_write()?;
            {
                let mut index = txn.open_table(WEBHOOK_INDEX)?;
                let location = index
                    .remove(delivery_id.as_str())?
                    .map(|guard| decode::<(String, u64)>(guard.value()))
                    .transpose()?;
                if let Some((endpoint_id, sequence)) = location {
                    let mut queue = txn.open_table(WEBHOOK_QUEUE)?;
                    let removed = queue
                        .remove((endpoint_id.as_str(), sequence))?
                        .map(|guard| guard.value().to_vec());
                    if let Some(bytes) = removed {
                        let mut archived = txn.open_table(ARCHIVED_WEBHOOKS)?;
                        archived.insert(delivery_id.as_str(), bytes.as_slice())?;
                    }
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn endpoints_with_pending(&self) -> StoreResult<Vec<String>> {
        self.with_db("endpoints_with_pending", |db| {
            let txn = db.begin_read()?;
            let queue = txn.open_table(WEBHOOK_QUEUE)?;
            let mut endpoints = BTreeSet::new();
            for result in queue.iter()? {
                let (key, value) = result?;
                let endpoint_id = key.value().0;
                if endpoints.contains(endpoint_id) {
                    continue;
                }
                let event: WebhookEvent = decode(value.value())?;
                if event.status == DeliveryStatus::Pending {
                    endpoints.insert(endpoint_id.to_string());
                }
            }
            Ok(endpoints.into_iter().collect())
        })
        .await
    }

    async fn append_delivery_attempt(&self, attempt: &DeliveryAttempt) -> StoreResult<()> {
        let attempt = attempt.clone();
        self.with_db("append_delivery_attempt", move |db| {
            append_seq(db, DELIVERY_ATTEMPTS, "attempts", &attempt.delivery_id, &attempt)
        })
        .await
    }

    async fn delivery_attempts(&self, delivery_id: &str) -> StoreResult<Vec<DeliveryAttempt>> {
        let delivery_id = delivery_id.to_string();
        self.with_db("delivery_attempts", move |db| {
            read_seq(db, DELIVERY_ATTEMPTS, &delivery_id)
        })
        .await
    }

    async fn put_dead_letter(&self, entry: &DeadLetter) -> StoreResult<()> {
        let entry = entry.clone();
        self.with_db("put_dead_letter", move |db| {
            let bytes = serde_json::to_vec(&entry)?;
            let txn = db.begin_write()?;
            let n = bump(&txn, DEAD_LETTER_COUNTER)?;
            {
                let mut letters = txn.open_table(DEAD_LETTERS)?;
                letters.insert(n, bytes.as_slice())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn dead_letters(&self) -> StoreResult<Vec<DeadLetter>> {
        self.with_db("dead_letters", |db| {
            let txn = db.begin_read()?;
            let letters = txn.open_table(DEAD_LETTERS)?;
            let mut entries = Vec::new();
            for result in letters.iter()? {
                let (_key, value) = result?;
                entries.push(decode(value.value())?);
            }
            Ok(entries)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ucp_core::{Buyer, Currency, EventTopic, LineItem, Money, Totals};
    use uuid::Uuid;

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

    fn session(id: &str) -> CheckoutSession {
        let now = Utc::now();
        CheckoutSession {
            id: id.into(),
            status: SessionStatus::Completed,
            line_items: vec![LineItem::new("A", 1, Money::new(1000, Currency::USD))],
            currency: Currency::USD,
            buyer: None,
            shipping_address: None,
            discount_codes: Vec::new(),
            totals: Totals::zero(Currency::USD),
            reservation_ids: Vec::new(),
            payment: None,
            pending_completion: None,
            order_id: None,
            cancel_reason: None,
            idempotency_key: None,
            price_lock_expires_at: now + Duration::minutes(15),
            created_at: now,
            updated_at: now,
        }
    }

    fn event(endpoint: &str, delivery_id: &str) -> WebhookEvent {
        WebhookEvent {
            delivery_id: delivery_id.into(),
            endpoint_id: endpoint.into(),
            sequence: 0,
            topic: EventTopic::OrderCreated,
            payload: serde_json::json!({ "order_id": "ord_1" }),
            target_url: "http://localhost/hooks".into(),
            attempts: 0,
            status: DeliveryStatus::Pending,
            next_attempt_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_consume_token_is_compare_and_set() {
        let ledger = Arc::new(RedbLedger::open_in_memory().unwrap());
        ledger.put_token(&token("tok")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
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
        for id in losers {
            assert!(ledger.get_receipt(&id).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_consume_unknown_token_is_a_conflict() {
        let ledger = RedbLedger::open_in_memory().unwrap();
        let err = ledger.consume_token(&receipt("missing", "r1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(ledger.get_receipt("r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_idempotency_is_insert_if_absent() {
        let ledger = RedbLedger::open_in_memory().unwrap();
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
    async fn test_webhook_queue_is_ordered_per_endpoint() {
        let ledger = RedbLedger::open_in_memory().unwrap();
        let first = ledger
            .enqueue_webhooks(vec![event("a", "d1"), event("b", "d2")])
            .await
            .unwrap();
        let second = ledger.enqueue_webhooks(vec![event("a", "d3")]).await.unwrap();
        let sequences: Vec<_> = first.iter().chain(&second).map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 1, 2]);

        // A retry pending on the head keeps it at the head
        let mut head = ledger.next_pending_webhook("a").await.unwrap().unwrap();
        assert_eq!(head.delivery_id, "d1");
        head.attempts = 1;
        ledger.update_webhook(&head).await.unwrap();
        assert_eq!(
            ledger.next_pending_webhook("a").await.unwrap().unwrap().attempts,
            1
        );

        ledger.archive_webhook("d1").await.unwrap();
        let head = ledger.next_pending_webhook("a").await.unwrap().unwrap();
        assert_eq!(head.delivery_id, "d3");
        assert_eq!(ledger.endpoints_with_pending().await.unwrap(), vec!["a", "b"]);

        ledger.archive_webhook("d3").await.unwrap();
        assert_eq!(ledger.endpoints_with_pending().await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_archived_session_stays_readable_by_creation_key() {
        let ledger = RedbLedger::open_in_memory().unwrap();
        let mut session = session("cs_1");
        session.idempotency_key = Some("create-1".into());
        ledger.put_session(&session).await.unwrap();
        assert_eq!(
            ledger.sessions_in(&[session.status]).await.unwrap().len(),
            1
        );

        ledger.archive_session("cs_1").await.unwrap();
        assert!(ledger.sessions_in(&[session.status]).await.unwrap().is_empty());
        let found = ledger.session_by_creation_key("create-1").await.unwrap().unwrap();
        assert_eq!(found.id, "cs_1");

        // Writes to an archived session update the archive
        session.buyer = Some(Buyer {
            email: Some("buyer@example.com".into()),
            ..Buyer::default()
        });
        ledger.put_session(&session).await.unwrap();
        assert!(ledger.sessions_in(&[session.status]).await.unwrap().is_empty());
        let reread = ledger.get_session("cs_1").await.unwrap().unwrap();
        let email = reread.buyer.and_then(|b| b.email);
        assert_eq!(email.as_deref(), Some("buyer@example.com"));
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let path = std::env::temp_dir().join(format!("ucp-ledger-{}.redb", Uuid::new_v4().simple()));

        {
            let ledger = RedbLedger::open(&path).unwrap();
            ledger.put_token(&token("tok")).await.unwrap();
            ledger.consume_token(&receipt("tok", "rcpt_1")).await.unwrap();
            ledger.enqueue_webhooks(vec![event("a", "d1")]).await.unwrap();
        }

        let ledger = RedbLedger::open(&path).unwrap();
        let token = ledger.get_token("tok").await.unwrap().unwrap();
        assert_eq!(token.consumed_by.as_deref(), Some("rcpt_1"));
        assert!(ledger.get_receipt("rcpt_1").await.unwrap().is_some());
        let pending = ledger.next_pending_webhook("a").await.unwrap().unwrap();
        assert_eq!(pending.delivery_id, "d1");
        assert_eq!(pending.payload["order_id"], "ord_1");

        // Sequences continue where they left off
        let next = ledger.enqueue_webhooks(vec![event("a", "d2")]).await.unwrap();
        assert_eq!(next[0].sequence, 2);

        drop(ledger);
        let _ = std::fs::remove_file(&path);
    }
}
