//! # Inventory Reservation Manager
//!
//! Time-bounded holds on stock. Every mutation of a SKU's stock level and of
//! the reservations against it runs under that SKU's lock, so distinct
//! products never contend and the same product never oversells.
//!
//! Stock arithmetic per reservation transition:
//!
//! | Transition | `reserved` | `committed` |
//! |------------|------------|-------------|
//! | reserve    | `+q`       |             |
//! | commit     | `-q`       | `+q`        |
//! | release    | `-q`       |             |
//! | expire     | `-q`       |             |

use crate::locks::KeyedLocks;
use crate::retry::RetryPolicy;
use chrono::Duration;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, instrument, warn};
use ucp_core::{
    CheckoutError, CheckoutResult, LineItem, Reservation, ReservationStatus, SharedClock,
    SharedLedger, StockLevel,
};
use uuid::Uuid;

pub struct InventoryManager {
    ledger: SharedLedger,
    clock: SharedClock,
    locks: KeyedLocks,
    retry: RetryPolicy,
}

impl InventoryManager {
    pub fn new(ledger: SharedLedger, clock: SharedClock) -> Self {
        Self {
            ledger,
            clock,
            locks: KeyedLocks::new("sku"),
            retry: RetryPolicy::default(),
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

    /// Set the on-hand quantity for a SKU, creating it if needed.
    ///
    /// Fails if the new quantity is below what is already reserved or sold.
    #[instrument(skip(self))]
    pub async fn set_stock(&self, sku: &str, on_hand: u32) -> CheckoutResult<StockLevel> {
        let _guard = self.locks.lock(sku).await;

        let mut level = self
            .retry
            .run("get_stock", || self.ledger.get_stock(sku))
            .await?
            .unwrap_or_else(|| StockLevel::new(0));
        level.on_hand = on_hand;
        if !level.is_consistent() {
            return Err(CheckoutError::Validation(format!(
                "on_hand {} for {} is below reserved {} + committed {}",
                on_hand, sku, level.reserved, level.committed
            )));
        }

        self.retry
            .run("put_stock", || self.ledger.put_stock(sku, level))
            .await?;
        debug!("Stock for {} set to {}", sku, on_hand);
        Ok(level)
    }

    /// Current stock level for a SKU
    pub async fn stock(&self, sku: &str) -> CheckoutResult<StockLevel> {
        self.retry
            .run("get_stock", || self.ledger.get_stock(sku))
            .await?
            .ok_or_else(|| CheckoutError::UnknownSku {
                sku: sku.to_string(),
            })
    }

    pub async fn get(&self, reservation_id: &str) -> CheckoutResult<Reservation> {
        self.load(reservation_id).await
    }

    /// Hold `quantity` units of `sku` for a session until `now + ttl`
    #[instrument(skip(self, ttl))]
    pub async fn reserve(
        &self,
        sku: &str,
        quantity: u32,
        session_id: &str,
        ttl: Duration,
    ) -> CheckoutResult<Reservation> {
        if quantity == 0 {
            return Err(CheckoutError::Validation(format!(
                "reservation quantity for {sku} must be positive"
            )));
        }

        let _guard = self.locks.lock(sku).await;

        let mut level = self
            .retry
            .run("get_stock", || self.ledger.get_stock(sku))
            .await?
            .ok_or_else(|| CheckoutError::UnknownSku {
                sku: sku.to_string(),
            })?;

        let available = level.available();
        if available < quantity {
            debug!(
                "Insufficient stock for {}: requested {}, available {}",
                sku, quantity, available
            );
            return Err(CheckoutError::InsufficientStock {
                sku: sku.to_string(),
                requested: quantity,
                available,
            });
        }

        level.reserved = level
            .reserved
            .checked_add(quantity)
            .ok_or_else(|| self.oversell(sku, level))?;
        if !level.is_consistent() {
            return Err(self.oversell(sku, level));
        }

        let now = self.clock.now();
        let reservation = Reservation {
            id: format!("res_{}", Uuid::new_v4().simple()),
            sku: sku.to_string(),
            quantity,
            session_id: session_id.to_string(),
            status: ReservationStatus::Active,
            expires_at: now + ttl,
            created_at: now,
            resolved_at: None,
        };

        self.retry
            .run("write_reservation", || {
                self.ledger.write_reservation(level, &reservation)
            })
            .await?;

        info!(
            "Reserved {} x {} for session {} ({})",
            quantity, sku, session_id, reservation.id
        );
        Ok(reservation)
    }

    /// Turn a hold into a sale.
    ///
    /// Committing an already-committed reservation is a no-op; committing a
    /// released or expired one fails with `ReservationNotActive`.
    #[instrument(skip(self))]
    pub async fn commit(&self, reservation_id: &str) -> CheckoutResult<Reservation> {
        let sku = self.load(reservation_id).await?.sku;
        let _guard = self.locks.lock(&sku).await;

        // Re-read under the lock: expiry may have won the race
        let reservation = self.load(reservation_id).await?;
        match reservation.status {
            ReservationStatus::Committed => {
                debug!("Reservation {} already committed", reservation_id);
                Ok(reservation)
            }
            ReservationStatus::Released | ReservationStatus::Expired => {
                Err(not_active(&reservation))
            }
            ReservationStatus::Active => self.commit_locked(reservation).await,
        }
    }

    /// Give a hold back. Releasing a non-active reservation is a no-op.
    #[instrument(skip(self))]
    pub async fn release(&self, reservation_id: &str) -> CheckoutResult<Reservation> {
        self.resolve(reservation_id, ReservationStatus::Released)
            .await
    }

    /// Expire every active reservation whose deadline has passed.
    /// Returns how many were expired.
    #[instrument(skip(self))]
    pub async fn expire(&self, now: chrono::DateTime<chrono::Utc>) -> CheckoutResult<usize> {
        let candidates = self
            .retry
            .run("expired_reservations", || self.ledger.expired_reservations(now))
            .await?;

        let mut expired = 0;
        for candidate in candidates {
            let _guard = self.locks.lock(&candidate.sku).await;
            let current = self.load(&candidate.id).await?;
            // A commit or release may have landed first
            if !current.is_expired_at(now) {
                continue;
            }
            self.resolve_locked(current, ReservationStatus::Expired).await?;
            expired += 1;
        }

        if expired > 0 {
            info!("⏰ Expired {} reservation(s)", expired);
        }
        Ok(expired)
    }

    /// Reserve every line item or nothing.
    ///
    /// Quantities of repeated SKUs are summed into one reservation. On the
    /// first failure, reservations already taken are released and the error
    /// is returned.
    #[instrument(skip(self, items, ttl), fields(items = items.len()))]
    pub async fn reserve_all(
        &self,
        items: &[LineItem],
        session_id: &str,
        ttl: Duration,
    ) -> CheckoutResult<Vec<Reservation>> {
        let mut per_sku: BTreeMap<&str, u32> = BTreeMap::new();
        for item in items {
            let quantity = per_sku.entry(item.sku.as_str()).or_insert(0);
            *quantity = quantity.checked_add(item.quantity).ok_or_else(|| {
                CheckoutError::Validation(format!("quantity overflow for {}", item.sku))
            })?;
        }

        let mut taken: Vec<Reservation> = Vec::with_capacity(per_sku.len());
        for (sku, quantity) in per_sku {
            match self.reserve(sku, quantity, session_id, ttl).await {
                Ok(reservation) => taken.push(reservation),
                Err(e) => {
                    let ids: Vec<String> = taken.into_iter().map(|r| r.id).collect();
                    if let Err(release_err) = self.release_all(&ids).await {
                        warn!(
                            "Failed to release partial reservations for session {}: {}",
                            session_id, release_err
                        );
                    }
                    return Err(e);
                }
            }
        }
        Ok(taken)
    }

    /// Release a set of reservations, continuing past failures.
    /// Returns the first error, if any.
    pub async fn release_all(&self, reservation_ids: &[String]) -> CheckoutResult<()> {
        let mut first_error = None;
        for id in reservation_ids {
            if let Err(e) = self.release(id).await {
                warn!("Failed to release reservation {}: {}", id, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Commit a set of reservations, all or nothing.
    ///
    /// Every SKU lock is taken up front, in SKU order, and every reservation
    /// is checked before the first one is committed.
    #[instrument(skip(self, reservation_ids), fields(count = reservation_ids.len()))]
    pub async fn commit_all(&self, reservation_ids: &[String]) -> CheckoutResult<()> {
        let mut skus = BTreeSet::new();
        for id in reservation_ids {
            skus.insert(self.load(id).await?.sku);
        }
        let mut guards = Vec::with_capacity(skus.len());
        for sku in &skus {
            guards.push(self.locks.lock(sku).await);
        }

        let mut to_commit = Vec::with_capacity(reservation_ids.len());
        for id in reservation_ids {
            let reservation = self.load(id).await?;
            match reservation.status {
                ReservationStatus::Committed => {}
                ReservationStatus::Active => to_commit.push(reservation),
                ReservationStatus::Released | ReservationStatus::Expired => {
                    return Err(not_active(&reservation));
                }
            }
        }
        for reservation in to_commit {
            self.commit_locked(reservation).await?;
        }
        Ok(())
    }

    /// Move an active reservation to committed. Caller holds the SKU lock.
    async fn commit_locked(&self, mut reservation: Reservation) -> CheckoutResult<Reservation> {
        let sku = reservation.sku.clone();
        let mut level = self.level_for(&sku).await?;
        level.reserved = level
            .reserved
            .checked_sub(reservation.quantity)
            .ok_or_else(|| self.oversell(&sku, level))?;
        level.committed = level
            .committed
            .checked_add(reservation.quantity)
            .ok_or_else(|| self.oversell(&sku, level))?;
        if !level.is_consistent() {
            return Err(self.oversell(&sku, level));
        }

        reservation.status = ReservationStatus::Committed;
        reservation.resolved_at = Some(self.clock.now());
        self.write(level, &reservation).await?;

        info!(
            "Committed {} x {} ({})",
            reservation.quantity, sku, reservation.id
        );
        Ok(reservation)
    }

    async fn resolve(
        &self,
        reservation_id: &str,
        to: ReservationStatus,
    ) -> CheckoutResult<Reservation> {
        let sku = self.load(reservation_id).await?.sku;
        let _guard = self.locks.lock(&sku).await;
        let current = self.load(reservation_id).await?;
        if !current.is_active() {
            debug!(
                "Reservation {} already {}, nothing to {}",
                reservation_id, current.status, to
            );
            return Ok(current);
        }
        self.resolve_locked(current, to).await
    }

    /// Move an active reservation to released/expired. Caller holds the SKU lock.
    async fn resolve_locked(
        &self,
        mut reservation: Reservation,
        to: ReservationStatus,
    ) -> CheckoutResult<Reservation> {
        let sku = reservation.sku.clone();
        let mut level = self.level_for(&sku).await?;
        level.reserved = level
            .reserved
            .checked_sub(reservation.quantity)
            .ok_or_else(|| self.oversell(&sku, level))?;

        reservation.status = to;
        reservation.resolved_at = Some(self.clock.now());
        self.write(level, &reservation).await?;

        debug!(
            "Reservation {} {} ({} x {})",
            reservation.id, to, reservation.quantity, sku
        );
        Ok(reservation)
    }

    async fn load(&self, reservation_id: &str) -> CheckoutResult<Reservation> {
        self.retry
            .run("get_reservation", || self.ledger.get_reservation(reservation_id))
            .await?
            .ok_or_else(|| CheckoutError::ReservationNotFound {
                reservation_id: reservation_id.to_string(),
            })
    }

    async fn level_for(&self, sku: &str) -> CheckoutResult<StockLevel> {
        self.retry
            .run("get_stock", || self.ledger.get_stock(sku))
            .await?
            .ok_or_else(|| {
                error!("Reservation references SKU {} with no stock record", sku);
                CheckoutError::InvariantViolation(format!("no stock record for {sku}"))
            })
    }

    async fn write(&self, level: StockLevel, reservation: &Reservation) -> CheckoutResult<()> {
        self.retry
            .run("write_reservation", || {
                self.ledger.write_reservation(level, reservation)
            })
            .await?;
        Ok(())
    }

    fn oversell(&self, sku: &str, level: StockLevel) -> CheckoutError {
        error!(
            sku,
            on_hand = level.on_hand,
            reserved = level.reserved,
            committed = level.committed,
            "Stock invariant violated"
        );
        CheckoutError::InvariantViolation(format!(
            "stock for {} inconsistent: on_hand={} reserved={} committed={}",
            sku, level.on_hand, level.reserved, level.committed
        ))
    }
}

fn not_active(reservation: &Reservation) -> CheckoutError {
    CheckoutError::ReservationNotActive {
        reservation_id: reservation.id.clone(),
        status: reservation.status.to_string(),
    }
}
