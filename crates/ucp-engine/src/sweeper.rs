//! # Sweeper
//!
//! Enforces the wall-clock deadlines. One pass expires lapsed reservations,
//! cancels idle sessions, reconciles stuck completions and prunes idle
//! keyed locks. The daemon runs it on an interval; nothing here cancels an
//! in-flight request.

use crate::checkout::{CheckoutService, ReconcileReport};
use crate::inventory::InventoryManager;
use crate::locks::KeyedLocks;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reservations_expired: usize,
    pub sessions_expired: usize,
    pub reconciled: ReconcileReport,
    pub locks_pruned: usize,
}

impl SweepReport {
    /// True if the pass changed nothing
    pub fn is_idle(&self) -> bool {
        self.reservations_expired == 0
            && self.sessions_expired == 0
            && self.reconciled == ReconcileReport::default()
    }
}

pub struct Sweeper {
    checkout: Arc<CheckoutService>,
    inventory: Arc<InventoryManager>,
    locks: Vec<KeyedLocks>,
}

impl Sweeper {
    pub fn new(checkout: Arc<CheckoutService>, inventory: Arc<InventoryManager>) -> Self {
        Self {
            checkout,
            inventory,
            locks: Vec::new(),
        }
    }

    /// Builder: prune another lock table on every pass
    pub fn with_locks(mut self, locks: KeyedLocks) -> Self {
        self.locks.push(locks);
        self
    }

    /// Run every sweep once. A failing step is logged and the rest still run.
    pub async fn run_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        match self.inventory.expire(now).await {
            Ok(n) => report.reservations_expired = n,
            Err(e) => warn!("Reservation sweep failed: {}", e),
        }
        match self.checkout.expire_sessions(now).await {
            Ok(n) => report.sessions_expired = n,
            Err(e) => warn!("Session expiry sweep failed: {}", e),
        }
        match self.checkout.reconcile(now).await {
            Ok(reconciled) => report.reconciled = reconciled,
            Err(e) => warn!("Reconciliation sweep failed: {}", e),
        }

        report.locks_pruned = self.checkout.prune_locks()
            + self.inventory.locks().prune()
            + self.locks.iter().map(KeyedLocks::prune).sum::<usize>();

        if !report.is_idle() {
            debug!(?report, "Sweep finished");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::{CompleteRequest, CreateSessionRequest};
    use crate::testing::{engine, payment_token, usd, Engine, PSP};
    use chrono::Duration;
    use ucp_core::{CancelReason, Clock, LineItem, PaymentCredential, SessionStatus};

    fn sweeper(engine: &Engine) -> Sweeper {
        Sweeper::new(engine.checkout.clone(), engine.inventory.clone())
            .with_locks(engine.broker.locks().clone())
            .with_locks(engine.orders.locks().clone())
    }

    #[tokio::test]
    async fn test_sweep_expires_holds_and_idle_sessions() {
        let engine = engine().await;
        let session = engine
            .checkout
            .create(CreateSessionRequest::new(vec![LineItem::new("A", 3, usd(1000))]))
            .await
            .unwrap();
        engine
            .checkout
            .mark_ready_for_complete(&session.id)
            .await
            .unwrap();

        let sweeper = sweeper(&engine);
        assert!(sweeper.run_once(engine.clock.now()).await.is_idle());

        engine.clock.advance(Duration::minutes(16));
        let report = sweeper.run_once(engine.clock.now()).await;
        assert_eq!(report.reservations_expired, 1);
        assert_eq!(report.sessions_expired, 1);

        let session = engine.checkout.get(&session.id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Cancelled);
        assert_eq!(session.cancel_reason, Some(CancelReason::Expired));
        assert_eq!(engine.inventory.stock("A").await.unwrap().available(), 10);
    }

    #[tokio::test]
    async fn test_sweep_reconciles_and_prunes() {
        let engine = engine().await;
        let session = engine
            .checkout
            .create(CreateSessionRequest::new(vec![LineItem::new("A", 1, usd(1000))]))
            .await
            .unwrap();
        engine
            .checkout
            .mark_ready_for_complete(&session.id)
            .await
            .unwrap();
        engine
            .broker
            .register(payment_token("tok_1", 1000, engine.clock.now()))
            .await
            .unwrap();

        engine.ledger.fail_next("insert_order", 3);
        engine
            .checkout
            .complete(CompleteRequest::new(
                &session.id,
                PaymentCredential::new("tok_1", PSP),
                "idem-1",
            ))
            .await
            .unwrap_err();

        engine.clock.advance(Duration::minutes(2));
        let report = sweeper(&engine).run_once(engine.clock.now()).await;
        assert_eq!(report.reconciled.completed, 1);
        assert!(report.locks_pruned > 0);
        assert_eq!(
            engine.checkout.get(&session.id).await.unwrap().status,
            SessionStatus::Completed
        );
    }
}
