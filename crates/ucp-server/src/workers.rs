//! # Background Workers
//!
//! The sweep loop. Webhook delivery has its own loop in
//! [`WebhookDispatcher::run`](ucp_engine::WebhookDispatcher::run).

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::info;
use ucp_core::SharedClock;
use ucp_engine::Sweeper;

/// Run a sweep every `interval` until `shutdown` flips to true
pub async fn run_sweeper(
    sweeper: Arc<Sweeper>,
    clock: SharedClock,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("🧹 Sweeper started (every {:?})", interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = sweeper.run_once(clock.now()).await;
                if !report.is_idle() {
                    info!(
                        "🧹 Sweep: {} hold(s) expired, {} session(s) expired, {} completion(s) reconciled",
                        report.reservations_expired,
                        report.sessions_expired,
                        report.reconciled.completed
                    );
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as Ttl, TimeZone, Utc};
    use ucp_core::{
        BusinessProfile, FixedClock, SharedExchange, SharedLedger, StaticProfileSource,
    };
    use ucp_engine::{
        CheckoutService, EngineConfig, HttpTransport, InventoryManager, MemoryLedger,
        ProfileCache, TokenBroker, WebhookDispatcher,
    };

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_expires_holds_and_stops_on_shutdown() {
        let ledger: SharedLedger = Arc::new(MemoryLedger::new());
        let fixed = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()));
        let clock: SharedClock = fixed.clone();
        let config = EngineConfig::default();

        let inventory = Arc::new(InventoryManager::new(ledger.clone(), clock.clone()));
        let exchange: SharedExchange = Arc::new(TokenBroker::new(ledger.clone(), clock.clone()));
        let webhooks = Arc::new(WebhookDispatcher::new(
            ledger.clone(),
            clock.clone(),
            Arc::new(HttpTransport::new(Duration::from_secs(1)).unwrap()),
            config.webhook.clone(),
        ));
        let profiles = Arc::new(ProfileCache::new(
            Arc::new(StaticProfileSource::new(BusinessProfile::new("merchant_acme"))),
            clock.clone(),
            config.profile_cache_ttl,
        ));
        let checkout = Arc::new(CheckoutService::new(
            ledger,
            clock.clone(),
            "merchant_acme",
            profiles,
            inventory.clone(),
            exchange,
            webhooks,
            config,
        ));
        let sweeper = Arc::new(Sweeper::new(checkout, inventory.clone()));

        inventory.set_stock("A", 3).await.unwrap();
        inventory
            .reserve("A", 2, "cs_1", Ttl::minutes(1))
            .await
            .unwrap();
        fixed.advance(Ttl::minutes(2));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_sweeper(
            sweeper,
            clock,
            Duration::from_millis(10),
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(inventory.stock("A").await.unwrap().available(), 3);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
