//! Shared fixtures for engine tests.

use crate::broker::TokenBroker;
use crate::checkout::CheckoutService;
use crate::config::EngineConfig;
use crate::inventory::InventoryManager;
use crate::memory::MemoryLedger;
use crate::orders::OrderService;
use crate::profile::ProfileCache;
use crate::retry::RetryPolicy;
use crate::webhook::{OutgoingDelivery, WebhookDispatcher, WebhookTransport};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use std::sync::{Arc, Mutex};
use ucp_core::{
    AttemptOutcome, BusinessProfile, CatalogItem, CheckoutError, Currency, EventTopic, FixedClock,
    Money, PaymentToken, ProfileSource, SharedClock, WebhookSubscription,
};

pub const MERCHANT: &str = "merchant_acme";
pub const PSP: &str = "psp_test";
pub const ENDPOINT: &str = "ep_platform";

pub fn usd(amount: i64) -> Money {
    Money::new(amount, Currency::USD)
}

/// A single-use USD token for [`MERCHANT`] and [`PSP`], valid for an hour
pub fn payment_token(id: &str, max_amount: i64, now: DateTime<Utc>) -> PaymentToken {
    PaymentToken {
        id: id.into(),
        issuer_id: "cp_test".into(),
        psp_id: PSP.into(),
        merchant_id: MERCHANT.into(),
        max_amount: usd(max_amount),
        expires_at: now + Duration::hours(1),
        single_use: true,
        consumed_at: None,
        consumed_by: None,
    }
}

/// Zero tax, free shipping, SKUs A ($10) and B ($5)
pub fn profile() -> BusinessProfile {
    BusinessProfile::new(MERCHANT)
        .with_item(CatalogItem {
            sku: "A".into(),
            name: "Widget".into(),
            unit_price: usd(1000),
            active: true,
        })
        .with_item(CatalogItem {
            sku: "B".into(),
            name: "Gadget".into(),
            unit_price: usd(500),
            active: true,
        })
}

/// A fresh Ed25519 key pair: the raw public key and a hex signing function
pub fn signer() -> (Vec<u8>, impl Fn(&[u8]) -> String) {
    let rng = SystemRandom::new();
    let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
    let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
    let public_key = pair.public_key().as_ref().to_vec();
    (public_key, move |message: &[u8]| hex::encode(pair.sign(message).as_ref()))
}

/// Accepts every delivery and remembers it
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<OutgoingDelivery>>,
}

#[async_trait]
impl WebhookTransport for RecordingTransport {
    async fn send(&self, delivery: &OutgoingDelivery) -> AttemptOutcome {
        self.sent.lock().unwrap().push(delivery.clone());
        AttemptOutcome::Delivered { status: 200 }
    }
}

/// A profile source whose profile can be replaced mid-test
pub struct SwappableProfile {
    profile: Mutex<BusinessProfile>,
}

impl SwappableProfile {
    pub fn set(&self, profile: BusinessProfile) {
        *self.profile.lock().unwrap() = profile;
    }
}

#[async_trait]
impl ProfileSource for SwappableProfile {
    async fn load_profile(&self) -> Result<BusinessProfile, CheckoutError> {
        Ok(self.profile.lock().unwrap().clone())
    }
}

/// Every engine component over one in-memory ledger and a pinned clock.
/// Stock: 10 x A, 10 x B. One platform endpoint subscribed to everything.
pub struct Engine {
    pub ledger: Arc<MemoryLedger>,
    pub clock: FixedClock,
    pub profile: Arc<SwappableProfile>,
    pub inventory: Arc<InventoryManager>,
    pub broker: Arc<TokenBroker>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub checkout: Arc<CheckoutService>,
    pub orders: Arc<OrderService>,
    transport: Arc<RecordingTransport>,
}

impl Engine {
    /// Deliver everything queued for the platform endpoint and return the
    /// topics sent since the last call, in order
    pub async fn delivered_topics(&self) -> Vec<EventTopic> {
        self.webhooks.drain_endpoint(ENDPOINT).await.unwrap();
        let mut sent = self.transport.sent.lock().unwrap();
        sent.drain(..).map(|d| d.topic).collect()
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(
        3,
        std::time::Duration::from_millis(1),
        std::time::Duration::from_millis(2),
    )
    .without_jitter()
}

pub async fn engine() -> Engine {
    engine_with(profile()).await
}

pub async fn engine_with(business: BusinessProfile) -> Engine {
    let config = EngineConfig {
        store_retry: fast_retry(),
        ..EngineConfig::default()
    };
    let ledger = Arc::new(MemoryLedger::new());
    let clock = FixedClock::new(Utc::now());
    let shared_clock: SharedClock = Arc::new(clock.clone());

    let profile = Arc::new(SwappableProfile {
        profile: Mutex::new(business),
    });
    let profiles = Arc::new(ProfileCache::new(
        profile.clone(),
        shared_clock.clone(),
        config.profile_cache_ttl,
    ));
    let inventory = Arc::new(
        InventoryManager::new(ledger.clone(), shared_clock.clone()).with_retry(config.store_retry),
    );
    let broker = Arc::new(
        TokenBroker::new(ledger.clone(), shared_clock.clone()).with_retry(config.store_retry),
    );
    let transport = Arc::new(RecordingTransport::default());
    let webhooks = Arc::new(WebhookDispatcher::new(
        ledger.clone(),
        shared_clock.clone(),
        transport.clone(),
        config.webhook,
    )
    .with_retry(config.store_retry));
    webhooks
        .subscribe(WebhookSubscription::new(
            ENDPOINT,
            "https://platform.example/hooks",
            "whsec_test",
        ))
        .await
        .unwrap();
    inventory.set_stock("A", 10).await.unwrap();
    inventory.set_stock("B", 10).await.unwrap();

    let checkout = Arc::new(CheckoutService::new(
        ledger.clone(),
        shared_clock.clone(),
        MERCHANT,
        profiles,
        inventory.clone(),
        broker.clone(),
        webhooks.clone(),
        config.clone(),
    ));
    let orders = Arc::new(
        OrderService::new(ledger.clone(), shared_clock, webhooks.clone())
            .with_retry(config.store_retry),
    );

    Engine {
        ledger,
        clock,
        profile,
        inventory,
        broker,
        webhooks,
        checkout,
        orders,
        transport,
    }
}
