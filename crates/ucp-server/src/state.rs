//! # Application State
//!
//! Wires the engine together: one redb ledger and one clock shared by every
//! service, stock seeded from the business profile, webhook subscriptions
//! loaded from TOML.

use crate::config::AppConfig;
use anyhow::Context;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use ucp_core::{
    CheckoutError, SharedClock, SharedExchange, SharedLedger, SystemClock, WebhookSubscription,
};
use ucp_engine::{
    CheckoutService, HttpTransport, InventoryManager, MerchantKeyring, OrderService, ProfileCache,
    RedbLedger, Sweeper, TokenBroker, TomlProfileSource, WebhookDispatcher,
};

/// Shape of `config/webhooks.toml`
#[derive(Debug, Default, Deserialize)]
pub struct WebhookFile {
    #[serde(default)]
    pub subscriptions: Vec<WebhookSubscription>,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub merchant_id: String,
    pub ledger: SharedLedger,
    pub checkout: Arc<CheckoutService>,
    pub orders: Arc<OrderService>,
    pub inventory: Arc<InventoryManager>,
    pub broker: Arc<TokenBroker>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub sweeper: Arc<Sweeper>,
    pub clock: SharedClock,
}

impl AppState {
    /// Build every service, seed stock and register webhook endpoints
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let ledger: SharedLedger = Arc::new(open_ledger(&config.ledger_path)?);
        let clock: SharedClock = Arc::new(SystemClock);
        let retry = config.engine.store_retry;

        // Business profile; loading it here makes a bad file fail startup
        let profiles = Arc::new(ProfileCache::new(
            Arc::new(TomlProfileSource::new(&config.profile_path)),
            clock.clone(),
            config.engine.profile_cache_ttl,
        ));
        let profile = profiles
            .get()
            .await
            .with_context(|| format!("failed to load {}", config.profile_path.display()))?;

        if let Some(expected) = &config.engine.merchant_id {
            anyhow::ensure!(
                *expected == profile.merchant_id,
                "UCP_MERCHANT_ID is {expected} but {} belongs to {}",
                config.profile_path.display(),
                profile.merchant_id
            );
        }

        // The ledger owns stock once a SKU is known; the profile only seeds new ones
        let inventory = Arc::new(InventoryManager::new(ledger.clone(), clock.clone()).with_retry(retry));
        let mut seeded = 0;
        for seed in &profile.stock {
            match inventory.stock(&seed.sku).await {
                Ok(_) => continue,
                Err(CheckoutError::UnknownSku { .. }) => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to read stock for {}", seed.sku))
                }
            }
            inventory
                .set_stock(&seed.sku, seed.on_hand)
                .await
                .with_context(|| format!("failed to seed stock for {}", seed.sku))?;
            seeded += 1;
        }
        info!(
            "Seeded stock for {} new SKU(s), {} already in the ledger",
            seeded,
            profile.stock.len() - seeded
        );

        let mut keyring = MerchantKeyring::new();
        match &config.merchant_public_key {
            Some(key) => keyring.insert_hex(profile.merchant_id.clone(), key)?,
            None => warn!(
                "No UCP_MERCHANT_PUBLIC_KEY set; redemptions for {} that carry a proof will be rejected",
                profile.merchant_id
            ),
        }
        let broker = Arc::new(
            TokenBroker::new(ledger.clone(), clock.clone())
                .with_keyring(keyring)
                .with_retry(retry),
        );

        let transport = Arc::new(HttpTransport::new(config.engine.webhook.timeout)?);
        let webhooks = Arc::new(
            WebhookDispatcher::new(
                ledger.clone(),
                clock.clone(),
                transport,
                config.engine.webhook.clone(),
            )
            .with_retry(retry),
        );
        let subscriptions = load_subscriptions(&config.webhooks_path)?;
        for subscription in subscriptions {
            let endpoint_id = subscription.endpoint_id.clone();
            webhooks
                .subscribe(subscription)
                .await
                .with_context(|| format!("failed to subscribe endpoint {endpoint_id}"))?;
        }

        let exchange: SharedExchange = broker.clone();
        let checkout = Arc::new(CheckoutService::new(
            ledger.clone(),
            clock.clone(),
            profile.merchant_id.clone(),
            profiles,
            inventory.clone(),
            exchange,
            webhooks.clone(),
            config.engine.clone(),
        ));
        let orders = Arc::new(
            OrderService::new(ledger.clone(), clock.clone(), webhooks.clone()).with_retry(retry),
        );

        let sweeper = Arc::new(
            Sweeper::new(checkout.clone(), inventory.clone())
                .with_locks(broker.locks().clone())
                .with_locks(orders.locks().clone()),
        );

        Ok(Self {
            merchant_id: profile.merchant_id.clone(),
            config,
            ledger,
            checkout,
            orders,
            inventory,
            broker,
            webhooks,
            sweeper,
            clock,
        })
    }
}

/// Open the ledger file, creating its directory on first start
pub fn open_ledger(path: &Path) -> anyhow::Result<RedbLedger> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    RedbLedger::open(path).with_context(|| format!("failed to open ledger {}", path.display()))
}

/// Read webhook subscriptions. A missing file means no subscribers.
pub fn load_subscriptions(path: &Path) -> anyhow::Result<Vec<WebhookSubscription>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("No webhook config at {}, no endpoints subscribed", path.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };

    let file: WebhookFile =
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))?;
    info!(
        "Loaded {} webhook subscription(s) from {}",
        file.subscriptions.len(),
        path.display()
    );
    Ok(file.subscriptions)
}
