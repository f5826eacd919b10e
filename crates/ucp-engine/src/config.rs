//! # Engine Configuration
//!
//! Timeouts, TTLs and delivery tuning. Loaded from environment variables
//! (a `.env` file is honoured) with defaults for everything.

use crate::retry::RetryPolicy;
use crate::webhook::DeliveryConfig;
use chrono::Duration;
use std::env;
use ucp_core::{CheckoutError, CheckoutResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Expected merchant id. When set, the business profile must match it.
    pub merchant_id: Option<String>,

    /// How long quoted prices hold without activity
    pub price_lock_ttl: Duration,

    /// How long a reservation holds stock
    pub reservation_ttl: Duration,

    /// Age after which a `completing` session is handed to reconciliation
    pub completing_stale_after: Duration,

    pub profile_cache_ttl: Duration,

    /// Retries for transient ledger errors
    pub store_retry: RetryPolicy,

    pub webhook: DeliveryConfig,
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `UCP_MERCHANT_ID` | unset |
    /// | `UCP_PRICE_LOCK_SECS` | 900 |
    /// | `UCP_RESERVATION_SECS` | 900 |
    /// | `UCP_COMPLETING_STALE_SECS` | 60 |
    /// | `UCP_PROFILE_CACHE_SECS` | 300 |
    /// | `UCP_WEBHOOK_MAX_ATTEMPTS` | 5 |
    /// | `UCP_WEBHOOK_BASE_BACKOFF_MS` | 1000 |
    /// | `UCP_WEBHOOK_MAX_BACKOFF_MS` | 60000 |
    /// | `UCP_WEBHOOK_TIMEOUT_SECS` | 10 |
    pub fn from_env() -> CheckoutResult<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let merchant_id = env::var("UCP_MERCHANT_ID")
            .ok()
            .filter(|m| !m.trim().is_empty());

        let max_attempts = read_u64("UCP_WEBHOOK_MAX_ATTEMPTS", 5)?;
        if max_attempts == 0 || max_attempts > u64::from(u32::MAX) {
            return Err(CheckoutError::Configuration(
                "UCP_WEBHOOK_MAX_ATTEMPTS must be between 1 and u32::MAX".to_string(),
            ));
        }
        let base_backoff = read_u64("UCP_WEBHOOK_BASE_BACKOFF_MS", 1000)?;
        let max_backoff = read_u64("UCP_WEBHOOK_MAX_BACKOFF_MS", 60_000)?;
        if base_backoff > max_backoff {
            return Err(CheckoutError::Configuration(
                "UCP_WEBHOOK_BASE_BACKOFF_MS must not exceed UCP_WEBHOOK_MAX_BACKOFF_MS".to_string(),
            ));
        }

        let webhook = DeliveryConfig {
            max_attempts: max_attempts as u32,
            base_backoff: std::time::Duration::from_millis(base_backoff),
            max_backoff: std::time::Duration::from_millis(max_backoff),
            timeout: std::time::Duration::from_secs(read_u64("UCP_WEBHOOK_TIMEOUT_SECS", 10)?),
            ..DeliveryConfig::default()
        };

        Ok(Self {
            merchant_id,
            price_lock_ttl: read_secs("UCP_PRICE_LOCK_SECS", 900)?,
            reservation_ttl: read_secs("UCP_RESERVATION_SECS", 900)?,
            completing_stale_after: read_secs("UCP_COMPLETING_STALE_SECS", 60)?,
            profile_cache_ttl: read_secs("UCP_PROFILE_CACHE_SECS", 300)?,
            store_retry: RetryPolicy::default(),
            webhook,
        })
    }

    /// Builder: expect a specific merchant id
    pub fn with_merchant_id(mut self, merchant_id: impl Into<String>) -> Self {
        self.merchant_id = Some(merchant_id.into());
        self
    }

    /// Builder: set the price lock window
    pub fn with_price_lock_ttl(mut self, ttl: Duration) -> Self {
        self.price_lock_ttl = ttl;
        self
    }

    /// Builder: set the reservation window
    pub fn with_reservation_ttl(mut self, ttl: Duration) -> Self {
        self.reservation_ttl = ttl;
        self
    }

    /// Builder: set the reconciliation threshold
    pub fn with_completing_stale_after(mut self, after: Duration) -> Self {
        self.completing_stale_after = after;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            merchant_id: None,
            price_lock_ttl: Duration::seconds(900),
            reservation_ttl: Duration::seconds(900),
            completing_stale_after: Duration::seconds(60),
            profile_cache_ttl: Duration::seconds(300),
            store_retry: RetryPolicy::default(),
            webhook: DeliveryConfig::default(),
        }
    }
}

fn read_u64(name: &str, default: u64) -> CheckoutResult<u64> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            CheckoutError::Configuration(format!("{name} must be a non-negative integer, got {raw:?}"))
        }),
        Err(_) => Ok(default),
    }
}

fn read_secs(name: &str, default: u64) -> CheckoutResult<Duration> {
    let secs = read_u64(name, default)?;
    if secs == 0 {
        return Err(CheckoutError::Configuration(format!("{name} must be positive")));
    }
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| CheckoutError::Configuration(format!("{name} is out of range")))
}
