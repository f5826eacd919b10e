//! # Business Profile Cache
//!
//! Read-through, TTL-bounded cache in front of a [`ProfileSource`]. Time is
//! read from the injected clock, so expiry is deterministic under test.
//!
//! The cached profile prices sessions and applies tax, shipping and discount
//! policy. It is never the authority for stock, token validity or the amount
//! a payment may be taken for.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use ucp_core::{BusinessProfile, CheckoutError, CheckoutResult, ProfileSource, SharedClock};

/// Loads `BusinessProfile` from a TOML file
#[derive(Debug, Clone)]
pub struct TomlProfileSource {
    path: PathBuf,
}

impl TomlProfileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ProfileSource for TomlProfileSource {
    async fn load_profile(&self) -> Result<BusinessProfile, CheckoutError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            CheckoutError::Configuration(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        let profile = BusinessProfile::from_toml(&content).map_err(|e| {
            CheckoutError::Configuration(format!("invalid profile {}: {}", self.path.display(), e))
        })?;
        if profile.merchant_id.trim().is_empty() {
            return Err(CheckoutError::Configuration(format!(
                "{} has no merchant_id",
                self.path.display()
            )));
        }
        info!(
            "Loaded business profile '{}' ({} catalog items) from {}",
            profile.merchant_id,
            profile.catalog.len(),
            self.path.display()
        );
        Ok(profile)
    }
}

struct Cached {
    profile: Arc<BusinessProfile>,
    loaded_at: DateTime<Utc>,
}

pub struct ProfileCache {
    source: Arc<dyn ProfileSource>,
    clock: SharedClock,
    ttl: Duration,
    cached: RwLock<Option<Cached>>,
}

impl ProfileCache {
    pub fn new(source: Arc<dyn ProfileSource>, clock: SharedClock, ttl: Duration) -> Self {
        Self {
            source,
            clock,
            ttl,
            cached: RwLock::new(None),
        }
    }

    /// Current profile, reloading from the source once the TTL has lapsed.
    ///
    /// If a reload fails and an older profile is held, the older profile is
    /// served and the reload is retried on the next call.
    pub async fn get(&self) -> CheckoutResult<Arc<BusinessProfile>> {
        let now = self.clock.now();
        if let Some(cached) = self.cached.read().await.as_ref() {
            if now < cached.loaded_at + self.ttl {
                return Ok(cached.profile.clone());
            }
        }

        let mut slot = self.cached.write().await;
        // Another caller may have refreshed while we waited
        if let Some(cached) = slot.as_ref() {
            if now < cached.loaded_at + self.ttl {
                return Ok(cached.profile.clone());
            }
        }

        match self.source.load_profile().await {
            Ok(profile) => {
                debug!("Business profile refreshed");
                let profile = Arc::new(profile);
                *slot = Some(Cached {
                    profile: profile.clone(),
                    loaded_at: now,
                });
                Ok(profile)
            }
            Err(e) => match slot.as_ref() {
                Some(stale) => {
                    warn!("Profile reload failed, serving cached profile: {}", e);
                    Ok(stale.profile.clone())
                }
                None => Err(e),
            },
        }
    }

    /// Drop the cached profile; the next `get` reloads
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::profile;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use ucp_core::FixedClock;

    struct CountingSource {
        loads: AtomicU32,
        failing: AtomicBool,
    }

    #[async_trait]
    impl ProfileSource for CountingSource {
        async fn load_profile(&self) -> Result<BusinessProfile, CheckoutError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(CheckoutError::Configuration("source down".into()));
            }
            let n = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(profile().with_tax_rate_bps(n))
        }
    }

    fn cache() -> (ProfileCache, Arc<CountingSource>, FixedClock) {
        let source = Arc::new(CountingSource {
            loads: AtomicU32::new(0),
            failing: AtomicBool::new(false),
        });
        let clock = FixedClock::new(Utc::now());
        let cache = ProfileCache::new(source.clone(), Arc::new(clock.clone()), Duration::seconds(300));
        (cache, source, clock)
    }

    #[tokio::test]
    async fn test_cache_hits_within_ttl() {
        let (cache, source, clock) = cache();
        assert_eq!(cache.get().await.unwrap().tax_rate_bps, 1);
        clock.advance(Duration::seconds(299));
        assert_eq!(cache.get().await.unwrap().tax_rate_bps, 1);
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_reloads_after_ttl() {
        let (cache, source, clock) = cache();
        cache.get().await.unwrap();
        clock.advance(Duration::seconds(300));
        assert_eq!(cache.get().await.unwrap().tax_rate_bps, 2);
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_profile_served_when_source_fails() {
        let (cache, source, clock) = cache();
        cache.get().await.unwrap();
        source.failing.store(true, Ordering::SeqCst);
        clock.advance(Duration::seconds(600));
        assert_eq!(cache.get().await.unwrap().tax_rate_bps, 1);

        cache.invalidate().await;
        assert!(cache.get().await.is_err());
    }

    #[tokio::test]
    async fn test_toml_source_reports_missing_file() {
        let source = TomlProfileSource::new("/nonexistent/business.toml");
        let err = source.load_profile().await.unwrap_err();
        assert!(matches!(err, CheckoutError::Configuration(_)));
    }
}
