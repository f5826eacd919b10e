//! # Business Profile
//!
//! The business's read-mostly configuration: catalog, pricing policy
//! (tax, shipping, discounts), buyer policy and initial stock.
//! Profiles are loaded from `config/business.toml`.
//!
//! The profile is cached with a TTL by the engine and is never consulted for
//! authoritative decisions: stock lives in the ledger, token validity in the
//! broker, payment amounts in the session totals.

use crate::error::CheckoutError;
use crate::money::Money;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub sku: String,
    pub name: String,
    /// Current list price
    pub unit_price: Money,
    /// Whether this item is available for purchase
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// Shipping charges for an order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingPolicy {
    /// Flat shipping charge per order, in minor units of the order currency
    #[serde(default)]
    pub flat: i64,
    /// Subtotal (minor units) at or above which shipping is free
    #[serde(default)]
    pub free_over: Option<i64>,
}

impl ShippingPolicy {
    /// Shipping for a given discounted subtotal
    pub fn charge_for(&self, subtotal: Money) -> Money {
        match self.free_over {
            Some(threshold) if subtotal.amount >= threshold => Money::zero(subtotal.currency),
            _ => Money::new(self.flat, subtotal.currency),
        }
    }
}

/// How a discount code reduces the subtotal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscountKind {
    /// Percentage of the subtotal in basis points (1000 = 10%)
    Percent { bps: u32 },
    /// Fixed amount in minor units of the order currency
    Fixed { amount: i64 },
}

/// A discount code the business honours
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountRule {
    pub code: String,
    #[serde(flatten)]
    pub kind: DiscountKind,
}

/// Initial on-hand quantity for a SKU
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockSeed {
    pub sku: String,
    pub on_hand: u32,
}

/// Everything the engine needs to know about the business
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessProfile {
    /// Merchant id tokens must be bound to
    pub merchant_id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Sales tax in basis points, applied to the discounted subtotal
    #[serde(default)]
    pub tax_rate_bps: u32,

    #[serde(default)]
    pub shipping: ShippingPolicy,

    #[serde(default)]
    pub discounts: Vec<DiscountRule>,

    /// Whether a buyer email is required before a session can be readied
    #[serde(default)]
    pub require_buyer_email: bool,

    #[serde(default)]
    pub catalog: Vec<CatalogItem>,

    #[serde(default)]
    pub stock: Vec<StockSeed>,
}

impl BusinessProfile {
    /// Create an empty profile for a merchant (no tax, free shipping)
    pub fn new(merchant_id: impl Into<String>) -> Self {
        Self {
            merchant_id: merchant_id.into(),
            ..Default::default()
        }
    }

    /// Builder: set tax rate
    pub fn with_tax_rate_bps(mut self, bps: u32) -> Self {
        self.tax_rate_bps = bps;
        self
    }

    /// Builder: set shipping policy
    pub fn with_shipping(mut self, flat: i64, free_over: Option<i64>) -> Self {
        self.shipping = ShippingPolicy { flat, free_over };
        self
    }

    /// Builder: add a discount rule
    pub fn with_discount(mut self, code: impl Into<String>, kind: DiscountKind) -> Self {
        self.discounts.push(DiscountRule {
            code: code.into(),
            kind,
        });
        self
    }

    /// Builder: add a catalog item
    pub fn with_item(mut self, item: CatalogItem) -> Self {
        self.catalog.push(item);
        self
    }

    /// Builder: require a buyer email before readying a session
    pub fn requiring_buyer_email(mut self) -> Self {
        self.require_buyer_email = true;
        self
    }

    /// Find a catalog item by SKU
    pub fn item(&self, sku: &str) -> Option<&CatalogItem> {
        self.catalog.iter().find(|i| i.sku == sku)
    }

    /// Find a discount rule by code (case-insensitive)
    pub fn discount(&self, code: &str) -> Option<&DiscountRule> {
        self.discounts
            .iter()
            .find(|d| d.code.eq_ignore_ascii_case(code))
    }

    /// Load a profile from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }
}

/// Where the engine reads the business profile from
#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn load_profile(&self) -> Result<BusinessProfile, CheckoutError>;
}

/// A profile held in memory
#[derive(Debug, Clone)]
pub struct StaticProfileSource {
    profile: BusinessProfile,
}

impl StaticProfileSource {
    pub fn new(profile: BusinessProfile) -> Self {
        Self { profile }
    }
}

#[async_trait]
impl ProfileSource for StaticProfileSource {
    async fn load_profile(&self) -> Result<BusinessProfile, CheckoutError> {
        Ok(self.profile.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Currency;

    const PROFILE: &str = r#"
merchant_id = "merchant_acme"
name = "Acme Outfitters"
tax_rate_bps = 825
require_buyer_email = true

[shipping]
flat = 599
free_over = 10000

[[discounts]]
code = "WELCOME10"
type = "percent"
bps = 1000

[[discounts]]
code = "FIVEOFF"
type = "fixed"
amount = 500

[[catalog]]
sku = "A"
name = "Trail Socks"
unit_price = { amount = 1000, currency = "USD" }

[[catalog]]
sku = "B"
name = "Discontinued Hat"
unit_price = { amount = 2500, currency = "USD" }
active = false

[[stock]]
sku = "A"
on_hand = 5
"#;

    #[test]
    fn test_profile_from_toml() {
        let profile = BusinessProfile::from_toml(PROFILE).unwrap();
        assert_eq!(profile.merchant_id, "merchant_acme");
        assert_eq!(profile.tax_rate_bps, 825);
        assert!(profile.require_buyer_email);
        assert_eq!(profile.shipping.free_over, Some(10000));
        assert_eq!(profile.catalog.len(), 2);
        assert!(!profile.item("B").unwrap().active);
        assert_eq!(profile.item("A").unwrap().unit_price, Money::new(1000, Currency::USD));
        assert_eq!(profile.stock[0].on_hand, 5);
        assert_eq!(
            profile.discount("welcome10").unwrap().kind,
            DiscountKind::Percent { bps: 1000 }
        );
        assert_eq!(
            profile.discount("FIVEOFF").unwrap().kind,
            DiscountKind::Fixed { amount: 500 }
        );
    }

    #[test]
    fn test_shipping_threshold() {
        let policy = ShippingPolicy {
            flat: 599,
            free_over: Some(10000),
        };
        assert_eq!(policy.charge_for(Money::new(9999, Currency::USD)).amount, 599);
        assert_eq!(policy.charge_for(Money::new(10000, Currency::USD)).amount, 0);
    }

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticProfileSource::new(BusinessProfile::new("m1").with_tax_rate_bps(500));
        let profile = source.load_profile().await.unwrap();
        assert_eq!(profile.merchant_id, "m1");
        assert_eq!(profile.tax_rate_bps, 500);
    }
}
