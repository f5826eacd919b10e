//! # Checkout Session Types
//!
//! The checkout session is the unit of work tracking a prospective purchase
//! from creation to completion or cancellation.
//!
//! ```text
//!   created ──mark_ready──▶ ready_for_complete ──complete──▶ completing ──▶ completed
//!      │  ▲                        │    │                         │
//!      │  └──── price lock expired ┘    │                         └─ token rejected ─▶ ready_for_complete
//!      └────────── cancel / expiry ─────┴──▶ cancelled
//! ```

use crate::catalog::{BusinessProfile, DiscountKind};
use crate::error::{CheckoutError, CheckoutResult};
use crate::money::{Currency, Money};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A line item in a checkout session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub sku: String,

    /// Display name (denormalized)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub quantity: u32,

    pub unit_price: Money,
}

impl LineItem {
    pub fn new(sku: impl Into<String>, quantity: u32, unit_price: Money) -> Self {
        Self {
            sku: sku.into(),
            name: None,
            quantity,
            unit_price,
        }
    }

    /// Builder: set display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Calculate the total price for this line item
    pub fn total(&self) -> Option<Money> {
        self.unit_price.checked_mul(self.quantity)
    }
}

/// Buyer details
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buyer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl Buyer {
    pub fn with_email(email: impl Into<String>) -> Self {
        Self {
            email: Some(email.into()),
            ..Default::default()
        }
    }
}

/// Postal address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub line1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line2: Option<String>,
    pub city: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub postal_code: String,
    /// ISO 3166-1 alpha-2
    pub country: String,
}

/// Totals breakdown. `total = subtotal + tax + shipping - discount`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub subtotal: Money,
    pub tax: Money,
    pub shipping: Money,
    pub discount: Money,
    pub total: Money,
}

impl Totals {
    pub fn zero(currency: Currency) -> Self {
        let zero = Money::zero(currency);
        Self {
            subtotal: zero,
            tax: zero,
            shipping: zero,
            discount: zero,
            total: zero,
        }
    }

    /// Compute totals for a set of items under a business profile.
    ///
    /// Discounts are capped at the subtotal; tax applies to the discounted
    /// subtotal; the shipping threshold is checked against the discounted
    /// subtotal too. Unknown or repeated discount codes are rejected.
    pub fn compute(
        items: &[LineItem],
        currency: Currency,
        profile: &BusinessProfile,
        discount_codes: &[String],
    ) -> CheckoutResult<Self> {
        let overflow = || CheckoutError::Validation("amount overflow".to_string());

        let mut subtotal = Money::zero(currency);
        for item in items {
            if item.unit_price.currency != currency {
                return Err(CheckoutError::Validation(format!(
                    "item {} is priced in {}, session currency is {}",
                    item.sku, item.unit_price.currency, currency
                )));
            }
            let line = item.total().ok_or_else(overflow)?;
            subtotal = subtotal.checked_add(line).ok_or_else(overflow)?;
        }

        let mut discount = Money::zero(currency);
        let mut applied: Vec<&str> = Vec::with_capacity(discount_codes.len());
        for code in discount_codes {
            let rule = profile
                .discount(code)
                .ok_or_else(|| CheckoutError::Validation(format!("unknown discount code: {code}")))?;
            // Codes match case-insensitively, so "TEN" and "ten" are one code
            if applied.iter().any(|c| c.eq_ignore_ascii_case(&rule.code)) {
                return Err(CheckoutError::Validation(format!(
                    "discount code {code} given more than once"
                )));
            }
            applied.push(&rule.code);
            let amount = match rule.kind {
                DiscountKind::Percent { bps } => subtotal.apply_bps(bps).ok_or_else(overflow)?,
                DiscountKind::Fixed { amount } => Money::new(amount, currency),
            };
            discount = discount.checked_add(amount).ok_or_else(overflow)?;
        }
        if discount.amount > subtotal.amount {
            discount = subtotal;
        }

        let taxable = subtotal.checked_sub(discount).ok_or_else(overflow)?;
        let tax = taxable.apply_bps(profile.tax_rate_bps).ok_or_else(overflow)?;
        let shipping = if items.is_empty() {
            Money::zero(currency)
        } else {
            profile.shipping.charge_for(taxable)
        };

        let total = subtotal
            .checked_add(tax)
            .and_then(|t| t.checked_add(shipping))
            .and_then(|t| t.checked_sub(discount))
            .ok_or_else(overflow)?;

        Ok(Self {
            subtotal,
            tax,
            shipping,
            discount,
            total,
        })
    }

    /// Whether the breakdown satisfies the totals identity
    pub fn is_consistent(&self) -> bool {
        self.subtotal.amount + self.tax.amount + self.shipping.amount - self.discount.amount
            == self.total.amount
    }
}

/// Status of a checkout session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    ReadyForComplete,
    Completing,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::ReadyForComplete => "ready_for_complete",
            SessionStatus::Completing => "completing",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }

    /// States in which items, buyer and address may still change
    pub fn is_mutable(&self) -> bool {
        matches!(self, SessionStatus::Created | SessionStatus::ReadyForComplete)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment reference recorded once a token has been redeemed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRef {
    pub token_id: String,
    pub psp_id: String,
    pub transaction_id: String,
    pub receipt_id: String,
}

/// Saga bookkeeping persisted when a session enters `completing`, so that an
/// interrupted completion can be resumed by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCompletion {
    pub transaction_id: String,
    pub idempotency_key: String,
    pub order_id: String,
    pub token_id: String,
    pub psp_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Why a session was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Cancelled by the platform
    Requested,
    /// Price lock lapsed without activity
    Expired,
    /// Payment was taken but the order could not be fulfilled; the receipt was voided
    PaymentVoided,
}

/// A checkout session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,

    pub status: SessionStatus,

    pub line_items: Vec<LineItem>,

    /// Fixed once items are priced
    pub currency: Currency,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buyer: Option<Buyer>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_address: Option<Address>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discount_codes: Vec<String>,

    pub totals: Totals,

    /// Active inventory reservations held for this session
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reservation_ids: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_completion: Option<PendingCompletion>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<CancelReason>,

    /// Idempotency key supplied at creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    pub price_lock_expires_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl CheckoutSession {
    /// Whether the price lock has lapsed at `now`
    pub fn price_lock_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.price_lock_expires_at
    }

    /// Total number of units across line items
    pub fn item_count(&self) -> u32 {
        self.line_items.iter().map(|i| i.quantity).sum()
    }
}

/// Validate a set of line items and return their common currency
pub fn validate_items(items: &[LineItem]) -> CheckoutResult<Currency> {
    let first = items
        .first()
        .ok_or_else(|| CheckoutError::Validation("session must contain at least one item".into()))?;
    let currency = first.unit_price.currency;

    for item in items {
        if item.sku.trim().is_empty() {
            return Err(CheckoutError::Validation("item sku must not be empty".into()));
        }
        if item.quantity == 0 {
            return Err(CheckoutError::Validation(format!(
                "quantity for {} must be positive",
                item.sku
            )));
        }
        if item.unit_price.amount < 0 {
            return Err(CheckoutError::Validation(format!(
                "unit price for {} must not be negative",
                item.sku
            )));
        }
        if item.unit_price.currency != currency {
            return Err(CheckoutError::Validation(
                "all items must share one currency".into(),
            ));
        }
    }
    Ok(currency)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DiscountKind;

    fn usd(amount: i64) -> Money {
        Money::new(amount, Currency::USD)
    }

    #[test]
    fn test_line_item_total() {
        let item = LineItem::new("A", 3, usd(1000));
        assert_eq!(item.total().unwrap().amount, 3000);
    }

    #[test]
    fn test_totals_plain() {
        let items = vec![LineItem::new("A", 2, usd(1000))];
        let totals = Totals::compute(&items, Currency::USD, &BusinessProfile::new("m"), &[]).unwrap();
        assert_eq!(totals.subtotal.amount, 2000);
        assert_eq!(totals.total.amount, 2000);
        assert!(totals.is_consistent());
    }

    #[test]
    fn test_totals_with_tax_shipping_and_discount() {
        let profile = BusinessProfile::new("m")
            .with_tax_rate_bps(1000)
            .with_shipping(500, Some(10_000))
            .with_discount("TEN", DiscountKind::Percent { bps: 1000 });
        let items = vec![
            LineItem::new("A", 2, usd(1000)),
            LineItem::new("B", 1, usd(500)),
        ];

        let totals = Totals::compute(&items, Currency::USD, &profile, &["ten".into()]).unwrap();
        assert_eq!(totals.subtotal.amount, 2500);
        assert_eq!(totals.discount.amount, 250);
        assert_eq!(totals.tax.amount, 225);
        assert_eq!(totals.shipping.amount, 500);
        assert_eq!(totals.total.amount, 2500 + 225 + 500 - 250);
        assert!(totals.is_consistent());
    }

    #[test]
    fn test_fixed_discount_capped_at_subtotal() {
        let profile = BusinessProfile::new("m").with_discount("BIG", DiscountKind::Fixed { amount: 5000 });
        let items = vec![LineItem::new("A", 1, usd(1000))];
        let totals = Totals::compute(&items, Currency::USD, &profile, &["BIG".into()]).unwrap();
        assert_eq!(totals.discount.amount, 1000);
        assert_eq!(totals.total.amount, 0);
    }

    #[test]
    fn test_repeated_discount_code_rejected() {
        let profile =
            BusinessProfile::new("m").with_discount("TEN", DiscountKind::Percent { bps: 1000 });
        let items = vec![LineItem::new("A", 1, usd(1000))];

        let once = Totals::compute(&items, Currency::USD, &profile, &["TEN".into()]).unwrap();
        assert_eq!(once.discount.amount, 100);
        assert_eq!(once.total.amount, 900);

        for codes in [vec!["TEN".into(), "ten".into()], vec!["TEN".into(), "TEN".into()]] {
            let err = Totals::compute(&items, Currency::USD, &profile, &codes).unwrap_err();
            assert!(matches!(err, CheckoutError::Validation(_)));
        }
    }

    #[test]
    fn test_unknown_discount_code_rejected() {
        let items = vec![LineItem::new("A", 1, usd(1000))];
        let err = Totals::compute(&items, Currency::USD, &BusinessProfile::new("m"), &["NOPE".into()])
            .unwrap_err();
        assert!(matches!(err, CheckoutError::Validation(_)));
    }

    #[test]
    fn test_validate_items() {
        assert!(validate_items(&[]).is_err());
        assert!(validate_items(&[LineItem::new("A", 0, usd(100))]).is_err());
        assert!(validate_items(&[LineItem::new("A", 1, usd(-1))]).is_err());
        assert!(validate_items(&[
            LineItem::new("A", 1, usd(100)),
            LineItem::new("B", 1, Money::new(100, Currency::EUR)),
        ])
        .is_err());
        assert_eq!(
            validate_items(&[LineItem::new("A", 1, usd(100))]).unwrap(),
            Currency::USD
        );
    }

    #[test]
    fn test_status_helpers() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(!SessionStatus::Completing.is_mutable());
        assert!(SessionStatus::ReadyForComplete.is_mutable());
        assert_eq!(SessionStatus::ReadyForComplete.to_string(), "ready_for_complete");
    }
}
