//! # ucp-core
//!
//! Core types and traits for the UCP checkout engine.
//!
//! This crate provides:
//! - `Money` and `Currency` for fixed-point amounts
//! - `CheckoutSession`, `LineItem` and `Totals` for the checkout flow
//! - `Order` with append-only fulfillment and adjustments
//! - `PaymentToken`, `PaymentReceipt` and the token audit log
//! - `Reservation` and `StockLevel` for inventory
//! - `WebhookEvent` and friends for lifecycle delivery
//! - `BusinessProfile` for catalog and pricing policy
//! - `LedgerStore`, `PaymentExchange`, `ProfileSource` and `Clock` traits
//! - `CheckoutError` for typed error handling
//!
//! ## Example
//!
//! ```rust,ignore
//! use ucp_core::{Currency, LineItem, Money};
//!
//! let items = vec![LineItem::new("A", 2, Money::new(1000, Currency::USD))];
//! let session = checkout.create(CreateSessionRequest::new(items)).await?;
//! let session = checkout.mark_ready_for_complete(&session.id).await?;
//! let result = checkout
//!     .complete(CompleteRequest::new(&session.id, credential, "idem-1"))
//!     .await?;
//! ```

pub mod catalog;
pub mod clock;
pub mod error;
pub mod exchange;
pub mod inventory;
pub mod money;
pub mod order;
pub mod session;
pub mod store;
pub mod token;
pub mod webhook;

// Re-exports for convenience
pub use catalog::{
    BusinessProfile, CatalogItem, DiscountKind, DiscountRule, ProfileSource, ShippingPolicy,
    StaticProfileSource, StockSeed,
};
pub use clock::{Clock, FixedClock, SharedClock, SystemClock};
pub use error::{
    CheckoutError, CheckoutResult, ErrorBody, ErrorCategory, NextAction, StoreError, StoreResult,
    TokenError,
};
pub use exchange::{PaymentExchange, SharedExchange};
pub use inventory::{Reservation, ReservationStatus, StockLevel};
pub use money::{Currency, Money};
pub use order::{
    Adjustment, AdjustmentKind, Fulfillment, FulfillmentEvent, FulfillmentEventKind,
    FulfillmentExpectation, FulfillmentMethod, Order, OrderStatus,
};
pub use session::{
    validate_items, Address, Buyer, CancelReason, CheckoutSession, LineItem, PaymentRef,
    PendingCompletion, SessionStatus, Totals,
};
pub use store::{IdempotencyRecord, LedgerStore, SharedLedger};
pub use token::{
    proof_message, AuditOutcome, PaymentCredential, PaymentReceipt, PaymentToken, RedeemRequest,
    TokenAuditEntry,
};
pub use webhook::{
    AttemptOutcome, DeadLetter, DeadLetterReason, DeliveryAttempt, DeliveryStatus, EventTopic,
    WebhookEvent, WebhookSubscription,
};
