//! # Payment Exchange Trait
//!
//! The seam between the checkout state machine and whatever redeems payment
//! tokens. The engine ships a ledger-backed broker; a deployment can put a
//! real Credential Provider / PSP integration behind the same trait.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  PaymentExchange (trait)                    │
//! │  ├── redeem()                                               │
//! │  ├── void()                                                 │
//! │  └── exchange_name()                                        │
//! └─────────────────────────────────────────────────────────────┘
//!                            ▲
//!          ┌─────────────────┴─────────────────┐
//!  ┌───────┴───────┐                   ┌───────┴───────┐
//!  │  TokenBroker  │                   │ CP/PSP bridge │
//!  │   (ledger)    │                   │  (external)   │
//!  └───────────────┘                   └───────────────┘
//! ```

use crate::error::CheckoutResult;
use crate::token::{PaymentReceipt, RedeemRequest};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait PaymentExchange: Send + Sync {
    /// Redeem a token for one transaction.
    ///
    /// Token rejections come back as `CheckoutError::Token`. Redeeming an
    /// already-consumed token again with the same transaction id, merchant,
    /// PSP and amount returns the original receipt.
    async fn redeem(&self, request: &RedeemRequest) -> CheckoutResult<PaymentReceipt>;

    /// Compensate a redemption whose order could not be completed.
    /// Voiding an already-voided receipt is a no-op.
    async fn void(&self, receipt_id: &str) -> CheckoutResult<PaymentReceipt>;

    /// Name used in logs
    fn exchange_name(&self) -> &'static str;
}

/// Type alias for a shared exchange (dynamic dispatch)
pub type SharedExchange = Arc<dyn PaymentExchange>;
