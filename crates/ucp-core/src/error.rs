//! # Checkout Error Types
//!
//! Typed error handling for the UCP checkout engine.
//! All engine operations return `Result<T, CheckoutError>`.
//!
//! Errors fall into five categories:
//!
//! | Category | Examples | Platform behaviour |
//! |----------|----------|--------------------|
//! | Validation | empty items, bad quantity | fix the request, then retry |
//! | Business | `InsufficientStock`, `PriceChanged`, token rejections | branch on `next_action` |
//! | Transient | ledger unavailable | retry later |
//! | Invariant | token consumed twice, oversell | fatal, investigate |
//! | Partial failure | payment taken, order not yet persisted | poll, reconciliation resolves it |

use crate::money::Money;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by a [`LedgerStore`](crate::store::LedgerStore) implementation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or timed out
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    /// A write conflicted with existing state
    #[error("Ledger conflict: {0}")]
    Conflict(String),

    /// A record could not be encoded or decoded
    #[error("Ledger serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Returns true if retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Token rejection reasons, in the order the broker checks them
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TokenError {
    #[error("Payment token not found: {token_id}")]
    TokenNotFound { token_id: String },

    #[error("Payment token expired: {token_id}")]
    TokenExpired { token_id: String },

    #[error("Payment token already consumed: {token_id}")]
    TokenAlreadyConsumed { token_id: String },

    #[error("Payment token is not authorized for PSP {psp_id}")]
    PspMismatch { psp_id: String },

    #[error("Payment token is not bound to merchant {merchant_id}")]
    MerchantMismatch { merchant_id: String },

    #[error("Currency mismatch: token is {expected}, request is {actual}")]
    CurrencyMismatch { expected: String, actual: String },

    #[error("Amount {requested} exceeds token limit {max}")]
    AmountExceedsLimit { max: Money, requested: Money },

    #[error("No public key registered for merchant {merchant_id}")]
    UnknownMerchantKey { merchant_id: String },

    #[error("Authorization proof failed verification")]
    InvalidProof,
}

impl TokenError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            TokenError::TokenNotFound { .. } => "token_not_found",
            TokenError::TokenExpired { .. } => "token_expired",
            TokenError::TokenAlreadyConsumed { .. } => "token_already_consumed",
            TokenError::PspMismatch { .. } => "token_psp_mismatch",
            TokenError::MerchantMismatch { .. } => "token_merchant_mismatch",
            TokenError::CurrencyMismatch { .. } => "token_currency_mismatch",
            TokenError::AmountExceedsLimit { .. } => "token_amount_exceeds_limit",
            TokenError::UnknownMerchantKey { .. } => "token_unknown_merchant_key",
            TokenError::InvalidProof => "token_invalid_proof",
        }
    }

    /// What the platform should do to recover
    pub fn next_action(&self) -> NextAction {
        match self {
            TokenError::TokenExpired { .. }
            | TokenError::TokenAlreadyConsumed { .. }
            | TokenError::AmountExceedsLimit { .. }
            | TokenError::InvalidProof => NextAction::Reauthorize,
            TokenError::TokenNotFound { .. }
            | TokenError::PspMismatch { .. }
            | TokenError::MerchantMismatch { .. }
            | TokenError::CurrencyMismatch { .. }
            | TokenError::UnknownMerchantKey { .. } => NextAction::ChooseDifferentPayment,
        }
    }
}

/// Error category (see module docs)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Business,
    Transient,
    Invariant,
    PartialFailure,
}

/// Recovery hint returned to the platform alongside an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    /// Correct the request and send it again
    FixRequest,
    /// Reduce quantities or remove unavailable items
    AdjustQuantities,
    /// Review the refreshed session and confirm it again
    Reconfirm,
    /// Obtain a fresh token from the credential provider
    Reauthorize,
    /// Use another payment instrument
    ChooseDifferentPayment,
    /// Retry the same request after a delay
    RetryLater,
    /// Poll the session; completion is being resolved
    PollStatus,
}

/// Core error type for all checkout operations
#[derive(Debug, Error)]
pub enum CheckoutError {
    /// Invalid request data
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Configuration errors (missing or malformed settings)
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Checkout session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Order not found: {order_id}")]
    OrderNotFound { order_id: String },

    /// Transition not allowed from the session's current state
    #[error("Cannot {operation} session {session_id} in state {status}")]
    InvalidState {
        session_id: String,
        status: String,
        operation: &'static str,
    },

    #[error("Insufficient stock for {sku}: requested {requested}, available {available}")]
    InsufficientStock {
        sku: String,
        requested: u32,
        available: u32,
    },

    #[error("Unknown SKU: {sku}")]
    UnknownSku { sku: String },

    #[error("Reservation not found: {reservation_id}")]
    ReservationNotFound { reservation_id: String },

    #[error("Reservation {reservation_id} is {status}")]
    ReservationNotActive {
        reservation_id: String,
        status: String,
    },

    /// Price lock expired and the catalog price moved
    #[error("Prices changed for session {session_id}; reconfirm before completing")]
    PriceChanged { session_id: String },

    /// Price lock expired
    #[error("Price lock expired for session {session_id}; reconfirm before completing")]
    SessionExpired { session_id: String },

    /// The payment token was rejected by the broker
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Idempotency key already bound to a different session
    #[error("Idempotency key {key} is already bound to another session")]
    IdempotencyConflict { key: String },

    /// Payment was taken but completion did not finish; reconciliation will resolve it
    #[error("Completion of session {session_id} is pending reconciliation")]
    CompletionPending { session_id: String },

    /// Ledger failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An atomicity guarantee was violated. Never silently corrected.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl CheckoutError {
    pub fn invalid_state(
        session_id: impl Into<String>,
        status: impl std::fmt::Display,
        operation: &'static str,
    ) -> Self {
        CheckoutError::InvalidState {
            session_id: session_id.into(),
            status: status.to_string(),
            operation,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            CheckoutError::Validation(_) => "invalid_request",
            CheckoutError::Configuration(_) => "configuration_error",
            CheckoutError::SessionNotFound { .. } => "session_not_found",
            CheckoutError::OrderNotFound { .. } => "order_not_found",
            CheckoutError::InvalidState { .. } => "invalid_state",
            CheckoutError::InsufficientStock { .. } => "insufficient_stock",
            CheckoutError::UnknownSku { .. } => "unknown_sku",
            CheckoutError::ReservationNotFound { .. } => "reservation_not_found",
            CheckoutError::ReservationNotActive { .. } => "reservation_not_active",
            CheckoutError::PriceChanged { .. } => "price_changed",
            CheckoutError::SessionExpired { .. } => "session_expired",
            CheckoutError::Token(e) => e.code(),
            CheckoutError::IdempotencyConflict { .. } => "idempotency_conflict",
            CheckoutError::CompletionPending { .. } => "completion_pending",
            CheckoutError::Store(StoreError::Unavailable(_)) => "store_unavailable",
            CheckoutError::Store(_) => "store_error",
            CheckoutError::InvariantViolation(_) => "invariant_violation",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            CheckoutError::Validation(_)
            | CheckoutError::UnknownSku { .. }
            | CheckoutError::IdempotencyConflict { .. } => ErrorCategory::Validation,
            CheckoutError::SessionNotFound { .. }
            | CheckoutError::OrderNotFound { .. }
            | CheckoutError::InvalidState { .. }
            | CheckoutError::InsufficientStock { .. }
            | CheckoutError::ReservationNotFound { .. }
            | CheckoutError::ReservationNotActive { .. }
            | CheckoutError::PriceChanged { .. }
            | CheckoutError::SessionExpired { .. }
            | CheckoutError::Token(_) => ErrorCategory::Business,
            CheckoutError::Store(e) if e.is_transient() => ErrorCategory::Transient,
            CheckoutError::CompletionPending { .. } => ErrorCategory::PartialFailure,
            CheckoutError::Configuration(_)
            | CheckoutError::Store(_)
            | CheckoutError::InvariantViolation(_) => ErrorCategory::Invariant,
        }
    }

    /// Recovery hint for the platform, if one applies
    pub fn next_action(&self) -> Option<NextAction> {
        match self {
            CheckoutError::Validation(_)
            | CheckoutError::UnknownSku { .. }
            | CheckoutError::IdempotencyConflict { .. } => Some(NextAction::FixRequest),
            CheckoutError::InsufficientStock { .. } => Some(NextAction::AdjustQuantities),
            CheckoutError::PriceChanged { .. } | CheckoutError::SessionExpired { .. } => {
                Some(NextAction::Reconfirm)
            }
            CheckoutError::Token(e) => Some(e.next_action()),
            CheckoutError::Store(e) if e.is_transient() => Some(NextAction::RetryLater),
            CheckoutError::CompletionPending { .. } => Some(NextAction::PollStatus),
            _ => None,
        }
    }

    /// Returns true if this error is retryable without changing the request
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transient | ErrorCategory::PartialFailure
        )
    }

    /// Returns the HTTP status code a transport adapter should use
    pub fn status_code(&self) -> u16 {
        match self {
            CheckoutError::Validation(_) => 400,
            CheckoutError::UnknownSku { .. } => 400,
            CheckoutError::Configuration(_) => 500,
            CheckoutError::SessionNotFound { .. } => 404,
            CheckoutError::OrderNotFound { .. } => 404,
            CheckoutError::ReservationNotFound { .. } => 404,
            CheckoutError::InvalidState { .. } => 409,
            CheckoutError::ReservationNotActive { .. } => 409,
            CheckoutError::IdempotencyConflict { .. } => 409,
            CheckoutError::InsufficientStock { .. } => 409,
            CheckoutError::PriceChanged { .. } => 409,
            CheckoutError::SessionExpired { .. } => 410,
            CheckoutError::Token(_) => 402,
            CheckoutError::CompletionPending { .. } => 202,
            CheckoutError::Store(e) if e.is_transient() => 503,
            CheckoutError::Store(_) => 500,
            CheckoutError::InvariantViolation(_) => 500,
        }
    }

    /// Serializable error body for the platform
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
            retryable: self.is_retryable(),
            next_action: self.next_action(),
        }
    }
}

/// Error response carried back to the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_action: Option<NextAction>,
}

/// Result type alias for checkout operations
pub type CheckoutResult<T> = Result<T, CheckoutError>;

/// Result type alias for ledger operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Currency;

    #[test]
    fn test_retryable_errors() {
        assert!(CheckoutError::Store(StoreError::Unavailable("timeout".into())).is_retryable());
        assert!(CheckoutError::CompletionPending {
            session_id: "cs_1".into()
        }
        .is_retryable());
        assert!(!CheckoutError::Validation("bad data".into()).is_retryable());
        assert!(!CheckoutError::Token(TokenError::InvalidProof).is_retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(CheckoutError::Validation("test".into()).status_code(), 400);
        assert_eq!(
            CheckoutError::InsufficientStock {
                sku: "A".into(),
                requested: 3,
                available: 2
            }
            .status_code(),
            409
        );
        assert_eq!(
            CheckoutError::Token(TokenError::TokenExpired {
                token_id: "tok".into()
            })
            .status_code(),
            402
        );
    }

    #[test]
    fn test_token_error_codes_are_distinct() {
        let errors = [
            TokenError::TokenNotFound { token_id: "t".into() },
            TokenError::TokenExpired { token_id: "t".into() },
            TokenError::TokenAlreadyConsumed { token_id: "t".into() },
            TokenError::PspMismatch { psp_id: "p".into() },
            TokenError::MerchantMismatch { merchant_id: "m".into() },
            TokenError::CurrencyMismatch {
                expected: "USD".into(),
                actual: "EUR".into(),
            },
            TokenError::AmountExceedsLimit {
                max: Money::new(50, Currency::USD),
                requested: Money::new(60, Currency::USD),
            },
            TokenError::UnknownMerchantKey { merchant_id: "m".into() },
            TokenError::InvalidProof,
        ];
        let mut codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_error_body_carries_next_action() {
        let body = CheckoutError::SessionExpired {
            session_id: "cs_1".into(),
        }
        .to_body();
        assert_eq!(body.code, "session_expired");
        assert_eq!(body.next_action, Some(NextAction::Reconfirm));
        assert!(!body.retryable);

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["next_action"], "reconfirm");
    }

    #[test]
    fn test_invariant_violation_has_no_recovery_hint() {
        let err = CheckoutError::InvariantViolation("token consumed twice".into());
        assert_eq!(err.category(), ErrorCategory::Invariant);
        assert!(err.next_action().is_none());
    }
}
