//! # Token Exchange Broker
//!
//! Redeems Credential Provider tokens for the business. Each redemption is
//! validated in a fixed order and the first failing check decides the
//! [`TokenError`]:
//!
//! 1. token exists, not expired
//! 2. not already consumed (unless this is a replay of the same transaction)
//! 3. PSP matches
//! 4. merchant matches
//! 5. currency matches, amount within `max_amount`
//! 6. proof of authorization verifies (when supplied)
//!
//! Consumption is a compare-and-set on the ledger that stores the receipt in
//! the same step, taken under a per-token lock. Every attempt lands in the
//! append-only audit log, including ones that fail on the store.

use crate::locks::KeyedLocks;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use ring::signature::{UnparsedPublicKey, ED25519};
use std::collections::HashMap;
use tracing::{debug, error, info, instrument, warn};
use ucp_core::{
    AuditOutcome, CheckoutError, CheckoutResult, PaymentExchange, PaymentReceipt, PaymentToken,
    RedeemRequest, SharedClock, SharedLedger, TokenAuditEntry, TokenError,
};
use uuid::Uuid;

/// Ed25519 public keys of the merchants whose proofs the broker accepts
#[derive(Debug, Clone, Default)]
pub struct MerchantKeyring {
    keys: HashMap<String, Vec<u8>>,
}

impl MerchantKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: register a raw 32-byte public key
    pub fn with_key(mut self, merchant_id: impl Into<String>, public_key: impl Into<Vec<u8>>) -> Self {
        self.keys.insert(merchant_id.into(), public_key.into());
        self
    }

    /// Register a hex-encoded public key
    pub fn insert_hex(&mut self, merchant_id: impl Into<String>, public_key_hex: &str) -> CheckoutResult<()> {
        let merchant_id = merchant_id.into();
        let key = hex::decode(public_key_hex.trim()).map_err(|e| {
            CheckoutError::Configuration(format!("invalid public key for {merchant_id}: {e}"))
        })?;
        if key.len() != 32 {
            return Err(CheckoutError::Configuration(format!(
                "public key for {merchant_id} must be 32 bytes, got {}",
                key.len()
            )));
        }
        self.keys.insert(merchant_id, key);
        Ok(())
    }

    pub fn contains(&self, merchant_id: &str) -> bool {
        self.keys.contains_key(merchant_id)
    }

    /// Verify a hex signature over `message` against the merchant's key
    pub fn verify(&self, merchant_id: &str, message: &[u8], signature_hex: &str) -> Result<(), TokenError> {
        let key = self
            .keys
            .get(merchant_id)
            .ok_or_else(|| TokenError::UnknownMerchantKey {
                merchant_id: merchant_id.to_string(),
            })?;
        let signature = hex::decode(signature_hex).map_err(|_| TokenError::InvalidProof)?;
        UnparsedPublicKey::new(&ED25519, key)
            .verify(message, &signature)
            .map_err(|_| TokenError::InvalidProof)
    }
}

/// Ledger-backed token broker
pub struct TokenBroker {
    ledger: SharedLedger,
    clock: SharedClock,
    keyring: MerchantKeyring,
    locks: KeyedLocks,
    retry: RetryPolicy,
}

impl TokenBroker {
    pub fn new(ledger: SharedLedger, clock: SharedClock) -> Self {
        Self {
            ledger,
            clock,
            keyring: MerchantKeyring::new(),
            locks: KeyedLocks::new("token"),
            retry: RetryPolicy::default(),
        }
    }

    /// Builder: set the merchant keyring used for proof verification
    pub fn with_keyring(mut self, keyring: MerchantKeyring) -> Self {
        self.keyring = keyring;
        self
    }

    /// Builder: override the ledger retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn locks(&self) -> &KeyedLocks {
        &self.locks
    }

    /// Import a token issued by a Credential Provider
    #[instrument(skip(self, token), fields(token_id = %token.id))]
    pub async fn register(&self, token: PaymentToken) -> CheckoutResult<()> {
        if !token.single_use {
            return Err(CheckoutError::Validation(
                "only single-use payment tokens are supported".into(),
            ));
        }
        if token.max_amount.amount < 0 {
            return Err(CheckoutError::Validation(
                "token max_amount must not be negative".into(),
            ));
        }

        let _guard = self.locks.lock(&token.id).await;
        if let Some(existing) = self
            .retry
            .run("get_token", || self.ledger.get_token(&token.id))
            .await?
        {
            if existing.is_consumed() {
                return Err(CheckoutError::Validation(format!(
                    "token {} is already consumed",
                    token.id
                )));
            }
        }

        self.retry
            .run("put_token", || self.ledger.put_token(&token))
            .await?;
        debug!("Registered payment token {}", token.id);
        Ok(())
    }

    pub async fn token(&self, token_id: &str) -> CheckoutResult<Option<PaymentToken>> {
        Ok(self
            .retry
            .run("get_token", || self.ledger.get_token(token_id))
            .await?)
    }

    /// Audit trail for a token, oldest first
    pub async fn audit(&self, token_id: &str) -> CheckoutResult<Vec<TokenAuditEntry>> {
        Ok(self
            .retry
            .run("token_audit", || self.ledger.token_audit(token_id))
            .await?)
    }

    /// Redeem a token for one transaction. Every call, successful or not,
    /// leaves exactly one audit entry.
    #[instrument(
        skip(self, request),
        fields(token_id = %request.token_id, txn = %request.transaction_id, amount = %request.amount)
    )]
    pub async fn redeem(&self, request: &RedeemRequest) -> CheckoutResult<PaymentReceipt> {
        let _guard = self.locks.lock(&request.token_id).await;

        let (result, outcome) = match self.try_redeem(request).await {
            Ok(Redemption::Fresh(receipt)) => {
                info!(
                    "💳 Redeemed token {} for {} ({})",
                    receipt.token_id,
                    receipt.amount.display(),
                    receipt.id
                );
                let receipt_id = receipt.id.clone();
                (Ok(receipt), AuditOutcome::Redeemed { receipt_id })
            }
            Ok(Redemption::Replay(receipt)) => {
                info!(
                    "Replayed redemption of {} for {} ({})",
                    request.token_id, request.transaction_id, receipt.id
                );
                let receipt_id = receipt.id.clone();
                (Ok(receipt), AuditOutcome::Replayed { receipt_id })
            }
            Err(e @ (CheckoutError::Token(_) | CheckoutError::Validation(_))) => {
                debug!("Rejected redemption of {}: {}", request.token_id, e);
                let code = e.code().to_string();
                (Err(e), AuditOutcome::Rejected { code })
            }
            Err(e) => {
                warn!("Redemption of {} failed: {}", request.token_id, e);
                let code = e.code().to_string();
                (Err(e), AuditOutcome::Failed { code })
            }
        };

        self.record(request, outcome).await;
        result
    }

    async fn try_redeem(&self, request: &RedeemRequest) -> CheckoutResult<Redemption> {
        if request.amount.amount < 0 {
            return Err(CheckoutError::Validation(
                "redemption amount must not be negative".into(),
            ));
        }

        let now = self.clock.now();
        let token = self
            .retry
            .run("get_token", || self.ledger.get_token(&request.token_id))
            .await?;

        let token = match self.validate(request, token, now).await? {
            Validated::Fresh(token) => token,
            Validated::Replay(receipt) => return Ok(Redemption::Replay(receipt)),
            Validated::Rejected(reason) => return Err(reason.into()),
        };

        let receipt = PaymentReceipt {
            id: format!("rcpt_{}", Uuid::new_v4().simple()),
            token_id: token.id.clone(),
            transaction_id: request.transaction_id.clone(),
            merchant_id: request.merchant_id.clone(),
            psp_id: request.psp_id.clone(),
            amount: request.amount,
            redeemed_at: now,
            voided_at: None,
        };

        let consumed = self
            .retry
            .run("consume_token", || self.ledger.consume_token(&receipt))
            .await?;
        if !consumed {
            error!(
                token_id = %token.id,
                txn = %request.transaction_id,
                "Token consumed concurrently while its lock was held"
            );
            return Err(CheckoutError::InvariantViolation(format!(
                "token {} consumed twice",
                token.id
            )));
        }
        Ok(Redemption::Fresh(receipt))
    }

    /// Void a receipt. The token stays consumed; voiding twice is a no-op.
    #[instrument(skip(self))]
    pub async fn void(&self, receipt_id: &str) -> CheckoutResult<PaymentReceipt> {
        let receipt = self.load_receipt(receipt_id).await?;
        let _guard = self.locks.lock(&receipt.token_id).await;

        let mut receipt = self.load_receipt(receipt_id).await?;
        if receipt.is_voided() {
            debug!("Receipt {} already voided", receipt_id);
            return Ok(receipt);
        }

        let now = self.clock.now();
        receipt.voided_at = Some(now);
        self.retry
            .run("put_receipt", || self.ledger.put_receipt(&receipt))
            .await?;

        self.append_audit(TokenAuditEntry {
            token_id: receipt.token_id.clone(),
            merchant_id: receipt.merchant_id.clone(),
            psp_id: receipt.psp_id.clone(),
            transaction_id: receipt.transaction_id.clone(),
            outcome: AuditOutcome::Voided {
                receipt_id: receipt.id.clone(),
            },
            at: now,
        })
        .await;
        warn!(
            "Voided receipt {} ({} on token {})",
            receipt.id,
            receipt.amount.display(),
            receipt.token_id
        );
        Ok(receipt)
    }

    async fn validate(
        &self,
        request: &RedeemRequest,
        token: Option<PaymentToken>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> CheckoutResult<Validated> {
        let Some(token) = token else {
            return Ok(Validated::Rejected(TokenError::TokenNotFound {
                token_id: request.token_id.clone(),
            }));
        };

        if token.is_consumed() {
            if let Some(receipt) = self.replayable_receipt(request, &token).await? {
                return Ok(Validated::Replay(receipt));
            }
        }
        if token.is_expired_at(now) {
            return Ok(Validated::Rejected(TokenError::TokenExpired {
                token_id: token.id,
            }));
        }
        if token.is_consumed() {
            return Ok(Validated::Rejected(TokenError::TokenAlreadyConsumed {
                token_id: token.id,
            }));
        }
        if token.psp_id != request.psp_id {
            return Ok(Validated::Rejected(TokenError::PspMismatch {
                psp_id: request.psp_id.clone(),
            }));
        }
        if token.merchant_id != request.merchant_id {
            return Ok(Validated::Rejected(TokenError::MerchantMismatch {
                merchant_id: request.merchant_id.clone(),
            }));
        }
        if token.max_amount.currency != request.amount.currency {
            return Ok(Validated::Rejected(TokenError::CurrencyMismatch {
                expected: token.max_amount.currency.to_string(),
                actual: request.amount.currency.to_string(),
            }));
        }
        if request.amount.amount > token.max_amount.amount {
            return Ok(Validated::Rejected(TokenError::AmountExceedsLimit {
                max: token.max_amount,
                requested: request.amount,
            }));
        }
        if let Some(proof) = &request.proof {
            if let Err(reason) =
                self.keyring
                    .verify(&request.merchant_id, &request.proof_message(), proof)
            {
                return Ok(Validated::Rejected(reason));
            }
        }
        Ok(Validated::Fresh(token))
    }

    /// The original receipt, if this request repeats the consuming redemption
    async fn replayable_receipt(
        &self,
        request: &RedeemRequest,
        token: &PaymentToken,
    ) -> CheckoutResult<Option<PaymentReceipt>> {
        let Some(receipt_id) = &token.consumed_by else {
            return Ok(None);
        };
        let receipt = self
            .retry
            .run("get_receipt", || self.ledger.get_receipt(receipt_id))
            .await?;
        Ok(receipt.filter(|r| {
            !r.is_voided()
                && r.transaction_id == request.transaction_id
                && r.merchant_id == request.merchant_id
                && r.psp_id == request.psp_id
                && r.amount == request.amount
        }))
    }

    async fn load_receipt(&self, receipt_id: &str) -> CheckoutResult<PaymentReceipt> {
        self.retry
            .run("get_receipt", || self.ledger.get_receipt(receipt_id))
            .await?
            .ok_or_else(|| CheckoutError::Validation(format!("unknown receipt {receipt_id}")))
    }

    async fn record(&self, request: &RedeemRequest, outcome: AuditOutcome) {
        self.append_audit(TokenAuditEntry {
            token_id: request.token_id.clone(),
            merchant_id: request.merchant_id.clone(),
            psp_id: request.psp_id.clone(),
            transaction_id: request.transaction_id.clone(),
            outcome,
            at: self.clock.now(),
        })
        .await;
    }

    /// The audit write never changes the redemption outcome
    async fn append_audit(&self, entry: TokenAuditEntry) {
        if let Err(e) = self
            .retry
            .run("append_token_audit", || self.ledger.append_token_audit(&entry))
            .await
        {
            error!(
                token_id = %entry.token_id,
                txn = %entry.transaction_id,
                "Failed to append token audit entry: {}",
                e
            );
        }
    }
}

enum Validated {
    Fresh(PaymentToken),
    Replay(PaymentReceipt),
    Rejected(TokenError),
}

enum Redemption {
    Fresh(PaymentReceipt),
    Replay(PaymentReceipt),
}

#[async_trait]
impl PaymentExchange for TokenBroker {
    async fn redeem(&self, request: &RedeemRequest) -> CheckoutResult<PaymentReceipt> {
        TokenBroker::redeem(self, request).await
    }

    async fn void(&self, receipt_id: &str) -> CheckoutResult<PaymentReceipt> {
        TokenBroker::void(self, receipt_id).await
    }

    fn exchange_name(&self) -> &'static str {
        "ledger-broker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLedger;
    use crate::testing::{payment_token, signer};
    use chrono::{Duration, Utc};
    use std::sync::Arc;
    use ucp_core::{Clock, Currency, FixedClock, LedgerStore, Money};

    struct Harness {
        broker: Arc<TokenBroker>,
        ledger: Arc<MemoryLedger>,
        clock: FixedClock,
    }

    fn harness() -> Harness {
        let ledger = Arc::new(MemoryLedger::new());
        let clock = FixedClock::new(Utc::now());
        let broker = TokenBroker::new(ledger.clone(), Arc::new(clock.clone()));
        Harness {
            broker: Arc::new(broker),
            ledger,
            clock,
        }
    }

    fn request(token_id: &str, amount: i64, txn: &str) -> RedeemRequest {
        RedeemRequest {
            token_id: token_id.into(),
            merchant_id: "merchant_acme".into(),
            psp_id: "psp_test".into(),
            amount: Money::new(amount, Currency::USD),
            transaction_id: txn.into(),
            proof: None,
        }
    }

    #[tokio::test]
    async fn test_redeem_consumes_token_and_audits() {
        let h = harness();
        h.broker.register(payment_token("tok_1", 2000, h.clock.now())).await.unwrap();

        let receipt = h.broker.redeem(&request("tok_1", 2000, "txn_1")).await.unwrap();
        assert_eq!(receipt.amount.amount, 2000);

        let token = h.broker.token("tok_1").await.unwrap().unwrap();
        assert!(token.is_consumed());
        assert_eq!(token.consumed_by.as_deref(), Some(receipt.id.as_str()));

        let audit = h.broker.audit("tok_1").await.unwrap();
        assert_eq!(audit.len(), 1);
        assert!(matches!(audit[0].outcome, AuditOutcome::Redeemed { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_redeem_has_exactly_one_winner() {
        let h = harness();
        h.broker.register(payment_token("tok_1", 2000, h.clock.now())).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..2 {
            let broker = h.broker.clone();
            handles.push(tokio::spawn(async move {
                broker.redeem(&request("tok_1", 1500, &format!("txn_{i}"))).await
            }));
        }

        let mut ok = 0;
        let mut consumed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(CheckoutError::Token(TokenError::TokenAlreadyConsumed { .. })) => consumed += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!((ok, consumed), (1, 1));
    }

    #[tokio::test]
    async fn test_amount_over_limit_leaves_token_untouched() {
        let h = harness();
        h.broker.register(payment_token("tok_50", 5000, h.clock.now())).await.unwrap();

        let err = h.broker.redeem(&request("tok_50", 6000, "txn_1")).await.unwrap_err();
        assert!(matches!(
            err,
            CheckoutError::Token(TokenError::AmountExceedsLimit { .. })
        ));

        let token = h.broker.token("tok_50").await.unwrap().unwrap();
        assert!(token.consumed_at.is_none());
        let audit = h.broker.audit("tok_50").await.unwrap();
        assert_eq!(
            audit[0].outcome,
            AuditOutcome::Rejected {
                code: "token_amount_exceeds_limit".into()
            }
        );
    }

    #[tokio::test]
    async fn test_same_transaction_replays_receipt() {
        let h = harness();
        h.broker.register(payment_token("tok_1", 2000, h.clock.now())).await.unwrap();

        let first = h.broker.redeem(&request("tok_1", 2000, "txn_1")).await.unwrap();
        let second = h.broker.redeem(&request("tok_1", 2000, "txn_1")).await.unwrap();
        assert_eq!(first, second);

        // Same token, different transaction: a real second spend
        let err = h.broker.redeem(&request("tok_1", 2000, "txn_2")).await.unwrap_err();
        assert_eq!(err.code(), "token_already_consumed");

        let outcomes: Vec<_> = h
            .broker
            .audit("tok_1")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.outcome)
            .collect();
        assert!(matches!(outcomes[1], AuditOutcome::Replayed { .. }));
        assert!(matches!(outcomes[2], AuditOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_validation_order() {
        let h = harness();
        let now = h.clock.now();

        let err = h.broker.redeem(&request("missing", 1, "t")).await.unwrap_err();
        assert_eq!(err.code(), "token_not_found");

        // Expired is reported before the PSP mismatch
        let mut expired = payment_token("tok_exp", 2000, now);
        expired.expires_at = now - Duration::seconds(1);
        h.ledger.put_token(&expired).await.unwrap();
        let mut req = request("tok_exp", 100, "t");
        req.psp_id = "other_psp".into();
        assert_eq!(h.broker.redeem(&req).await.unwrap_err().code(), "token_expired");

        // PSP before merchant
        h.broker.register(payment_token("tok_a", 2000, now)).await.unwrap();
        let mut req = request("tok_a", 100, "t");
        req.psp_id = "other_psp".into();
        req.merchant_id = "other_merchant".into();
        assert_eq!(h.broker.redeem(&req).await.unwrap_err().code(), "token_psp_mismatch");

        // Merchant before amount
        let mut req = request("tok_a", 9999, "t");
        req.merchant_id = "other_merchant".into();
        assert_eq!(
            h.broker.redeem(&req).await.unwrap_err().code(),
            "token_merchant_mismatch"
        );

        // Currency before amount
        let mut req = request("tok_a", 9999, "t");
        req.amount = Money::new(9999, Currency::EUR);
        assert_eq!(
            h.broker.redeem(&req).await.unwrap_err().code(),
            "token_currency_mismatch"
        );

        // Nothing was consumed along the way
        assert!(!h.broker.token("tok_a").await.unwrap().unwrap().is_consumed());
    }

    #[tokio::test]
    async fn test_token_expires_with_clock() {
        let h = harness();
        h.broker.register(payment_token("tok_1", 2000, h.clock.now())).await.unwrap();
        h.clock.advance(Duration::hours(2));
        let err = h.broker.redeem(&request("tok_1", 100, "t")).await.unwrap_err();
        assert_eq!(err.code(), "token_expired");
    }

    #[tokio::test]
    async fn test_proof_verification() {
        let (public_key, sign) = signer();
        let ledger = Arc::new(MemoryLedger::new());
        let clock = FixedClock::new(Utc::now());
        let broker = TokenBroker::new(ledger, Arc::new(clock.clone()))
            .with_keyring(MerchantKeyring::new().with_key("merchant_acme", public_key));
        broker.register(payment_token("tok_1", 2000, clock.now())).await.unwrap();
        broker.register(payment_token("tok_2", 2000, clock.now())).await.unwrap();

        // Signature over a different amount
        let mut forged = request("tok_1", 2000, "txn_1");
        forged.proof = Some(sign(&request("tok_1", 1000, "txn_1").proof_message()));
        let err = broker.redeem(&forged).await.unwrap_err();
        assert_eq!(err.code(), "token_invalid_proof");

        let mut garbage = request("tok_1", 2000, "txn_1");
        garbage.proof = Some("zz-not-hex".into());
        assert_eq!(broker.redeem(&garbage).await.unwrap_err().code(), "token_invalid_proof");

        let mut valid = request("tok_1", 2000, "txn_1");
        valid.proof = Some(sign(&valid.proof_message()));
        assert!(broker.redeem(&valid).await.is_ok());

        // A merchant with no registered key
        let mut unknown = request("tok_2", 2000, "txn_2");
        let keyless = TokenBroker::new(Arc::new(MemoryLedger::new()), Arc::new(clock.clone()));
        keyless.register(payment_token("tok_2", 2000, clock.now())).await.unwrap();
        unknown.proof = Some(sign(&unknown.proof_message()));
        assert_eq!(
            keyless.redeem(&unknown).await.unwrap_err().code(),
            "token_unknown_merchant_key"
        );
    }

    #[tokio::test]
    async fn test_void_is_idempotent_and_audited() {
        let h = harness();
        h.broker.register(payment_token("tok_1", 2000, h.clock.now())).await.unwrap();
        let receipt = h.broker.redeem(&request("tok_1", 2000, "txn_1")).await.unwrap();

        let voided = h.broker.void(&receipt.id).await.unwrap();
        assert!(voided.is_voided());
        let again = h.broker.void(&receipt.id).await.unwrap();
        assert_eq!(voided.voided_at, again.voided_at);

        // A voided receipt is not replayed
        let err = h.broker.redeem(&request("tok_1", 2000, "txn_1")).await.unwrap_err();
        assert_eq!(err.code(), "token_already_consumed");

        let voids = h
            .broker
            .audit("tok_1")
            .await
            .unwrap()
            .into_iter()
            .filter(|e| matches!(e.outcome, AuditOutcome::Voided { .. }))
            .count();
        assert_eq!(voids, 1);
    }

    #[tokio::test]
    async fn test_store_failure_is_audited_and_leaves_token_unspent() {
        let h = harness();
        h.broker.register(payment_token("tok_1", 2000, h.clock.now())).await.unwrap();

        h.ledger.fail_next("consume_token", 3);
        let err = h.broker.redeem(&request("tok_1", 2000, "txn_1")).await.unwrap_err();
        assert_eq!(err.code(), "store_unavailable");

        let audit = h.broker.audit("tok_1").await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(
            audit[0].outcome,
            AuditOutcome::Failed {
                code: "store_unavailable".into()
            }
        );
        let token = h.broker.token("tok_1").await.unwrap().unwrap();
        assert!(!token.is_consumed());
        assert_eq!(h.ledger.receipt_count().await, 0);

        // The token is still spendable once the store recovers
        let receipt = h.broker.redeem(&request("tok_1", 2000, "txn_1")).await.unwrap();
        assert_eq!(h.ledger.receipt_count().await, 1);
        assert!(matches!(
            h.broker.audit("tok_1").await.unwrap()[1].outcome,
            AuditOutcome::Redeemed { ref receipt_id } if *receipt_id == receipt.id
        ));
    }

    #[tokio::test]
    async fn test_negative_amount_is_audited() {
        let h = harness();
        h.broker.register(payment_token("tok_1", 2000, h.clock.now())).await.unwrap();

        let err = h.broker.redeem(&request("tok_1", -5, "txn_1")).await.unwrap_err();
        assert_eq!(err.code(), "invalid_request");
        assert_eq!(
            h.broker.audit("tok_1").await.unwrap()[0].outcome,
            AuditOutcome::Rejected {
                code: "invalid_request".into()
            }
        );
    }

    #[tokio::test]
    async fn test_register_rejects_multi_use_tokens() {
        let h = harness();
        let mut token = payment_token("tok_multi", 2000, h.clock.now());
        token.single_use = false;
        assert!(h.broker.register(token).await.is_err());
    }

    #[test]
    fn test_keyring_rejects_bad_hex() {
        let mut keyring = MerchantKeyring::new();
        assert!(keyring.insert_hex("m", "not-hex").is_err());
        assert!(keyring.insert_hex("m", "abcd").is_err());
        assert!(keyring.insert_hex("m", &"ab".repeat(32)).is_ok());
        assert!(keyring.contains("m"));
    }
}
