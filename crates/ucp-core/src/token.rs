//! # Payment Token Types
//!
//! Tokens are issued by a Credential Provider and bound to one merchant,
//! one PSP, a maximum amount and an expiry. The broker redeems each token at
//! most once and records every attempt.

use crate::money::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A CP-issued payment token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentToken {
    /// Opaque token id
    pub id: String,
    /// Issuing credential provider
    pub issuer_id: String,
    /// PSP authorized to redeem
    pub psp_id: String,
    /// Merchant the token is bound to
    pub merchant_id: String,
    /// Upper bound on the redeemed amount; fixes the currency
    pub max_amount: Money,
    pub expires_at: DateTime<Utc>,
    #[serde(default = "default_true")]
    pub single_use: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed_at: Option<DateTime<Utc>>,
    /// Receipt issued by the consuming redemption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed_by: Option<String>,
}

fn default_true() -> bool {
    true
}

impl PaymentToken {
    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Proof that a redemption was issued for a specific transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub id: String,
    pub token_id: String,
    pub transaction_id: String,
    pub merchant_id: String,
    pub psp_id: String,
    pub amount: Money,
    pub redeemed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voided_at: Option<DateTime<Utc>>,
}

impl PaymentReceipt {
    pub fn is_voided(&self) -> bool {
        self.voided_at.is_some()
    }
}

/// Payment instrument supplied by the platform on `complete`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCredential {
    pub token_id: String,
    pub psp_id: String,
    /// Hex-encoded Ed25519 signature over [`proof_message`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
}

impl PaymentCredential {
    pub fn new(token_id: impl Into<String>, psp_id: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            psp_id: psp_id.into(),
            proof: None,
        }
    }

    /// Builder: attach an authorization proof
    pub fn with_proof(mut self, proof: impl Into<String>) -> Self {
        self.proof = Some(proof.into());
        self
    }
}

/// A redemption request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemRequest {
    pub token_id: String,
    pub merchant_id: String,
    pub psp_id: String,
    pub amount: Money,
    pub transaction_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
}

impl RedeemRequest {
    /// Canonical bytes the authorization proof signs
    pub fn proof_message(&self) -> Vec<u8> {
        proof_message(
            &self.token_id,
            &self.merchant_id,
            &self.psp_id,
            self.amount,
            &self.transaction_id,
        )
    }
}

/// `token_id|merchant_id|psp_id|amount|currency|transaction_id`
pub fn proof_message(
    token_id: &str,
    merchant_id: &str,
    psp_id: &str,
    amount: Money,
    transaction_id: &str,
) -> Vec<u8> {
    format!(
        "{}|{}|{}|{}|{}|{}",
        token_id, merchant_id, psp_id, amount.amount, amount.currency, transaction_id
    )
    .into_bytes()
}

/// Outcome of a redemption attempt, as written to the audit log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum AuditOutcome {
    Redeemed { receipt_id: String },
    /// Same transaction redeemed again; existing receipt returned
    Replayed { receipt_id: String },
    Rejected { code: String },
    /// Passed validation but could not be completed; the token is untouched
    Failed { code: String },
    Voided { receipt_id: String },
}

/// Append-only audit record of a broker call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAuditEntry {
    pub token_id: String,
    pub merchant_id: String,
    pub psp_id: String,
    pub transaction_id: String,
    pub outcome: AuditOutcome,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Currency;

    #[test]
    fn test_proof_message_is_canonical() {
        let request = RedeemRequest {
            token_id: "tok_1".into(),
            merchant_id: "merchant_acme".into(),
            psp_id: "psp_x".into(),
            amount: Money::new(2000, Currency::USD),
            transaction_id: "txn_9".into(),
            proof: None,
        };
        assert_eq!(
            request.proof_message(),
            b"tok_1|merchant_acme|psp_x|2000|USD|txn_9".to_vec()
        );
    }

    #[test]
    fn test_audit_outcome_serialization() {
        let json = serde_json::to_value(AuditOutcome::Rejected {
            code: "token_expired".into(),
        })
        .unwrap();
        assert_eq!(json["outcome"], "rejected");
        assert_eq!(json["detail"]["code"], "token_expired");
    }
}
