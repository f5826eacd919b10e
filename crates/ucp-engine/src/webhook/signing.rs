//! # Webhook Signatures
//!
//! Every delivery carries `UCP-Signature: t=<unix seconds>,v1=<hex>` where
//! the `v1` value is HMAC-SHA256 over `<t>.<body>` keyed with the endpoint's
//! shared secret. Receivers verify with [`verify_signature`].

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature
pub const SIGNATURE_HEADER: &str = "UCP-Signature";
/// Header carrying the stable delivery id receivers deduplicate on
pub const DELIVERY_ID_HEADER: &str = "UCP-Delivery-Id";
/// Header carrying the event topic
pub const TOPIC_HEADER: &str = "UCP-Topic";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Missing timestamp in signature")]
    MissingTimestamp,

    #[error("No v1 signature found")]
    MissingSignature,

    #[error("Timestamp outside tolerance")]
    Stale,

    #[error("Signature mismatch")]
    Mismatch,
}

/// Build the `UCP-Signature` header value for a body sent at `at`
pub fn sign_payload(secret: &str, body: &[u8], at: DateTime<Utc>) -> String {
    let timestamp = at.timestamp();
    format!("t={},v1={}", timestamp, compute_hmac_sha256(secret, timestamp, body))
}

/// Verify a `UCP-Signature` header against the raw body.
///
/// `tolerance_secs` bounds how far the signed timestamp may be from `now`.
pub fn verify_signature(
    secret: &str,
    header: &str,
    body: &[u8],
    now: DateTime<Utc>,
    tolerance_secs: i64,
) -> Result<(), SignatureError> {
    let parts = parse_signature_header(header)?;

    if (now.timestamp() - parts.timestamp).abs() > tolerance_secs {
        return Err(SignatureError::Stale);
    }

    // Mac::verify_slice compares in constant time
    let matched = parts.signatures.iter().any(|sig| match hex::decode(sig) {
        Ok(bytes) => signing_mac(secret, parts.timestamp, body)
            .verify_slice(&bytes)
            .is_ok(),
        Err(_) => false,
    });
    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<String>,
}

fn parse_signature_header(header: &str) -> Result<SignatureHeader, SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse().ok(),
            "v1" => signatures.push(value.to_string()),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::MissingTimestamp)?;
    if signatures.is_empty() {
        return Err(SignatureError::MissingSignature);
    }
    Ok(SignatureHeader {
        timestamp,
        signatures,
    })
}

fn signing_mac(secret: &str, timestamp: i64, body: &[u8]) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    mac
}

fn compute_hmac_sha256(secret: &str, timestamp: i64, body: &[u8]) -> String {
    hex::encode(signing_mac(secret, timestamp, body).finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_sign_then_verify() {
        let now = Utc::now();
        let body = br#"{"topic":"order.created"}"#;
        let header = sign_payload("whsec_test", body, now);

        assert!(header.starts_with(&format!("t={},v1=", now.timestamp())));
        assert_eq!(verify_signature("whsec_test", &header, body, now, 300), Ok(()));
    }

    #[test]
    fn test_tampered_body_or_wrong_secret_fails() {
        let now = Utc::now();
        let header = sign_payload("whsec_test", b"{}", now);
        assert_eq!(
            verify_signature("whsec_test", &header, b"{ }", now, 300),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_signature("whsec_other", &header, b"{}", now, 300),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let now = Utc::now();
        let header = sign_payload("whsec_test", b"{}", now - Duration::minutes(10));
        assert_eq!(
            verify_signature("whsec_test", &header, b"{}", now, 300),
            Err(SignatureError::Stale)
        );
    }

    #[test]
    fn test_parse_signature_header() {
        let parsed = parse_signature_header("t=1234567890, v1=abc123,v1=def456").unwrap();
        assert_eq!(parsed.timestamp, 1234567890);
        assert_eq!(parsed.signatures, vec!["abc123", "def456"]);

        assert!(matches!(
            parse_signature_header("v1=abc"),
            Err(SignatureError::MissingTimestamp)
        ));
        assert!(matches!(
            parse_signature_header("t=1"),
            Err(SignatureError::MissingSignature)
        ));
    }

    #[test]
    fn test_any_matching_v1_verifies() {
        let now = Utc::now();
        let valid = sign_payload("whsec_test", b"{}", now);
        let v1 = valid.split_once(",v1=").unwrap().1;
        let t = now.timestamp();

        // Rotated secrets send several v1 values; garbage ones are skipped
        let header = format!("t={t},v1=not-hex,v1={},v1={v1}", "00".repeat(32));
        assert_eq!(verify_signature("whsec_test", &header, b"{}", now, 300), Ok(()));

        let header = format!("t={t},v1=zz,v1={}", &v1[..v1.len() - 2]);
        assert_eq!(
            verify_signature("whsec_test", &header, b"{}", now, 300),
            Err(SignatureError::Mismatch)
        );
    }
}
