//! Webhook Signing
//!
//! HMAC-SHA256 over `body || timestamp`, hex encoded, plus the
//! receiver-side check with a clock-skew window.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{LedgerError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Ledger-Signature";
pub const EVENT_TYPE_HEADER: &str = "X-Event-Type";
pub const EVENT_ID_HEADER: &str = "X-Event-Id";
pub const TENANT_HEADER: &str = "X-Tenant-Id";
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";

/// Receivers reject timestamps further than this from their own clock.
pub const DEFAULT_MAX_SKEW_SECS: i64 = 300;

const MAX_ERROR_LEN: usize = 1000;

fn keyed(secret: &str, body: &[u8], timestamp: i64) -> Result<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|e| LedgerError::CryptoError(format!("Invalid webhook secret: {}", e)))?;
    mac.update(body);
    mac.update(timestamp.to_string().as_bytes());
    Ok(mac)
}

/// Hex signature sent in [`SIGNATURE_HEADER`].
pub fn sign_payload(secret: &str, body: &[u8], timestamp: i64) -> Result<String> {
    Ok(hex::encode(keyed(secret, body, timestamp)?.finalize().into_bytes()))
}

/// Check a received webhook. The comparison is constant-time; a timestamp
/// outside `max_skew_secs` of `now` fails regardless of the signature.
pub fn verify_signature(
    body: &[u8],
    timestamp: i64,
    signature_hex: &str,
    secret: &str,
    max_skew_secs: i64,
    now: i64,
) -> bool {
    if (now - timestamp).abs() > max_skew_secs {
        return false;
    }
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    match keyed(secret, body, timestamp) {
        Ok(mac) => mac.verify_slice(&expected).is_ok(),
        Err(_) => false,
    }
}

/// Cap stored error text at 1000 characters.
pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_LEN) {
        Some((cut, _)) => message[..cut].to_string(),
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_767_225_600;

    #[test]
    fn test_sign_and_verify() {
        let body = br#"{"event_type":"consent.granted"}"#;
        let signature = sign_payload("whsec", body, NOW).unwrap();

        assert_eq!(signature.len(), 64);
        assert!(verify_signature(body, NOW, &signature, "whsec", DEFAULT_MAX_SKEW_SECS, NOW + 10));
    }

    #[test]
    fn test_signature_covers_timestamp_and_body() {
        let body = b"{}";
        let signature = sign_payload("whsec", body, NOW).unwrap();

        assert!(!verify_signature(body, NOW + 1, &signature, "whsec", DEFAULT_MAX_SKEW_SECS, NOW));
        assert!(!verify_signature(b"{ }", NOW, &signature, "whsec", DEFAULT_MAX_SKEW_SECS, NOW));
        assert!(!verify_signature(body, NOW, &signature, "other", DEFAULT_MAX_SKEW_SECS, NOW));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let body = b"{}";
        let signature = sign_payload("whsec", body, NOW).unwrap();
        assert!(!verify_signature(body, NOW, &signature, "whsec", DEFAULT_MAX_SKEW_SECS, NOW + 301));
        assert!(!verify_signature(body, NOW, "zz-not-hex", "whsec", DEFAULT_MAX_SKEW_SECS, NOW));
    }

    #[test]
    fn test_truncate_error() {
        let long = "é".repeat(1500);
        assert_eq!(truncate_error(&long).chars().count(), 1000);
        assert_eq!(truncate_error("short"), "short");
    }
}
