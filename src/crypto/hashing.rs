//! Canonical Hashing
//!
//! Canonical JSON serialization and the SHA-256 digests the ledger chain
//! is built from. Everything here is pure.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// `prev_hash` of the first ledger entry of every tenant.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Serialize `value` with object keys sorted and no insignificant whitespace.
///
/// Key order is enforced here rather than relying on the map type backing
/// `serde_json::Value`, so the output is stable whatever features the
/// dependency graph turns on.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Current time at the microsecond precision every stored timestamp uses.
pub fn utc_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 form (`2026-01-01T00:00:00.000000Z`). Hashed payloads
/// and stored columns both use it, so text order is time order.
pub fn canonical_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Lowercase hex SHA-256 of arbitrary bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Raw SHA-256 digest, used as the message for export signatures.
pub fn sha256_digest(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// `SHA256(prev_hash || canonical_json(payload))` as lowercase hex.
pub fn compute_entry_hash(prev_hash: &str, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(canonical_json(payload).as_bytes());
    hex::encode(hasher.finalize())
}

/// Digest of an optional body; empty bodies have no digest.
pub fn optional_digest(body: Option<&[u8]>) -> Option<String> {
    match body {
        Some(bytes) if !bytes.is_empty() => Some(sha256_hex(bytes)),
        _ => None,
    }
}
