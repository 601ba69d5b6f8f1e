//! Export Formats
//!
//! Row rendering for ledger and request-log exports. Rows arrive already in
//! canonical order; rendering never reorders them.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::audit::{LedgerEntry, RequestRecord};
use crate::crypto::hashing::{canonical_json, canonical_timestamp};
use crate::error::{LedgerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            _ => Err(LedgerError::ValidationError(format!("Unsupported export format: {}", s))),
        }
    }
}

pub const LEDGER_CSV_HEADER: [&str; 12] = [
    "seq",
    "id",
    "tenant_id",
    "created_at",
    "actor_ref",
    "event_type",
    "object_type",
    "object_id",
    "prev_hash",
    "entry_hash",
    "request_fingerprint",
    "payload",
];

pub const REQUEST_CSV_HEADER: [&str; 12] = [
    "id",
    "tenant_id",
    "created_at",
    "actor_ref",
    "method",
    "path",
    "status_code",
    "ip_hash",
    "request_hash",
    "response_hash",
    "verified_at",
    "verifier_ref",
];

/// Quote a field per RFC 4180 when it contains a delimiter, quote or line break.
pub fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_line(fields: &[String], out: &mut String) {
    let line: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
    out.push_str(&line.join(","));
    out.push_str("\r\n");
}

fn header_line(header: &[&str], out: &mut String) {
    let fields: Vec<String> = header.iter().map(|h| h.to_string()).collect();
    csv_line(&fields, out);
}

pub fn ledger_entry_json(entry: &LedgerEntry) -> Value {
    json!({
        "seq": entry.seq,
        "id": entry.id,
        "tenant_id": entry.tenant_id,
        "created_at": canonical_timestamp(&entry.created_at),
        "actor_ref": entry.actor_ref,
        "event_type": entry.event_type,
        "object_type": entry.object_type,
        "object_id": entry.object_id,
        "prev_hash": entry.prev_hash,
        "entry_hash": entry.entry_hash,
        "request_fingerprint": entry.request_fingerprint,
        "payload": entry.payload,
    })
}

pub fn request_record_json(record: &RequestRecord) -> Value {
    json!({
        "id": record.id,
        "tenant_id": record.tenant_id,
        "created_at": canonical_timestamp(&record.created_at),
        "actor_ref": record.actor_ref,
        "method": record.method,
        "path": record.path,
        "status_code": record.status_code,
        "ip_hash": record.ip_hash,
        "request_hash": record.request_hash,
        "response_hash": record.response_hash,
        "verified_at": record.verified_at.as_ref().map(canonical_timestamp),
        "verifier_ref": record.verifier_ref,
    })
}

pub fn render_ledger(entries: &[LedgerEntry], format: ExportFormat) -> Result<Vec<u8>> {
    match format {
        ExportFormat::Json => {
            let rows: Vec<Value> = entries.iter().map(ledger_entry_json).collect();
            Ok(serde_json::to_vec_pretty(&rows)?)
        }
        ExportFormat::Csv => {
            let mut out = String::new();
            header_line(&LEDGER_CSV_HEADER, &mut out);
            for entry in entries {
                csv_line(
                    &[
                        entry.seq.to_string(),
                        entry.id.clone(),
                        entry.tenant_id.clone(),
                        canonical_timestamp(&entry.created_at),
                        entry.actor_ref.clone().unwrap_or_default(),
                        entry.event_type.clone(),
                        entry.object_type.clone(),
                        entry.object_id.clone(),
                        entry.prev_hash.clone(),
                        entry.entry_hash.clone(),
                        entry.request_fingerprint.clone().unwrap_or_default(),
                        canonical_json(&entry.payload),
                    ],
                    &mut out,
                );
            }
            Ok(out.into_bytes())
        }
    }
}

pub fn render_requests(records: &[RequestRecord], format: ExportFormat) -> Result<Vec<u8>> {
    match format {
        ExportFormat::Json => {
            let rows: Vec<Value> = records.iter().map(request_record_json).collect();
            Ok(serde_json::to_vec_pretty(&rows)?)
        }
        ExportFormat::Csv => {
            let mut out = String::new();
            header_line(&REQUEST_CSV_HEADER, &mut out);
            for record in records {
                csv_line(
                    &[
                        record.id.to_string(),
                        record.tenant_id.clone(),
                        canonical_timestamp(&record.created_at),
                        record.actor_ref.clone().unwrap_or_default(),
                        record.method.clone(),
                        record.path.clone(),
                        record.status_code.to_string(),
                        record.ip_hash.clone().unwrap_or_default(),
                        record.request_hash.clone().unwrap_or_default(),
                        record.response_hash.clone().unwrap_or_default(),
                        record.verified_at.as_ref().map(canonical_timestamp).unwrap_or_default(),
                        record.verifier_ref.clone().unwrap_or_default(),
                    ],
                    &mut out,
                );
            }
            Ok(out.into_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn entry(seq: i64, payload: Value) -> LedgerEntry {
        LedgerEntry {
            seq,
            id: format!("01H{}", seq),
            tenant_id: "acme".to_string(),
            actor_ref: Some("user:u1".to_string()),
            event_type: "consent.granted".to_string(),
            object_type: "consent_event".to_string(),
            object_id: format!("ev-{}", seq),
            prev_hash: "0".repeat(64),
            entry_hash: "a".repeat(64),
            payload,
            request_fingerprint: None,
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn test_ledger_csv_has_header_and_quoted_payload() {
        let bytes = render_ledger(&[entry(1, json!({"b": 1, "a": "x"}))], ExportFormat::Csv).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let mut lines = text.split("\r\n");

        assert_eq!(lines.next().unwrap(), LEDGER_CSV_HEADER.join(","));
        let row = lines.next().unwrap();
        assert!(row.starts_with("1,01H1,acme,2026-03-01T10:00:00.000000Z,user:u1,"));
        assert!(row.ends_with(r#","{""a"":""x"",""b"":1}""#));
    }

    #[test]
    fn test_ledger_json_keeps_row_order() {
        let bytes = render_ledger(&[entry(2, json!({})), entry(5, json!({}))], ExportFormat::Json).unwrap();
        let rows: Vec<Value> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["seq"], 2);
        assert_eq!(rows[1]["seq"], 5);
        assert_eq!(rows[0]["created_at"], "2026-03-01T10:00:00.000000Z");
    }

    #[test]
    fn test_empty_export_is_header_only() {
        let csv = render_ledger(&[], ExportFormat::Csv).unwrap();
        assert_eq!(String::from_utf8(csv).unwrap(), format!("{}\r\n", LEDGER_CSV_HEADER.join(",")));
        let json = render_ledger(&[], ExportFormat::Json).unwrap();
        assert_eq!(json, b"[]");
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert!("xml".parse::<ExportFormat>().is_err());
    }
}
