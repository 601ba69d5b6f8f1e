//! Consent Types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{LedgerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentStatus {
    Granted,
    Withdrawn,
}

impl ConsentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentStatus::Granted => "granted",
            ConsentStatus::Withdrawn => "withdrawn",
        }
    }

    /// Ledger and webhook event type for a transition into this status.
    pub fn event_type(&self) -> String {
        format!("consent.{}", self.as_str())
    }
}

impl fmt::Display for ConsentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConsentStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "granted" => Ok(ConsentStatus::Granted),
            "withdrawn" => Ok(ConsentStatus::Withdrawn),
            _ => Err(LedgerError::ValidationError(format!("Unsupported consent status: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentMethod {
    Checkbox,
    Tos,
    Contract,
    Other,
}

impl ConsentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentMethod::Checkbox => "checkbox",
            ConsentMethod::Tos => "tos",
            ConsentMethod::Contract => "contract",
            ConsentMethod::Other => "other",
        }
    }
}

impl std::str::FromStr for ConsentMethod {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "checkbox" => Ok(ConsentMethod::Checkbox),
            "tos" => Ok(ConsentMethod::Tos),
            "contract" => Ok(ConsentMethod::Contract),
            "other" => Ok(ConsentMethod::Other),
            _ => Err(LedgerError::ValidationError(format!("Unsupported consent method: {}", s))),
        }
    }
}

/// A processing purpose consent is given for, e.g. `marketing`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Purpose {
    pub id: i64,
    pub tenant_id: String,
    pub code: String,
    pub description: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Purpose {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            code: row.try_get("code")?,
            description: row.try_get("description")?,
            active: row.try_get("active")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// An upstream system consents are collected through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSystem {
    pub id: i64,
    pub tenant_id: String,
    pub code: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SourceSystem {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            code: row.try_get("code")?,
            description: row.try_get("description")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Current consent state for one (tenant, user, purpose).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentAggregate {
    pub id: i64,
    pub tenant_id: String,
    pub external_user_id: String,
    pub purpose_id: i64,
    pub status: ConsentStatus,
    pub last_event_at: DateTime<Utc>,
    pub source_system_id: Option<i64>,
    pub evidence_ref: Option<String>,
    /// Field name to base64 ciphertext.
    pub encrypted_fields: Option<BTreeMap<String, String>>,
    pub created_at: DateTime<Utc>,
}

impl ConsentAggregate {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        let status: String = row.try_get("status")?;
        let encrypted: Option<String> = row.try_get("encrypted_fields")?;
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            external_user_id: row.try_get("external_user_id")?,
            purpose_id: row.try_get("purpose_id")?,
            status: status.parse()?,
            last_event_at: row.try_get("last_event_at")?,
            source_system_id: row.try_get("source_system_id")?,
            evidence_ref: row.try_get("evidence_ref")?,
            encrypted_fields: encrypted.map(|json| serde_json::from_str(&json)).transpose()?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// One immutable consent transition, twinned with a ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentEvent {
    pub id: String,
    pub tenant_id: String,
    pub aggregate_id: i64,
    pub purpose_id: i64,
    pub status: ConsentStatus,
    pub method: ConsentMethod,
    pub source: Option<String>,
    pub ip_hash: Option<String>,
    pub user_agent_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub evidence_ref: Option<String>,
    pub prev_hash: String,
    pub event_hash: String,
}

impl ConsentEvent {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        let status: String = row.try_get("status")?;
        let method: String = row.try_get("method")?;
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            purpose_id: row.try_get("purpose_id")?,
            status: status.parse()?,
            method: method.parse()?,
            source: row.try_get("source")?,
            ip_hash: row.try_get("ip_hash")?,
            user_agent_hash: row.try_get("user_agent_hash")?,
            timestamp: row.try_get("timestamp")?,
            evidence_ref: row.try_get("evidence_ref")?,
            prev_hash: row.try_get("prev_hash")?,
            event_hash: row.try_get("event_hash")?,
        })
    }
}

/// Input to `ConsentEngine::record_consent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentRequest {
    pub external_user_id: String,
    pub purpose_code: String,
    pub status: ConsentStatus,
    pub method: ConsentMethod,
    pub source: Option<String>,
    pub system_code: Option<String>,
    pub evidence_ref: Option<String>,
    /// Plaintext values to store encrypted on the aggregate.
    pub encrypted_fields: Option<BTreeMap<String, String>>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    /// Digest of the API request body, linked from the ledger entry.
    pub request_fingerprint: Option<String>,
}

impl ConsentRequest {
    pub fn new(
        external_user_id: impl Into<String>,
        purpose_code: impl Into<String>,
        status: ConsentStatus,
        method: ConsentMethod,
    ) -> Self {
        Self {
            external_user_id: external_user_id.into(),
            purpose_code: purpose_code.into(),
            status,
            method,
            source: None,
            system_code: None,
            evidence_ref: None,
            encrypted_fields: None,
            ip: None,
            user_agent: None,
            request_fingerprint: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AggregateFilter {
    pub status: Option<ConsentStatus>,
    pub external_user_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub aggregate_id: Option<i64>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing() {
        assert_eq!("GRANTED".parse::<ConsentStatus>().unwrap(), ConsentStatus::Granted);
        assert_eq!("withdrawn".parse::<ConsentStatus>().unwrap(), ConsentStatus::Withdrawn);
        assert!(matches!("pending".parse::<ConsentStatus>(), Err(LedgerError::ValidationError(_))));
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("checkbox".parse::<ConsentMethod>().unwrap(), ConsentMethod::Checkbox);
        assert_eq!("TOS".parse::<ConsentMethod>().unwrap(), ConsentMethod::Tos);
        assert!("sms".parse::<ConsentMethod>().is_err());
    }

    #[test]
    fn test_event_type() {
        assert_eq!(ConsentStatus::Granted.event_type(), "consent.granted");
        assert_eq!(ConsentStatus::Withdrawn.event_type(), "consent.withdrawn");
    }
}
