//! Webhook Types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::{LedgerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(DeliveryStatus::Pending),
            "sent" => Ok(DeliveryStatus::Sent),
            "failed" => Ok(DeliveryStatus::Failed),
            _ => Err(LedgerError::ValidationError(format!("Unknown delivery status: {}", s))),
        }
    }
}

/// A subscriber URL. The signing secret never leaves the store in this form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub id: i64,
    pub tenant_id: String,
    pub url: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            url: row.try_get("url")?,
            active: row.try_get("active")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Endpoint as the worker needs it, secret still encrypted.
#[derive(Debug, Clone)]
pub(crate) struct EndpointRecord {
    pub endpoint: WebhookEndpoint,
    pub encrypted_secret: String,
}

impl EndpointRecord {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            endpoint: WebhookEndpoint::from_row(row)?,
            encrypted_secret: row.try_get("encrypted_secret")?,
        })
    }
}

/// One event bound for one endpoint, and the trail of trying to send it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: String,
    pub tenant_id: String,
    pub endpoint_id: i64,
    pub event_type: String,
    pub payload: Value,
    pub status: DeliveryStatus,
    pub attempt_count: i64,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub response_code: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WebhookDelivery {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        let payload: String = row.try_get("payload")?;
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            endpoint_id: row.try_get("endpoint_id")?,
            event_type: row.try_get("event_type")?,
            payload: serde_json::from_str(&payload)?,
            status: status.parse()?,
            attempt_count: row.try_get("attempt_count")?,
            last_attempt_at: row.try_get("last_attempt_at")?,
            response_code: row.try_get("response_code")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_status_roundtrip() {
        for status in [DeliveryStatus::Pending, DeliveryStatus::Sent, DeliveryStatus::Failed] {
            assert_eq!(status.as_str().parse::<DeliveryStatus>().unwrap(), status);
        }
        assert!("queued".parse::<DeliveryStatus>().is_err());
    }
}
