//! Ledger Entry
//!
//! One link of a tenant's hash chain, plus the draft and filter types used
//! to write and read them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::crypto::hashing::compute_entry_hash;
use crate::error::Result;

/// Ledger entry with cryptographic hash chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Storage sequence; orders entries by creation.
    pub seq: i64,
    pub id: String,
    pub tenant_id: String,
    pub actor_ref: Option<String>,
    pub event_type: String,
    pub object_type: String,
    pub object_id: String,
    pub prev_hash: String,
    pub entry_hash: String,
    /// The event payload the hash was computed over.
    pub payload: Value,
    pub request_fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        let payload: String = row.try_get("payload")?;
        Ok(Self {
            seq: row.try_get("seq")?,
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            actor_ref: row.try_get("actor_ref")?,
            event_type: row.try_get("event_type")?,
            object_type: row.try_get("object_type")?,
            object_id: row.try_get("object_id")?,
            prev_hash: row.try_get("prev_hash")?,
            entry_hash: row.try_get("entry_hash")?,
            payload: serde_json::from_str(&payload)?,
            request_fingerprint: row.try_get("request_fingerprint")?,
            created_at: row.try_get("created_at")?,
        })
    }

    /// Hash this entry should carry given its stored predecessor and payload.
    pub fn recompute_hash(&self) -> String {
        compute_entry_hash(&self.prev_hash, &self.payload)
    }

    /// Verify this entry's hash
    pub fn verify_hash(&self) -> bool {
        self.entry_hash == self.recompute_hash()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} {} {}:{} ({})",
            self.tenant_id, self.event_type, self.object_type, self.object_id, self.entry_hash
        )
    }
}

/// An event waiting to be chained: everything but the hash pair.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerDraft {
    pub tenant_id: String,
    pub actor_ref: Option<String>,
    pub event_type: String,
    pub object_type: String,
    pub object_id: String,
    pub payload: Value,
    pub request_fingerprint: Option<String>,
}

impl LedgerDraft {
    pub fn new(
        tenant_id: impl Into<String>,
        event_type: impl Into<String>,
        object_type: impl Into<String>,
        object_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            actor_ref: None,
            event_type: event_type.into(),
            object_type: object_type.into(),
            object_id: object_id.into(),
            payload,
            request_fingerprint: None,
        }
    }

    pub fn with_actor(mut self, actor_ref: impl Into<String>) -> Self {
        self.actor_ref = Some(actor_ref.into());
        self
    }

    /// Digest of the API request that caused this event.
    pub fn with_fingerprint(mut self, fingerprint: Option<String>) -> Self {
        self.request_fingerprint = fingerprint;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerFilter {
    pub event_type: Option<String>,
    pub object_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}
