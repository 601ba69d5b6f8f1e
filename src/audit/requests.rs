//! Request Digest Log
//!
//! Ledger-adjacent record of API traffic. Only SHA-256 digests of bodies are
//! kept, so a caller can later prove a payload was seen without the store
//! retaining it. Verification markers live here, outside the hash chain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, info};

use crate::crypto::hashing::{canonical_timestamp, optional_digest, utc_now};
use crate::crypto::tenant_keys::TenantSecrets;
use crate::database::{Database, Pagination};
use crate::error::Result;

const REQUEST_COLUMNS: &str = "id, tenant_id, actor_ref, method, path, status_code, ip_hash, \
     request_hash, response_hash, created_at, verified_at, verifier_ref";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: i64,
    pub tenant_id: String,
    pub actor_ref: Option<String>,
    pub method: String,
    pub path: String,
    pub status_code: i64,
    pub ip_hash: Option<String>,
    pub request_hash: Option<String>,
    pub response_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub verifier_ref: Option<String>,
}

impl RequestRecord {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            actor_ref: row.try_get("actor_ref")?,
            method: row.try_get("method")?,
            path: row.try_get("path")?,
            status_code: row.try_get("status_code")?,
            ip_hash: row.try_get("ip_hash")?,
            request_hash: row.try_get("request_hash")?,
            response_hash: row.try_get("response_hash")?,
            created_at: row.try_get("created_at")?,
            verified_at: row.try_get("verified_at")?,
            verifier_ref: row.try_get("verifier_ref")?,
        })
    }
}

/// Everything observed about one API call.
#[derive(Debug, Clone, Default)]
pub struct RequestObservation<'a> {
    pub actor_ref: Option<String>,
    pub method: &'a str,
    pub path: &'a str,
    pub status_code: u16,
    pub ip: Option<&'a str>,
    pub request_body: Option<&'a [u8]>,
    pub response_body: Option<&'a [u8]>,
}

#[derive(Clone)]
pub struct RequestDigestLog {
    pub(super) db: Database,
    secrets: TenantSecrets,
}

impl RequestDigestLog {
    pub fn new(db: Database, secrets: TenantSecrets) -> Self {
        Self { db, secrets }
    }

    pub async fn record_request(&self, tenant_id: &str, observed: &RequestObservation<'_>) -> Result<RequestRecord> {
        let ip_hash = match observed.ip {
            Some(ip) => Some(self.secrets.hash_identifier(tenant_id, ip)?),
            None => None,
        };
        let request_hash = optional_digest(observed.request_body);
        let response_hash = optional_digest(observed.response_body);
        let created_at = utc_now();

        let result = sqlx::query(
            r#"
            INSERT INTO request_log
                (tenant_id, actor_ref, method, path, status_code, ip_hash,
                 request_hash, response_hash, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(tenant_id)
        .bind(&observed.actor_ref)
        .bind(observed.method)
        .bind(observed.path)
        .bind(i64::from(observed.status_code))
        .bind(&ip_hash)
        .bind(&request_hash)
        .bind(&response_hash)
        .bind(canonical_timestamp(&created_at))
        .execute(self.db.pool())
        .await?;

        debug!("Recorded {} {} for tenant {}", observed.method, observed.path, tenant_id);

        Ok(RequestRecord {
            id: result.last_insert_rowid(),
            tenant_id: tenant_id.to_string(),
            actor_ref: observed.actor_ref.clone(),
            method: observed.method.to_string(),
            path: observed.path.to_string(),
            status_code: i64::from(observed.status_code),
            ip_hash,
            request_hash,
            response_hash,
            created_at,
            verified_at: None,
            verifier_ref: None,
        })
    }

    /// Most recent record whose request or response digest equals `digest`.
    /// `tenant_id = None` searches every tenant.
    pub async fn find_by_digest(&self, tenant_id: Option<&str>, digest: &str) -> Result<Option<RequestRecord>> {
        let row = match tenant_id {
            Some(tenant_id) => {
                sqlx::query(&format!(
                    "SELECT {} FROM request_log
                     WHERE tenant_id = ? AND (request_hash = ? OR response_hash = ?)
                     ORDER BY id DESC LIMIT 1",
                    REQUEST_COLUMNS
                ))
                .bind(tenant_id)
                .bind(digest)
                .bind(digest)
                .fetch_optional(self.db.pool())
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM request_log
                     WHERE request_hash = ? OR response_hash = ?
                     ORDER BY id DESC LIMIT 1",
                    REQUEST_COLUMNS
                ))
                .bind(digest)
                .bind(digest)
                .fetch_optional(self.db.pool())
                .await?
            }
        };

        row.as_ref().map(RequestRecord::from_row).transpose()
    }

    /// Stamp the verification marker unless one is already present.
    /// Returns true if this call set it.
    pub async fn mark_verified(&self, record_id: i64, verifier_ref: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE request_log SET verified_at = ?, verifier_ref = ? WHERE id = ? AND verified_at IS NULL",
        )
        .bind(canonical_timestamp(&utc_now()))
        .bind(verifier_ref)
        .bind(record_id)
        .execute(self.db.pool())
        .await?;

        let stamped = result.rows_affected() > 0;
        if stamped {
            info!("Request record {} verified by {}", record_id, verifier_ref);
        }
        Ok(stamped)
    }

    pub async fn get(&self, record_id: i64) -> Result<Option<RequestRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM request_log WHERE id = ?", REQUEST_COLUMNS))
            .bind(record_id)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(RequestRecord::from_row).transpose()
    }

    /// Canonical order: tenant ascending, then insertion order.
    pub async fn records_in_order(&self, tenant_id: Option<&str>) -> Result<Vec<RequestRecord>> {
        let rows = match tenant_id {
            Some(tenant_id) => {
                sqlx::query(&format!(
                    "SELECT {} FROM request_log WHERE tenant_id = ? ORDER BY id ASC",
                    REQUEST_COLUMNS
                ))
                .bind(tenant_id)
                .fetch_all(self.db.pool())
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM request_log ORDER BY tenant_id ASC, id ASC",
                    REQUEST_COLUMNS
                ))
                .fetch_all(self.db.pool())
                .await?
            }
        };
        rows.iter().map(RequestRecord::from_row).collect()
    }

    pub async fn list(&self, tenant_id: &str, page: Pagination) -> Result<Vec<RequestRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM request_log WHERE tenant_id = ? ORDER BY id DESC LIMIT ? OFFSET ?",
            REQUEST_COLUMNS
        ))
        .bind(tenant_id)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(RequestRecord::from_row).collect()
    }
}
