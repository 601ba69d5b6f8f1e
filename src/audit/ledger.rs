//! Audit Ledger
//!
//! Persists per-tenant hash chains. Appends for one tenant are serialised by
//! an async lock held across the read-compute-write sequence; the unique
//! `(tenant_id, prev_hash)` index refuses any fork that slips past it.

use serde_json::Value;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info};

use crate::audit::entry::{LedgerDraft, LedgerEntry, LedgerFilter};
use crate::audit::verify::{verify_chain, ChainReport};
use crate::crypto::hashing::{canonical_json, canonical_timestamp, compute_entry_hash, utc_now, GENESIS_HASH};
use crate::database::{Database, Pagination};
use crate::error::{LedgerError, Result};
use crate::ids::new_id;

const ENTRY_COLUMNS: &str = "seq, id, tenant_id, actor_ref, event_type, object_type, object_id, \
     prev_hash, entry_hash, payload, request_fingerprint, created_at";

#[derive(Clone)]
pub struct AuditLedger {
    db: Database,
    locks: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl AuditLedger {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Exclusive chain lock for `tenant_id`. Other tenants are unaffected.
    pub async fn lock_tenant(&self, tenant_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks
                .entry(tenant_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Hash of the tenant's most recent entry, or the genesis value.
    pub async fn latest_hash(&self, tenant_id: &str) -> Result<String> {
        let mut conn = self.db.pool().acquire().await?;
        Self::latest_hash_on(&mut conn, tenant_id).await
    }

    pub async fn latest_hash_on(conn: &mut SqliteConnection, tenant_id: &str) -> Result<String> {
        let row = sqlx::query(
            "SELECT entry_hash FROM ledger_entries WHERE tenant_id = ? ORDER BY seq DESC LIMIT 1",
        )
        .bind(tenant_id)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => Ok(row.try_get("entry_hash")?),
            None => Ok(GENESIS_HASH.to_string()),
        }
    }

    pub fn compute_hash(prev_hash: &str, payload: &Value) -> String {
        compute_entry_hash(prev_hash, payload)
    }

    /// Persist one entry with a hash pair the caller already computed.
    pub async fn append(&self, draft: &LedgerDraft, prev_hash: &str, entry_hash: &str) -> Result<LedgerEntry> {
        let mut conn = self.db.pool().acquire().await?;
        Self::append_on(&mut conn, draft, prev_hash, entry_hash).await
    }

    pub async fn append_on(
        conn: &mut SqliteConnection,
        draft: &LedgerDraft,
        prev_hash: &str,
        entry_hash: &str,
    ) -> Result<LedgerEntry> {
        let id = new_id();
        let created_at = utc_now();

        let result = sqlx::query(
            r#"
            INSERT INTO ledger_entries
                (id, tenant_id, actor_ref, event_type, object_type, object_id,
                 prev_hash, entry_hash, payload, request_fingerprint, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&draft.tenant_id)
        .bind(&draft.actor_ref)
        .bind(&draft.event_type)
        .bind(&draft.object_type)
        .bind(&draft.object_id)
        .bind(prev_hash)
        .bind(entry_hash)
        .bind(canonical_json(&draft.payload))
        .bind(&draft.request_fingerprint)
        .bind(canonical_timestamp(&created_at))
        .execute(&mut *conn)
        .await;

        let seq = match result {
            Ok(done) => done.last_insert_rowid(),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                error!(
                    "Refused ledger fork for tenant {}: prev_hash {} already claimed",
                    draft.tenant_id, prev_hash
                );
                return Err(LedgerError::StorageError(format!(
                    "Ledger fork refused for tenant {}: prev_hash {} already claimed",
                    draft.tenant_id, prev_hash
                )));
            }
            Err(e) => return Err(e.into()),
        };

        debug!(
            "Appended ledger entry: tenant={} event={} head={}",
            draft.tenant_id, draft.event_type, entry_hash
        );

        Ok(LedgerEntry {
            seq,
            id,
            tenant_id: draft.tenant_id.clone(),
            actor_ref: draft.actor_ref.clone(),
            event_type: draft.event_type.clone(),
            object_type: draft.object_type.clone(),
            object_id: draft.object_id.clone(),
            prev_hash: prev_hash.to_string(),
            entry_hash: entry_hash.to_string(),
            payload: draft.payload.clone(),
            request_fingerprint: draft.request_fingerprint.clone(),
            created_at,
        })
    }

    /// Read the head, hash `draft` onto it and append, all on the caller's
    /// connection (normally inside its transaction). The caller must hold
    /// [`lock_tenant`](Self::lock_tenant) for the draft's tenant.
    pub async fn chain_event(conn: &mut SqliteConnection, draft: &LedgerDraft) -> Result<LedgerEntry> {
        let prev_hash = Self::latest_hash_on(conn, &draft.tenant_id).await?;
        let entry_hash = Self::compute_hash(&prev_hash, &draft.payload);
        Self::append_on(conn, draft, &prev_hash, &entry_hash).await
    }

    /// Chain a standalone event in its own transaction.
    pub async fn record(&self, draft: &LedgerDraft) -> Result<LedgerEntry> {
        let _chain = self.lock_tenant(&draft.tenant_id).await;
        let mut tx = self.db.begin().await?;
        let entry = Self::chain_event(&mut *tx, draft).await?;
        tx.commit().await?;
        Ok(entry)
    }

    /// Tenant-scoped entries, newest first.
    pub async fn list(&self, tenant_id: &str, filter: &LedgerFilter, page: Pagination) -> Result<Vec<LedgerEntry>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM ledger_entries WHERE tenant_id = ",
            ENTRY_COLUMNS
        ));
        qb.push_bind(tenant_id.to_string());

        if let Some(event_type) = &filter.event_type {
            qb.push(" AND event_type = ").push_bind(event_type.clone());
        }
        if let Some(object_type) = &filter.object_type {
            qb.push(" AND object_type = ").push_bind(object_type.clone());
        }
        if let Some(since) = &filter.since {
            qb.push(" AND created_at >= ").push_bind(canonical_timestamp(since));
        }
        if let Some(until) = &filter.until {
            qb.push(" AND created_at <= ").push_bind(canonical_timestamp(until));
        }

        qb.push(" ORDER BY seq DESC LIMIT ")
            .push_bind(page.limit())
            .push(" OFFSET ")
            .push_bind(page.offset());

        let rows = qb.build().fetch_all(self.db.pool()).await?;
        rows.iter().map(LedgerEntry::from_row).collect()
    }

    pub async fn get(&self, tenant_id: &str, entry_id: &str) -> Result<LedgerEntry> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries WHERE tenant_id = ? AND id = ?",
            ENTRY_COLUMNS
        ))
        .bind(tenant_id)
        .bind(entry_id)
        .fetch_optional(self.db.pool())
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("Ledger entry '{}' not found", entry_id)))?;

        LedgerEntry::from_row(&row)
    }

    /// Entries in canonical order: tenant ascending, then creation order.
    /// `None` reads every tenant.
    pub async fn entries_in_order(&self, tenant_id: Option<&str>) -> Result<Vec<LedgerEntry>> {
        let rows = match tenant_id {
            Some(tenant_id) => {
                sqlx::query(&format!(
                    "SELECT {} FROM ledger_entries WHERE tenant_id = ? ORDER BY seq ASC",
                    ENTRY_COLUMNS
                ))
                .bind(tenant_id)
                .fetch_all(self.db.pool())
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM ledger_entries ORDER BY tenant_id ASC, seq ASC",
                    ENTRY_COLUMNS
                ))
                .fetch_all(self.db.pool())
                .await?
            }
        };
        rows.iter().map(LedgerEntry::from_row).collect()
    }

    /// Most recent entry recorded with `fingerprint` as its request digest.
    /// `tenant_id = None` searches every tenant.
    pub async fn find_by_fingerprint(&self, tenant_id: Option<&str>, fingerprint: &str) -> Result<Option<LedgerEntry>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM ledger_entries WHERE request_fingerprint = ",
            ENTRY_COLUMNS
        ));
        qb.push_bind(fingerprint.to_string());
        if let Some(tenant_id) = tenant_id {
            qb.push(" AND tenant_id = ").push_bind(tenant_id.to_string());
        }
        qb.push(" ORDER BY seq DESC LIMIT 1");

        let row = qb.build().fetch_optional(self.db.pool()).await?;
        row.as_ref().map(LedgerEntry::from_row).transpose()
    }

    pub async fn tenants(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT tenant_id FROM ledger_entries ORDER BY tenant_id")
            .fetch_all(self.db.pool())
            .await?;
        rows.iter()
            .map(|row| row.try_get("tenant_id").map_err(LedgerError::from))
            .collect()
    }

    /// Replay `tenant_id`'s chain from genesis.
    pub async fn verify_tenant(&self, tenant_id: &str) -> Result<ChainReport> {
        let entries = self.entries_in_order(Some(tenant_id)).await?;
        let report = verify_chain(&entries);
        if report.valid {
            info!(
                "Ledger for tenant {} verified: {} entries, head {}",
                tenant_id, report.entry_count, report.head_hash
            );
        }
        Ok(report)
    }

    /// Like [`verify_tenant`](Self::verify_tenant) but a broken chain is a
    /// `ChainCorruption` error.
    pub async fn ensure_intact(&self, tenant_id: &str) -> Result<ChainReport> {
        let report = self.verify_tenant(tenant_id).await?;
        if !report.valid {
            error!("Ledger corruption detected for tenant {}", tenant_id);
            return Err(LedgerError::ChainCorruption(format!(
                "Tenant {} chain broken at entry {}: {}",
                tenant_id,
                report.broken_at.unwrap_or_default(),
                report.error.clone().unwrap_or_default()
            )));
        }
        Ok(report)
    }
}
