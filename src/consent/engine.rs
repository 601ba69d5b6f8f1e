//! Consent Engine
//!
//! Upserts the current-state aggregate and appends the twinned consent event
//! and ledger entry in one transaction, under the tenant's chain lock.
//! Subscribers are notified after commit.

use serde_json::json;
use sqlx::{QueryBuilder, Sqlite};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::actor::TenantContext;
use crate::audit::{AuditLedger, LedgerDraft};
use crate::consent::registry::PurposeRegistry;
use crate::consent::types::{
    AggregateFilter, ConsentAggregate, ConsentEvent, ConsentRequest, EventFilter,
};
use crate::crypto::hashing::{canonical_timestamp, utc_now};
use crate::crypto::tenant_keys::TenantSecrets;
use crate::database::{Database, Pagination};
use crate::error::{LedgerError, Result};
use crate::ids::new_id;
use crate::webhooks::WebhookDispatcher;

const CONSENT_EVENT_OBJECT: &str = "consent_event";

#[derive(Clone)]
pub struct ConsentEngine {
    db: Database,
    ledger: AuditLedger,
    registry: PurposeRegistry,
    secrets: TenantSecrets,
    dispatcher: WebhookDispatcher,
}

impl ConsentEngine {
    pub fn new(
        db: Database,
        ledger: AuditLedger,
        registry: PurposeRegistry,
        secrets: TenantSecrets,
        dispatcher: WebhookDispatcher,
    ) -> Self {
        Self {
            db,
            ledger,
            registry,
            secrets,
            dispatcher,
        }
    }

    pub fn registry(&self) -> &PurposeRegistry {
        &self.registry
    }

    /// Record a consent transition and return the updated aggregate.
    pub async fn record_consent(&self, ctx: &TenantContext, request: &ConsentRequest) -> Result<ConsentAggregate> {
        let tenant_id = ctx.tenant_id.as_str();
        let purpose = self.registry.active_purpose(tenant_id, &request.purpose_code).await?;

        let source_system_id = match &request.system_code {
            Some(code) => match self.registry.find_system(tenant_id, code).await? {
                Some(system) => Some(system.id),
                None => {
                    debug!("Unknown source system {} for tenant {}, leaving unset", code, tenant_id);
                    None
                }
            },
            None => None,
        };

        let encrypted_fields = match &request.encrypted_fields {
            Some(fields) if !fields.is_empty() => {
                let sealed = self.secrets.field_cipher(tenant_id)?.encrypt_fields(fields)?;
                Some(serde_json::to_string(&sealed)?)
            }
            _ => None,
        };
        let ip_hash = request
            .ip
            .as_deref()
            .map(|ip| self.secrets.hash_identifier(tenant_id, ip))
            .transpose()?;
        let user_agent_hash = request
            .user_agent
            .as_deref()
            .map(|ua| self.secrets.hash_identifier(tenant_id, ua))
            .transpose()?;

        let status = request.status.as_str();

        let chain_guard = self.ledger.lock_tenant(tenant_id).await;
        let timestamp = canonical_timestamp(&utc_now());
        let event_id = new_id();
        let mut tx = self.db.begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO consent_aggregates
                (tenant_id, external_user_id, purpose_id, status, last_event_at,
                 source_system_id, evidence_ref, encrypted_fields, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (tenant_id, external_user_id, purpose_id) DO UPDATE SET
                status = excluded.status,
                last_event_at = excluded.last_event_at,
                source_system_id = excluded.source_system_id,
                evidence_ref = excluded.evidence_ref,
                encrypted_fields = COALESCE(excluded.encrypted_fields, consent_aggregates.encrypted_fields)
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(&request.external_user_id)
        .bind(purpose.id)
        .bind(status)
        .bind(&timestamp)
        .bind(source_system_id)
        .bind(&request.evidence_ref)
        .bind(&encrypted_fields)
        .bind(&timestamp)
        .fetch_one(&mut *tx)
        .await?;
        let aggregate = ConsentAggregate::from_row(&row)?;

        let payload = json!({
            "id": event_id,
            "tenant_id": tenant_id,
            "aggregate_id": aggregate.id,
            "purpose_id": purpose.id,
            "status": status,
            "method": request.method.as_str(),
            "source": request.source,
            "timestamp": timestamp,
            "evidence_ref": request.evidence_ref,
        });
        let draft = LedgerDraft::new(tenant_id, request.status.event_type(), CONSENT_EVENT_OBJECT, &event_id, payload)
            .with_actor(ctx.actor_ref())
            .with_fingerprint(request.request_fingerprint.clone());
        let entry = AuditLedger::chain_event(&mut *tx, &draft).await?;

        sqlx::query(
            r#"
            INSERT INTO consent_events
                (id, tenant_id, aggregate_id, purpose_id, status, method, source,
                 ip_hash, user_agent_hash, timestamp, evidence_ref, prev_hash, event_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event_id)
        .bind(tenant_id)
        .bind(aggregate.id)
        .bind(purpose.id)
        .bind(status)
        .bind(request.method.as_str())
        .bind(&request.source)
        .bind(&ip_hash)
        .bind(&user_agent_hash)
        .bind(&timestamp)
        .bind(&request.evidence_ref)
        .bind(&entry.prev_hash)
        .bind(&entry.entry_hash)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        drop(chain_guard);

        info!(
            "Recorded {} for tenant {} purpose {} (event {})",
            entry.event_type, tenant_id, purpose.code, event_id
        );

        let event_type = request.status.event_type();
        self.dispatcher
            .fan_out(
                tenant_id,
                &event_type,
                &json!({
                    "event_type": event_type,
                    "consent_event_id": event_id,
                    "aggregate_id": aggregate.id,
                    "external_user_id": request.external_user_id,
                    "purpose_code": purpose.code,
                    "status": status,
                    "timestamp": timestamp,
                }),
            )
            .await;

        Ok(aggregate)
    }

    /// Current aggregate for (user, purpose).
    pub async fn latest(&self, ctx: &TenantContext, external_user_id: &str, purpose_code: &str) -> Result<ConsentAggregate> {
        let purpose = self
            .registry
            .purpose(&ctx.tenant_id, purpose_code)
            .await?
            .ok_or_else(|| LedgerError::purpose_not_found(purpose_code))?;

        let row = sqlx::query(
            "SELECT * FROM consent_aggregates WHERE tenant_id = ? AND external_user_id = ? AND purpose_id = ?",
        )
        .bind(&ctx.tenant_id)
        .bind(external_user_id)
        .bind(purpose.id)
        .fetch_optional(self.db.pool())
        .await?
        .ok_or_else(|| {
            LedgerError::NotFound(format!(
                "No consent recorded for user '{}' and purpose '{}'",
                external_user_id, purpose_code
            ))
        })?;

        ConsentAggregate::from_row(&row)
    }

    /// Aggregates, most recently changed first.
    pub async fn list_aggregates(
        &self,
        ctx: &TenantContext,
        filter: &AggregateFilter,
        page: Pagination,
    ) -> Result<Vec<ConsentAggregate>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM consent_aggregates WHERE tenant_id = ");
        qb.push_bind(ctx.tenant_id.clone());
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(user) = &filter.external_user_id {
            qb.push(" AND external_user_id = ").push_bind(user.clone());
        }
        qb.push(" ORDER BY last_event_at DESC, id DESC LIMIT ")
            .push_bind(page.limit())
            .push(" OFFSET ")
            .push_bind(page.offset());

        let rows = qb.build().fetch_all(self.db.pool()).await?;
        rows.iter().map(ConsentAggregate::from_row).collect()
    }

    /// Events, newest first.
    pub async fn list_events(&self, ctx: &TenantContext, filter: &EventFilter, page: Pagination) -> Result<Vec<ConsentEvent>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM consent_events WHERE tenant_id = ");
        qb.push_bind(ctx.tenant_id.clone());
        if let Some(aggregate_id) = filter.aggregate_id {
            qb.push(" AND aggregate_id = ").push_bind(aggregate_id);
        }
        if let Some(since) = &filter.since {
            qb.push(" AND timestamp >= ").push_bind(canonical_timestamp(since));
        }
        if let Some(until) = &filter.until {
            qb.push(" AND timestamp <= ").push_bind(canonical_timestamp(until));
        }
        qb.push(" ORDER BY id DESC LIMIT ")
            .push_bind(page.limit())
            .push(" OFFSET ")
            .push_bind(page.offset());

        let rows = qb.build().fetch_all(self.db.pool()).await?;
        rows.iter().map(ConsentEvent::from_row).collect()
    }

    /// Plaintext of an aggregate's encrypted fields. The aggregate must
    /// belong to the caller's tenant.
    pub fn decrypt_fields(&self, ctx: &TenantContext, aggregate: &ConsentAggregate) -> Result<BTreeMap<String, String>> {
        if aggregate.tenant_id != ctx.tenant_id {
            return Err(LedgerError::Forbidden(
                "Aggregate belongs to another tenant".to_string(),
            ));
        }
        match &aggregate.encrypted_fields {
            Some(sealed) => self.secrets.field_cipher(&ctx.tenant_id)?.decrypt_fields(sealed),
            None => Ok(BTreeMap::new()),
        }
    }
}
