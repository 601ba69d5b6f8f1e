//! Rights Engine
//!
//! Data-subject requests (access, erasure, portability) and their lifecycle.
//! Every transition is chained into the tenant's ledger in the same
//! transaction as the row change, and announced to webhook subscribers once
//! committed.

use serde_json::{json, Value};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{info, warn};

use crate::actor::TenantContext;
use crate::audit::{AuditLedger, LedgerDraft};
use crate::crypto::hashing::{canonical_timestamp, utc_now};
use crate::database::{Database, Pagination};
use crate::error::{LedgerError, Result};
use crate::ids::new_id;
use crate::rights::types::{RequestStatus, RightType, RightsFilter, RightsRequest};
use crate::webhooks::WebhookDispatcher;

const RIGHTS_REQUEST_OBJECT: &str = "rights_request";

#[derive(Clone)]
pub struct RightsEngine {
    db: Database,
    ledger: AuditLedger,
    dispatcher: WebhookDispatcher,
}

impl RightsEngine {
    pub fn new(db: Database, ledger: AuditLedger, dispatcher: WebhookDispatcher) -> Self {
        Self { db, ledger, dispatcher }
    }

    /// Open a new request in state `open`.
    pub async fn open(
        &self,
        ctx: &TenantContext,
        external_user_id: &str,
        right: RightType,
        reason: Option<&str>,
        request_fingerprint: Option<String>,
    ) -> Result<RightsRequest> {
        if external_user_id.trim().is_empty() {
            return Err(LedgerError::ValidationError(
                "external_user_id must not be empty".to_string(),
            ));
        }

        let tenant_id = ctx.tenant_id.as_str();
        let event_type = RequestStatus::Open.event_type();

        let chain_guard = self.ledger.lock_tenant(tenant_id).await;
        let timestamp = canonical_timestamp(&utc_now());
        let request_id = new_id();
        let mut tx = self.db.begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO rights_requests
                (id, tenant_id, external_user_id, right_type, status, opened_at, reason)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&request_id)
        .bind(tenant_id)
        .bind(external_user_id)
        .bind(right.as_str())
        .bind(RequestStatus::Open.as_str())
        .bind(&timestamp)
        .bind(reason)
        .fetch_one(&mut *tx)
        .await?;
        let request = RightsRequest::from_row(&row)?;

        let payload = json!({
            "id": request.id,
            "tenant_id": tenant_id,
            "external_user_id": external_user_id,
            "right": right.as_str(),
            "status": RequestStatus::Open.as_str(),
            "reason": reason,
            "timestamp": timestamp,
        });
        let draft = LedgerDraft::new(tenant_id, event_type, RIGHTS_REQUEST_OBJECT, &request.id, payload)
            .with_actor(ctx.actor_ref())
            .with_fingerprint(request_fingerprint);
        AuditLedger::chain_event(&mut *tx, &draft).await?;

        tx.commit().await?;
        drop(chain_guard);

        info!(
            "Opened {} request {} for tenant {}",
            right.as_str(),
            request.id,
            tenant_id
        );

        self.dispatcher
            .fan_out(
                tenant_id,
                event_type,
                &json!({
                    "event_type": event_type,
                    "request_id": request.id,
                    "external_user_id": external_user_id,
                    "right": right.as_str(),
                    "timestamp": timestamp,
                }),
            )
            .await;

        Ok(request)
    }

    /// `open` → `in_progress`.
    pub async fn start(&self, ctx: &TenantContext, request_id: &str) -> Result<RightsRequest> {
        self.transition(ctx, request_id, RequestStatus::InProgress, None, None)
            .await
    }

    /// Close the request as fulfilled, attaching the evidence reference.
    pub async fn complete(
        &self,
        ctx: &TenantContext,
        request_id: &str,
        evidence_ref: Option<&str>,
    ) -> Result<RightsRequest> {
        self.transition(ctx, request_id, RequestStatus::Completed, evidence_ref, None)
            .await
    }

    pub async fn reject(&self, ctx: &TenantContext, request_id: &str, reason: &str) -> Result<RightsRequest> {
        if reason.trim().is_empty() {
            return Err(LedgerError::ValidationError(
                "A rejection reason is required".to_string(),
            ));
        }
        self.transition(ctx, request_id, RequestStatus::Rejected, None, Some(reason))
            .await
    }

    async fn transition(
        &self,
        ctx: &TenantContext,
        request_id: &str,
        to: RequestStatus,
        evidence_ref: Option<&str>,
        reason: Option<&str>,
    ) -> Result<RightsRequest> {
        let tenant_id = ctx.tenant_id.as_str();
        let event_type = to.event_type();

        let chain_guard = self.ledger.lock_tenant(tenant_id).await;
        let timestamp = canonical_timestamp(&utc_now());
        let mut tx = self.db.begin().await?;

        // Conditional update: only rows still in an allowed source state move.
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE rights_requests SET status = ");
        qb.push_bind(to.as_str());
        if to.is_terminal() {
            qb.push(", closed_at = ").push_bind(timestamp.clone());
        }
        if let Some(evidence_ref) = evidence_ref {
            qb.push(", evidence_ref = ").push_bind(evidence_ref.to_string());
        }
        if let Some(reason) = reason {
            qb.push(", reason = ").push_bind(reason.to_string());
        }
        qb.push(" WHERE id = ")
            .push_bind(request_id.to_string())
            .push(" AND tenant_id = ")
            .push_bind(tenant_id.to_string())
            .push(" AND status IN (");
        let mut sources = qb.separated(", ");
        for source in to.allowed_sources() {
            sources.push_bind(source.as_str());
        }
        sources.push_unseparated(") RETURNING *");

        let updated = qb.build().fetch_optional(&mut *tx).await?;
        let request = match updated {
            Some(row) => RightsRequest::from_row(&row)?,
            None => {
                let current = sqlx::query("SELECT status FROM rights_requests WHERE id = ? AND tenant_id = ?")
                    .bind(request_id)
                    .bind(tenant_id)
                    .fetch_optional(&mut *tx)
                    .await?;
                tx.rollback().await?;
                return Err(match current {
                    Some(row) => {
                        let from: String = row.try_get("status")?;
                        warn!(
                            "Refused rights transition {} -> {} for request {}",
                            from,
                            to.as_str(),
                            request_id
                        );
                        LedgerError::invalid_transition(&from, to.as_str())
                    }
                    None => LedgerError::request_not_found(request_id),
                });
            }
        };

        let payload = json!({
            "id": request.id,
            "tenant_id": tenant_id,
            "status": to.as_str(),
            "evidence_ref": request.evidence_ref,
            "reason": request.reason,
            "timestamp": timestamp,
        });
        let draft = LedgerDraft::new(tenant_id, event_type, RIGHTS_REQUEST_OBJECT, &request.id, payload)
            .with_actor(ctx.actor_ref());
        AuditLedger::chain_event(&mut *tx, &draft).await?;

        tx.commit().await?;
        drop(chain_guard);

        info!("Rights request {} is now {}", request.id, to.as_str());

        self.dispatcher
            .fan_out(tenant_id, event_type, &transition_webhook(event_type, &request, &timestamp))
            .await;

        Ok(request)
    }

    pub async fn get(&self, ctx: &TenantContext, request_id: &str) -> Result<RightsRequest> {
        let row = sqlx::query("SELECT * FROM rights_requests WHERE id = ? AND tenant_id = ?")
            .bind(request_id)
            .bind(&ctx.tenant_id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| LedgerError::request_not_found(request_id))?;

        RightsRequest::from_row(&row)
    }

    /// Requests, most recently opened first.
    pub async fn list(&self, ctx: &TenantContext, filter: &RightsFilter, page: Pagination) -> Result<Vec<RightsRequest>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM rights_requests WHERE tenant_id = ");
        qb.push_bind(ctx.tenant_id.clone());
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(right) = filter.right {
            qb.push(" AND right_type = ").push_bind(right.as_str());
        }
        qb.push(" ORDER BY opened_at DESC, id DESC LIMIT ")
            .push_bind(page.limit())
            .push(" OFFSET ")
            .push_bind(page.offset());

        let rows = qb.build().fetch_all(self.db.pool()).await?;
        rows.iter().map(RightsRequest::from_row).collect()
    }
}

fn transition_webhook(event_type: &str, request: &RightsRequest, timestamp: &str) -> Value {
    json!({
        "event_type": event_type,
        "request_id": request.id,
        "external_user_id": request.external_user_id,
        "right": request.right.as_str(),
        "status": request.status.as_str(),
        "evidence_ref": request.evidence_ref,
        "timestamp": timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{Actor, Role};
    use crate::audit::LedgerFilter;
    use crate::crypto::tenant_keys::TenantSecrets;
    use crate::webhooks::delivery_channel;

    async fn engine() -> (RightsEngine, AuditLedger) {
        let db = Database::new_in_memory().await.unwrap();
        let ledger = AuditLedger::new(db.clone());
        let (queue, _receiver) = delivery_channel();
        let dispatcher = WebhookDispatcher::new(db.clone(), TenantSecrets::new("test-key").unwrap(), queue);
        (RightsEngine::new(db, ledger.clone(), dispatcher), ledger)
    }

    fn ctx(tenant: &str) -> TenantContext {
        TenantContext::new(tenant, Actor::User("dpo".into()), Role::Manager)
    }

    #[tokio::test]
    async fn test_open_then_complete() {
        let (engine, ledger) = engine().await;
        let ctx = ctx("acme");

        let opened = engine.open(&ctx, "U1", RightType::Erasure, None, None).await.unwrap();
        assert_eq!(opened.status, RequestStatus::Open);
        assert!(opened.closed_at.is_none());

        let done = engine.complete(&ctx, &opened.id, Some("ticket-42")).await.unwrap();
        assert_eq!(done.status, RequestStatus::Completed);
        assert_eq!(done.evidence_ref.as_deref(), Some("ticket-42"));
        assert!(done.closed_at.is_some());

        let entries = ledger.list("acme", &LedgerFilter::default(), Pagination::default()).await.unwrap();
        let events: Vec<&str> = entries.iter().rev().map(|e| e.event_type.as_str()).collect();
        assert_eq!(events, vec!["right.opened", "right.completed"]);
        assert!(entries.iter().all(|e| e.actor_ref.as_deref() == Some("user:dpo")));
        assert!(ledger.verify_tenant("acme").await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_terminal_requests_refuse_transitions() {
        let (engine, ledger) = engine().await;
        let ctx = ctx("acme");
        let opened = engine.open(&ctx, "U1", RightType::Access, None, None).await.unwrap();
        engine.reject(&ctx, &opened.id, "identity not verified").await.unwrap();

        let again = engine.complete(&ctx, &opened.id, None).await;
        assert!(matches!(again, Err(LedgerError::ValidationError(_))));
        let restart = engine.start(&ctx, &opened.id).await;
        assert!(matches!(restart, Err(LedgerError::ValidationError(_))));

        // Refused transitions leave no ledger trace.
        let entries = ledger.list("acme", &LedgerFilter::default(), Pagination::default()).await.unwrap();
        assert_eq!(entries.len(), 2);

        let stored = engine.get(&ctx, &opened.id).await.unwrap();
        assert_eq!(stored.status, RequestStatus::Rejected);
        assert_eq!(stored.reason.as_deref(), Some("identity not verified"));
    }

    #[tokio::test]
    async fn test_start_only_from_open() {
        let (engine, _) = engine().await;
        let ctx = ctx("acme");
        let opened = engine.open(&ctx, "U1", RightType::Portability, None, None).await.unwrap();

        let started = engine.start(&ctx, &opened.id).await.unwrap();
        assert_eq!(started.status, RequestStatus::InProgress);
        assert!(matches!(engine.start(&ctx, &opened.id).await, Err(LedgerError::ValidationError(_))));

        let done = engine.complete(&ctx, &opened.id, None).await.unwrap();
        assert_eq!(done.status, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn test_other_tenant_sees_not_found() {
        let (engine, _) = engine().await;
        let opened = engine.open(&ctx("acme"), "U1", RightType::Erasure, None, None).await.unwrap();

        let result = engine.complete(&ctx("globex"), &opened.id, None).await;
        assert!(matches!(result, Err(LedgerError::NotFound(_))));
        assert!(matches!(engine.get(&ctx("globex"), &opened.id).await, Err(LedgerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let (engine, _) = engine().await;
        let ctx = ctx("acme");
        let a = engine.open(&ctx, "U1", RightType::Erasure, None, None).await.unwrap();
        engine.open(&ctx, "U2", RightType::Access, None, None).await.unwrap();
        engine.complete(&ctx, &a.id, None).await.unwrap();

        let open = engine
            .list(&ctx, &RightsFilter { status: Some(RequestStatus::Open), right: None }, Pagination::default())
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].external_user_id, "U2");

        let erasures = engine
            .list(&ctx, &RightsFilter { status: None, right: Some(RightType::Erasure) }, Pagination::default())
            .await
            .unwrap();
        assert_eq!(erasures.len(), 1);
        assert_eq!(erasures[0].id, a.id);
    }

    #[tokio::test]
    async fn test_reject_requires_reason() {
        let (engine, _) = engine().await;
        let ctx = ctx("acme");
        let opened = engine.open(&ctx, "U1", RightType::Erasure, None, None).await.unwrap();
        assert!(matches!(engine.reject(&ctx, &opened.id, " ").await, Err(LedgerError::ValidationError(_))));
    }
}
