//! Webhook Dispatcher
//!
//! Endpoint management and fan-out. Enqueue writes one PENDING delivery per
//! active endpoint and hands its id to the delivery queue; sending happens
//! on the worker.

use serde_json::Value;
use sqlx::QueryBuilder;
use sqlx::Sqlite;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::actor::TenantContext;
use crate::crypto::hashing::{canonical_json, canonical_timestamp, utc_now};
use crate::crypto::tenant_keys::TenantSecrets;
use crate::database::{Database, Pagination};
use crate::error::{LedgerError, Result};
use crate::ids::new_id;
use crate::webhooks::signing::truncate_error;
use crate::webhooks::types::{DeliveryStatus, EndpointRecord, WebhookDelivery, WebhookEndpoint};

const DELIVERY_COLUMNS: &str = "id, tenant_id, endpoint_id, event_type, payload, status, attempt_count, \
     last_attempt_at, response_code, error_message, created_at";

pub type DeliveryReceiver = mpsc::UnboundedReceiver<String>;

/// Producer side of the delivery queue. Carries delivery ids only.
#[derive(Clone)]
pub struct DeliveryQueue {
    sender: mpsc::UnboundedSender<String>,
}

impl DeliveryQueue {
    pub fn push(&self, delivery_id: &str) -> Result<()> {
        self.sender
            .send(delivery_id.to_string())
            .map_err(|_| LedgerError::DeliveryError("Delivery queue is closed".to_string()))
    }
}

pub fn delivery_channel() -> (DeliveryQueue, DeliveryReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (DeliveryQueue { sender }, receiver)
}

fn validate_url(url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| LedgerError::ValidationError(format!("Invalid webhook URL: {}", e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(LedgerError::ValidationError(format!(
            "Webhook URL scheme must be http or https, got {}",
            scheme
        ))),
    }
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    db: Database,
    secrets: TenantSecrets,
    queue: DeliveryQueue,
}

impl WebhookDispatcher {
    pub fn new(db: Database, secrets: TenantSecrets, queue: DeliveryQueue) -> Self {
        Self { db, secrets, queue }
    }

    pub async fn create_endpoint(&self, ctx: &TenantContext, url: &str, secret: &str) -> Result<WebhookEndpoint> {
        validate_url(url)?;
        if secret.is_empty() {
            return Err(LedgerError::ValidationError("Webhook secret must not be empty".to_string()));
        }

        let encrypted_secret = self.secrets.field_cipher(&ctx.tenant_id)?.encrypt(secret)?;
        let created_at = utc_now();

        let result = sqlx::query(
            "INSERT INTO webhook_endpoints (tenant_id, url, encrypted_secret, active, created_at) VALUES (?, ?, ?, 1, ?)",
        )
        .bind(&ctx.tenant_id)
        .bind(url)
        .bind(&encrypted_secret)
        .bind(canonical_timestamp(&created_at))
        .execute(self.db.pool())
        .await?;

        info!("Registered webhook endpoint {} for tenant {}", url, ctx.tenant_id);

        Ok(WebhookEndpoint {
            id: result.last_insert_rowid(),
            tenant_id: ctx.tenant_id.clone(),
            url: url.to_string(),
            active: true,
            created_at,
        })
    }

    pub async fn list_endpoints(&self, ctx: &TenantContext) -> Result<Vec<WebhookEndpoint>> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, url, active, created_at FROM webhook_endpoints WHERE tenant_id = ? ORDER BY id",
        )
        .bind(&ctx.tenant_id)
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(WebhookEndpoint::from_row).collect()
    }

    pub async fn set_endpoint_active(&self, ctx: &TenantContext, endpoint_id: i64, active: bool) -> Result<WebhookEndpoint> {
        let result = sqlx::query("UPDATE webhook_endpoints SET active = ? WHERE id = ? AND tenant_id = ?")
            .bind(active)
            .bind(endpoint_id)
            .bind(&ctx.tenant_id)
            .execute(self.db.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("Webhook endpoint {} not found", endpoint_id)));
        }

        let record = self
            .endpoint_record(endpoint_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Webhook endpoint {} not found", endpoint_id)))?;
        Ok(record.endpoint)
    }

    /// Create a PENDING delivery for every active endpoint of the tenant and
    /// queue them. Returns the new delivery ids.
    pub async fn enqueue(&self, tenant_id: &str, event_type: &str, payload: &Value) -> Result<Vec<String>> {
        let endpoint_ids: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM webhook_endpoints WHERE tenant_id = ? AND active = 1 ORDER BY id")
                .bind(tenant_id)
                .fetch_all(self.db.pool())
                .await?;

        if endpoint_ids.is_empty() {
            debug!("No active webhook endpoints for tenant {}", tenant_id);
            return Ok(Vec::new());
        }

        let body = canonical_json(payload);
        let created_at = canonical_timestamp(&utc_now());
        let mut delivery_ids = Vec::with_capacity(endpoint_ids.len());

        for endpoint_id in endpoint_ids {
            let delivery_id = new_id();
            sqlx::query(
                r#"
                INSERT INTO webhook_deliveries
                    (id, tenant_id, endpoint_id, event_type, payload, status, attempt_count, created_at)
                VALUES (?, ?, ?, ?, ?, 'pending', 0, ?)
                "#,
            )
            .bind(&delivery_id)
            .bind(tenant_id)
            .bind(endpoint_id)
            .bind(event_type)
            .bind(&body)
            .bind(&created_at)
            .execute(self.db.pool())
            .await?;
            delivery_ids.push(delivery_id);
        }

        // Rows that miss the queue stay pending for requeue_pending.
        for delivery_id in &delivery_ids {
            if let Err(e) = self.queue.push(delivery_id) {
                warn!("Delivery {} not queued: {}", delivery_id, e);
            }
        }

        info!(
            "Enqueued {} for tenant {} to {} endpoint(s)",
            event_type,
            tenant_id,
            delivery_ids.len()
        );
        Ok(delivery_ids)
    }

    /// Enqueue without letting a failure reach the caller. Used after a
    /// state change has committed.
    pub async fn fan_out(&self, tenant_id: &str, event_type: &str, payload: &Value) {
        if let Err(e) = self.enqueue(tenant_id, event_type, payload).await {
            error!("Webhook fan-out of {} for tenant {} failed: {}", event_type, tenant_id, e);
        }
    }

    /// Reset a delivery to PENDING with a fresh attempt budget and queue it.
    pub async fn replay(&self, ctx: &TenantContext, delivery_id: &str) -> Result<WebhookDelivery> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = 'pending', attempt_count = 0, response_code = NULL, error_message = NULL
            WHERE id = ? AND tenant_id = ?
            "#,
        )
        .bind(delivery_id)
        .bind(&ctx.tenant_id)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::delivery_not_found(delivery_id));
        }

        self.queue.push(delivery_id)?;
        info!("Replaying delivery {} for tenant {} ({})", delivery_id, ctx.tenant_id, ctx.actor_ref());
        self.get_delivery(ctx, delivery_id).await
    }

    pub async fn get_delivery(&self, ctx: &TenantContext, delivery_id: &str) -> Result<WebhookDelivery> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM webhook_deliveries WHERE id = ? AND tenant_id = ?",
            DELIVERY_COLUMNS
        ))
        .bind(delivery_id)
        .bind(&ctx.tenant_id)
        .fetch_optional(self.db.pool())
        .await?
        .ok_or_else(|| LedgerError::delivery_not_found(delivery_id))?;

        WebhookDelivery::from_row(&row)
    }

    /// Tenant deliveries, newest first.
    pub async fn list_deliveries(
        &self,
        ctx: &TenantContext,
        status: Option<DeliveryStatus>,
        page: Pagination,
    ) -> Result<Vec<WebhookDelivery>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM webhook_deliveries WHERE tenant_id = ",
            DELIVERY_COLUMNS
        ));
        qb.push_bind(ctx.tenant_id.clone());
        if let Some(status) = status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        qb.push(" ORDER BY id DESC LIMIT ")
            .push_bind(page.limit())
            .push(" OFFSET ")
            .push_bind(page.offset());

        let rows = qb.build().fetch_all(self.db.pool()).await?;
        rows.iter().map(WebhookDelivery::from_row).collect()
    }

    /// Queue every delivery still PENDING, e.g. after a restart lost the
    /// in-memory queue. Receivers may see a duplicate.
    pub async fn requeue_pending(&self) -> Result<usize> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM webhook_deliveries WHERE status = 'pending' ORDER BY id")
                .fetch_all(self.db.pool())
                .await?;
        for id in &ids {
            self.queue.push(id)?;
        }
        if !ids.is_empty() {
            info!("Requeued {} pending webhook deliveries", ids.len());
        }
        Ok(ids.len())
    }

    pub(crate) fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    pub(crate) fn secrets(&self) -> &TenantSecrets {
        &self.secrets
    }

    pub(crate) async fn delivery(&self, delivery_id: &str) -> Result<Option<WebhookDelivery>> {
        let row = sqlx::query(&format!("SELECT {} FROM webhook_deliveries WHERE id = ?", DELIVERY_COLUMNS))
            .bind(delivery_id)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(WebhookDelivery::from_row).transpose()
    }

    pub(crate) async fn endpoint_record(&self, endpoint_id: i64) -> Result<Option<EndpointRecord>> {
        let row = sqlx::query(
            "SELECT id, tenant_id, url, encrypted_secret, active, created_at FROM webhook_endpoints WHERE id = ?",
        )
        .bind(endpoint_id)
        .fetch_optional(self.db.pool())
        .await?;
        row.as_ref().map(EndpointRecord::from_row).transpose()
    }

    /// Take one attempt from the delivery's budget before sending. Returns
    /// the claimed row, or `None` when the delivery is already sent or its
    /// budget is spent. The check and the increment are one statement, so
    /// concurrent workers can never exceed `max_attempts` between them.
    pub(crate) async fn claim_attempt(&self, delivery_id: &str, max_attempts: u32) -> Result<Option<WebhookDelivery>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE webhook_deliveries
            SET attempt_count = attempt_count + 1, last_attempt_at = ?
            WHERE id = ? AND status != 'sent' AND attempt_count < ?
            RETURNING {}
            "#,
            DELIVERY_COLUMNS
        ))
        .bind(canonical_timestamp(&utc_now()))
        .bind(delivery_id)
        .bind(i64::from(max_attempts))
        .fetch_optional(self.db.pool())
        .await?;
        row.as_ref().map(WebhookDelivery::from_row).transpose()
    }

    pub(crate) async fn mark_sent(&self, delivery_id: &str, response_code: u16) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = 'sent', response_code = ?, error_message = NULL
            WHERE id = ?
            "#,
        )
        .bind(i64::from(response_code))
        .bind(delivery_id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Record a failure. Attempts are counted by `claim_attempt`, never here.
    /// A delivery already marked sent stays sent.
    pub(crate) async fn mark_failed(&self, delivery_id: &str, response_code: Option<u16>, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = 'failed', response_code = ?, error_message = ?
            WHERE id = ? AND status != 'sent'
            "#,
        )
        .bind(response_code.map(i64::from))
        .bind(truncate_error(message))
        .bind(delivery_id)
        .execute(self.db.pool())
        .await?;

        warn!("Delivery {} failed: {}", delivery_id, truncate_error(message));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{Actor, Role};
    use serde_json::json;

    async fn dispatcher() -> (WebhookDispatcher, DeliveryReceiver) {
        let db = Database::new_in_memory().await.unwrap();
        let (queue, receiver) = delivery_channel();
        let secrets = TenantSecrets::new("test-master").unwrap();
        (WebhookDispatcher::new(db, secrets, queue), receiver)
    }

    fn ctx(tenant: &str) -> TenantContext {
        TenantContext::new(tenant, Actor::ApiKey("k1".into()), Role::Admin)
    }

    #[tokio::test]
    async fn test_endpoint_url_must_be_http() {
        let (dispatcher, _rx) = dispatcher().await;
        let result = dispatcher.create_endpoint(&ctx("acme"), "ftp://example.com/hook", "s").await;
        assert!(matches!(result, Err(LedgerError::ValidationError(_))));
        assert!(dispatcher.create_endpoint(&ctx("acme"), "not a url", "s").await.is_err());
    }

    #[tokio::test]
    async fn test_enqueue_creates_delivery_per_active_endpoint() {
        let (dispatcher, mut rx) = dispatcher().await;
        let a = dispatcher.create_endpoint(&ctx("acme"), "https://a.example/hook", "s1").await.unwrap();
        dispatcher.create_endpoint(&ctx("acme"), "https://b.example/hook", "s2").await.unwrap();
        dispatcher.create_endpoint(&ctx("globex"), "https://c.example/hook", "s3").await.unwrap();
        dispatcher.set_endpoint_active(&ctx("acme"), a.id, false).await.unwrap();

        let ids = dispatcher
            .enqueue("acme", "consent.granted", &json!({"event_type": "consent.granted"}))
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(rx.recv().await.unwrap(), ids[0]);

        let delivery = dispatcher.get_delivery(&ctx("acme"), &ids[0]).await.unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Pending);
        assert_eq!(delivery.attempt_count, 0);
        assert!(dispatcher.get_delivery(&ctx("globex"), &ids[0]).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_queue_still_records_every_delivery() {
        let (dispatcher, rx) = dispatcher().await;
        dispatcher.create_endpoint(&ctx("acme"), "https://a.example/hook", "s1").await.unwrap();
        dispatcher.create_endpoint(&ctx("acme"), "https://b.example/hook", "s2").await.unwrap();
        drop(rx);

        let ids = dispatcher.enqueue("acme", "consent.granted", &json!({})).await.unwrap();
        assert_eq!(ids.len(), 2);
        let pending = dispatcher
            .list_deliveries(&ctx("acme"), Some(DeliveryStatus::Pending), Pagination::default())
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn test_enqueue_without_endpoints_is_noop() {
        let (dispatcher, _rx) = dispatcher().await;
        let ids = dispatcher.enqueue("acme", "right.opened", &json!({})).await.unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn test_replay_resets_budget() {
        let (dispatcher, mut rx) = dispatcher().await;
        dispatcher.create_endpoint(&ctx("acme"), "https://a.example/hook", "s1").await.unwrap();
        let ids = dispatcher.enqueue("acme", "consent.granted", &json!({})).await.unwrap();
        rx.recv().await.unwrap();

        for _ in 0..6 {
            assert!(dispatcher.claim_attempt(&ids[0], 6).await.unwrap().is_some());
            dispatcher.mark_failed(&ids[0], Some(500), "HTTP 500").await.unwrap();
        }
        assert!(dispatcher.claim_attempt(&ids[0], 6).await.unwrap().is_none());
        let failed = dispatcher.get_delivery(&ctx("acme"), &ids[0]).await.unwrap();
        assert_eq!(failed.attempt_count, 6);
        assert_eq!(failed.status, DeliveryStatus::Failed);

        let replayed = dispatcher.replay(&ctx("acme"), &ids[0]).await.unwrap();
        assert_eq!(replayed.status, DeliveryStatus::Pending);
        assert_eq!(replayed.attempt_count, 0);
        assert_eq!(rx.recv().await.unwrap(), ids[0]);

        assert!(matches!(
            dispatcher.replay(&ctx("globex"), &ids[0]).await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_deliveries_filters_by_status() {
        let (dispatcher, _rx) = dispatcher().await;
        dispatcher.create_endpoint(&ctx("acme"), "https://a.example/hook", "s1").await.unwrap();
        let first = dispatcher.enqueue("acme", "consent.granted", &json!({})).await.unwrap();
        dispatcher.enqueue("acme", "consent.withdrawn", &json!({})).await.unwrap();
        dispatcher.mark_sent(&first[0], 200).await.unwrap();
        assert!(dispatcher.claim_attempt(&first[0], 6).await.unwrap().is_none());

        let pending = dispatcher
            .list_deliveries(&ctx("acme"), Some(DeliveryStatus::Pending), Pagination::default())
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_type, "consent.withdrawn");

        let all = dispatcher.list_deliveries(&ctx("acme"), None, Pagination::default()).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
