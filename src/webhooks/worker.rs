//! Webhook Delivery Worker
//!
//! Consumes delivery ids from the queue, signs and POSTs each payload, and
//! records the outcome on the delivery row. Delivery is at-least-once.

use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WebhookConfig;
use crate::crypto::hashing::canonical_json;
use crate::error::{LedgerError, Result};
use crate::webhooks::dispatcher::{DeliveryReceiver, WebhookDispatcher};
use crate::webhooks::signing::{
    sign_payload, EVENT_ID_HEADER, EVENT_TYPE_HEADER, SIGNATURE_HEADER, TENANT_HEADER, TIMESTAMP_HEADER,
};
use crate::webhooks::types::DeliveryStatus;

/// Seconds to wait after the 1st, 2nd, ... failed attempt.
pub const BACKOFF_SECS: [u64; 5] = [60, 300, 1800, 7200, 21600];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Vec<Duration>,
    /// Re-enqueue failures automatically. Off means replay is the only retry.
    pub auto_retry: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            backoff: BACKOFF_SECS.iter().map(|s| Duration::from_secs(*s)).collect(),
            auto_retry: false,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &WebhookConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            auto_retry: config.auto_retry,
            ..Self::default()
        }
    }

    pub fn is_exhausted(&self, attempt_count: i64) -> bool {
        attempt_count >= i64::from(self.max_attempts)
    }

    /// Delay before the next attempt once `attempt_count` attempts have
    /// failed, or `None` when the budget is spent.
    pub fn delay_after(&self, attempt_count: i64) -> Option<Duration> {
        if attempt_count < 1 || self.is_exhausted(attempt_count) {
            return None;
        }
        let index = usize::try_from(attempt_count - 1).unwrap_or(usize::MAX);
        self.backoff.get(index).or_else(|| self.backoff.last()).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent { response_code: u16 },
    Failed { attempt_count: i64, retry_in: Option<Duration> },
    /// The attempt budget was already spent; nothing was sent.
    Exhausted,
    /// Endpoint deleted or deactivated; not retried.
    EndpointUnavailable,
    AlreadySent,
}

#[derive(Clone)]
pub struct DeliveryWorker {
    dispatcher: WebhookDispatcher,
    client: reqwest::Client,
    policy: RetryPolicy,
    concurrency: usize,
}

impl DeliveryWorker {
    pub fn new(dispatcher: WebhookDispatcher, config: &WebhookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| LedgerError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            dispatcher,
            client,
            policy: RetryPolicy::from_config(config),
            concurrency: config.concurrency.max(1),
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn spawn(self, receiver: DeliveryReceiver) -> JoinHandle<()> {
        tokio::spawn(self.run(receiver))
    }

    /// Process queued deliveries until every queue handle is dropped.
    pub async fn run(self, mut receiver: DeliveryReceiver) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        info!("Webhook delivery worker started ({} concurrent)", self.concurrency);

        while let Some(delivery_id) = receiver.recv().await {
            let permit = match permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let worker = self.clone();
            tokio::spawn(async move {
                if let Err(e) = worker.deliver(&delivery_id).await {
                    error!("Delivery {} errored: {}", delivery_id, e);
                }
                drop(permit);
            });
        }

        info!("Webhook delivery worker stopped");
    }

    /// Make one attempt at `delivery_id`.
    pub async fn deliver(&self, delivery_id: &str) -> Result<DeliveryOutcome> {
        let delivery = self
            .dispatcher
            .delivery(delivery_id)
            .await?
            .ok_or_else(|| LedgerError::delivery_not_found(delivery_id))?;

        if delivery.status == DeliveryStatus::Sent {
            debug!("Delivery {} already sent, skipping", delivery_id);
            return Ok(DeliveryOutcome::AlreadySent);
        }

        let record = match self.dispatcher.endpoint_record(delivery.endpoint_id).await? {
            Some(record) if record.endpoint.active => record,
            _ => {
                self.dispatcher
                    .mark_failed(delivery_id, None, "Endpoint not found or inactive")
                    .await?;
                return Ok(DeliveryOutcome::EndpointUnavailable);
            }
        };

        let secret = match self
            .dispatcher
            .secrets()
            .field_cipher(&delivery.tenant_id)
            .and_then(|cipher| cipher.decrypt(&record.encrypted_secret))
        {
            Ok(secret) => secret,
            Err(e) => {
                self.dispatcher
                    .mark_failed(delivery_id, None, "Endpoint secret could not be decrypted")
                    .await?;
                return Err(e);
            }
        };

        let claimed = match self.dispatcher.claim_attempt(delivery_id, self.policy.max_attempts).await? {
            Some(claimed) => claimed,
            None => return self.unclaimed(delivery_id).await,
        };

        let body = canonical_json(&claimed.payload);
        let timestamp = Utc::now().timestamp();
        let signature = sign_payload(&secret, body.as_bytes(), timestamp)?;

        let response = self
            .client
            .post(&record.endpoint.url)
            .header(CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(EVENT_TYPE_HEADER, &claimed.event_type)
            .header(EVENT_ID_HEADER, &claimed.id)
            .header(TENANT_HEADER, &claimed.tenant_id)
            .header(TIMESTAMP_HEADER, timestamp.to_string())
            .body(body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                let code = resp.status().as_u16();
                self.dispatcher.mark_sent(delivery_id, code).await?;
                info!(
                    "Delivered {} ({}) to {}: HTTP {}",
                    claimed.event_type, delivery_id, record.endpoint.url, code
                );
                Ok(DeliveryOutcome::Sent { response_code: code })
            }
            Ok(resp) => {
                let code = resp.status().as_u16();
                self.dispatcher
                    .mark_failed(delivery_id, Some(code), &format!("HTTP {}", code))
                    .await?;
                Ok(self.after_failure(delivery_id, claimed.attempt_count))
            }
            Err(e) => {
                self.dispatcher.mark_failed(delivery_id, None, &e.to_string()).await?;
                Ok(self.after_failure(delivery_id, claimed.attempt_count))
            }
        }
    }

    /// Outcome for a delivery whose attempt could not be claimed.
    async fn unclaimed(&self, delivery_id: &str) -> Result<DeliveryOutcome> {
        let current = self
            .dispatcher
            .delivery(delivery_id)
            .await?
            .ok_or_else(|| LedgerError::delivery_not_found(delivery_id))?;

        if current.status == DeliveryStatus::Sent {
            debug!("Delivery {} was sent by another attempt", delivery_id);
            return Ok(DeliveryOutcome::AlreadySent);
        }
        self.dispatcher
            .mark_failed(
                delivery_id,
                current.response_code.and_then(|code| u16::try_from(code).ok()),
                "Retry budget exhausted",
            )
            .await?;
        Ok(DeliveryOutcome::Exhausted)
    }

    fn after_failure(&self, delivery_id: &str, attempt_count: i64) -> DeliveryOutcome {
        let retry_in = self.policy.delay_after(attempt_count);

        match retry_in {
            Some(delay) if self.policy.auto_retry => {
                debug!("Retrying delivery {} in {:?}", delivery_id, delay);
                let queue = self.dispatcher.queue().clone();
                let delivery_id = delivery_id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = queue.push(&delivery_id) {
                        warn!("Could not requeue delivery {}: {}", delivery_id, e);
                    }
                });
            }
            Some(_) => debug!("Delivery {} awaits replay", delivery_id),
            None => warn!("Delivery {} exhausted its {} attempts", delivery_id, self.policy.max_attempts),
        }

        DeliveryOutcome::Failed { attempt_count, retry_in }
    }
}
