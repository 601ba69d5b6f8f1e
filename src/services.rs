//! Service Wiring
//!
//! Builds every engine over one database handle. The service binary and
//! the integration tests share this composition.

use crate::audit::{AuditLedger, RequestDigestLog};
use crate::config::WebhookConfig;
use crate::consent::{ConsentEngine, PurposeRegistry};
use crate::crypto::{SignatureManager, TenantSecrets};
use crate::database::Database;
use crate::error::Result;
use crate::export::Exporter;
use crate::rights::RightsEngine;
use crate::webhooks::{delivery_channel, DeliveryReceiver, DeliveryWorker, WebhookDispatcher};

#[derive(Clone)]
pub struct Services {
    pub db: Database,
    pub ledger: AuditLedger,
    pub requests: RequestDigestLog,
    pub consent: ConsentEngine,
    pub rights: RightsEngine,
    pub dispatcher: WebhookDispatcher,
    pub exporter: Exporter,
    pub worker: DeliveryWorker,
}

impl Services {
    /// Wire the engines. The returned receiver feeds [`DeliveryWorker::spawn`].
    pub fn build(
        db: Database,
        secrets: TenantSecrets,
        signer: SignatureManager,
        webhooks: &WebhookConfig,
    ) -> Result<(Self, DeliveryReceiver)> {
        let (queue, receiver) = delivery_channel();

        let ledger = AuditLedger::new(db.clone());
        let requests = RequestDigestLog::new(db.clone(), secrets.clone());
        let dispatcher = WebhookDispatcher::new(db.clone(), secrets.clone(), queue);
        let registry = PurposeRegistry::new(db.clone());
        let consent = ConsentEngine::new(
            db.clone(),
            ledger.clone(),
            registry,
            secrets,
            dispatcher.clone(),
        );
        let rights = RightsEngine::new(db.clone(), ledger.clone(), dispatcher.clone());
        let exporter = Exporter::new(ledger.clone(), requests.clone(), signer);
        let worker = DeliveryWorker::new(dispatcher.clone(), webhooks)?;

        let services = Self {
            db,
            ledger,
            requests,
            consent,
            rights,
            dispatcher,
            exporter,
            worker,
        };
        Ok((services, receiver))
    }

    pub fn registry(&self) -> &PurposeRegistry {
        self.consent.registry()
    }
}
