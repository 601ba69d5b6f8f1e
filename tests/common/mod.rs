#![allow(dead_code)]

use consent_ledger::actor::{Actor, Role, TenantContext};
use consent_ledger::config::WebhookConfig;
use consent_ledger::consent::{ConsentMethod, ConsentRequest, ConsentStatus};
use consent_ledger::crypto::{SignatureManager, TenantSecrets};
use consent_ledger::database::Database;
use consent_ledger::webhooks::DeliveryReceiver;
use consent_ledger::Services;

pub const TEST_MASTER_KEY: &str = "integration-test-master-key";

/// Setup an in-memory SQLite database for testing
pub async fn setup_test_db() -> Database {
    Database::new_in_memory().await.expect("Failed to create test database")
}

/// Every engine over a fresh database. Keep the receiver alive for as long
/// as deliveries may be queued.
pub async fn setup_services() -> (Services, DeliveryReceiver) {
    setup_services_with(&WebhookConfig::default()).await
}

pub async fn setup_services_with(webhooks: &WebhookConfig) -> (Services, DeliveryReceiver) {
    let db = setup_test_db().await;
    let secrets = TenantSecrets::new(TEST_MASTER_KEY).expect("Failed to derive secrets");
    Services::build(db, secrets, SignatureManager::generate(), webhooks).expect("Failed to wire services")
}

pub fn manager_ctx(tenant: &str) -> TenantContext {
    TenantContext::new(tenant, Actor::ApiKey(format!("{}-key", tenant)), Role::Manager)
}

pub fn platform_ctx(tenant: &str) -> TenantContext {
    TenantContext::new(tenant, Actor::User("root".to_string()), Role::Superadmin)
}

/// Register the purposes used across the tests.
pub async fn seed_purposes(services: &Services, ctx: &TenantContext) {
    for code in ["marketing", "analytics"] {
        services
            .registry()
            .create_purpose(ctx, code, Some("test purpose"))
            .await
            .expect("Failed to create purpose");
    }
}

pub fn grant(user: &str, purpose: &str) -> ConsentRequest {
    ConsentRequest::new(user, purpose, ConsentStatus::Granted, ConsentMethod::Checkbox)
}

pub fn withdraw(user: &str, purpose: &str) -> ConsentRequest {
    ConsentRequest::new(user, purpose, ConsentStatus::Withdrawn, ConsentMethod::Checkbox)
}
