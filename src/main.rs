use anyhow::Context;
use axum::{extract::State, response::Json, routing::get, Router};
use std::path::Path;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use consent_ledger::crypto::{load_signature_manager, TenantSecrets};
use consent_ledger::database::Database;
use consent_ledger::{AppConfig, Services};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "consent_ledger=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting consent ledger");

    let config = AppConfig::load().context("Failed to load configuration")?;
    info!("Configuration loaded");

    let database = Database::new(&config.database_url).await?;
    database.run_migrations().await?;

    let secrets = TenantSecrets::new(&config.master_encryption_key)?;
    let signer = load_signature_manager(Path::new(&config.signing.private_key_path)).with_context(|| {
        format!(
            "Failed to load export signing key from {} (generate one with ledger-keys)",
            config.signing.private_key_path
        )
    })?;

    let (services, receiver) = Services::build(database.clone(), secrets, signer, &config.webhooks)?;

    // Webhook delivery worker
    services.worker.clone().spawn(receiver);
    if let Err(e) = services.dispatcher.requeue_pending().await {
        error!("Failed to requeue pending deliveries: {}", e);
    }
    info!("Webhook delivery worker started");

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status_endpoint))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).into_inner())
        .with_state(services);

    let addr = config.bind_address();
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "consent-ledger",
        "timestamp": chrono::Utc::now()
    }))
}

async fn status_endpoint(State(services): State<Services>) -> Json<serde_json::Value> {
    let mut status = serde_json::json!({
        "status": "healthy",
        "service": "consent-ledger",
        "timestamp": chrono::Utc::now(),
        "export_public_key": services.exporter.public_key_base64(),
    });

    match services.db.stats().await {
        Ok(stats) => {
            status["database"] = serde_json::json!({
                "status": "healthy",
                "tenants": stats.tenants,
                "ledger_entries": stats.ledger_entries,
                "consent_aggregates": stats.consent_aggregates,
                "pending_deliveries": stats.pending_deliveries,
                "failed_deliveries": stats.failed_deliveries,
            });
        }
        Err(e) => {
            error!("Failed to read database stats: {}", e);
            status["database"] = serde_json::json!({ "status": "error" });
        }
    }

    Json(status)
}
