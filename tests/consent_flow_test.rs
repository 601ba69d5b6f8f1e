mod common;

use std::collections::BTreeMap;

use common::*;
use consent_ledger::audit::LedgerFilter;
use consent_ledger::consent::{AggregateFilter, ConsentStatus, EventFilter};
use consent_ledger::crypto::GENESIS_HASH;
use consent_ledger::database::Pagination;
use consent_ledger::export::{ExportFormat, ExportScope, Exporter};
use consent_ledger::LedgerError;

#[tokio::test]
async fn test_grant_withdraw_export_scenario() {
    let (services, _receiver) = setup_services().await;
    let ctx = manager_ctx("acme");
    seed_purposes(&services, &ctx).await;

    let granted = services.consent.record_consent(&ctx, &grant("U1", "marketing")).await.unwrap();
    assert_eq!(granted.status, ConsentStatus::Granted);

    let withdrawn = services.consent.record_consent(&ctx, &withdraw("U1", "marketing")).await.unwrap();
    assert_eq!(withdrawn.status, ConsentStatus::Withdrawn);
    assert_eq!(withdrawn.id, granted.id);

    let events = services
        .consent
        .list_events(&ctx, &EventFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(events.len(), 2);
    let (second, first) = (&events[0], &events[1]);
    assert_eq!(first.status, ConsentStatus::Granted);
    assert_eq!(first.prev_hash, GENESIS_HASH);
    assert_eq!(second.prev_hash, first.event_hash);

    let data = services
        .exporter
        .export(&ctx, &ExportScope::Tenant, ExportFormat::Json)
        .await
        .unwrap();
    let signature = services.exporter.sign(&data);
    let public_key = services.exporter.public_key();
    assert!(Exporter::verify(&data, &signature, &public_key).unwrap());

    let mut tampered = data.clone();
    let idx = tampered.iter().position(|b| *b == b'w').unwrap();
    tampered[idx] = b'W';
    assert!(!Exporter::verify(&tampered, &signature, &public_key).unwrap());
}

#[tokio::test]
async fn test_one_aggregate_two_events() {
    let (services, _receiver) = setup_services().await;
    let ctx = manager_ctx("acme");
    seed_purposes(&services, &ctx).await;

    services.consent.record_consent(&ctx, &grant("U1", "marketing")).await.unwrap();
    services.consent.record_consent(&ctx, &withdraw("U1", "marketing")).await.unwrap();

    let aggregates = services
        .consent
        .list_aggregates(&ctx, &AggregateFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(aggregates.len(), 1);
    assert_eq!(aggregates[0].status, ConsentStatus::Withdrawn);

    let latest = services.consent.latest(&ctx, "U1", "marketing").await.unwrap();
    assert_eq!(latest.status, ConsentStatus::Withdrawn);

    let events = services
        .consent
        .list_events(
            &ctx,
            &EventFilter {
                aggregate_id: Some(latest.id),
                ..Default::default()
            },
            Pagination::default(),
        )
        .await
        .unwrap();
    assert_eq!(events.len(), 2);

    // Each consent event is twinned with exactly one ledger entry.
    let entries = services
        .ledger
        .list("acme", &LedgerFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].object_id, events[0].id);
    assert_eq!(entries[0].entry_hash, events[0].event_hash);
    assert_eq!(entries[0].event_type, "consent.withdrawn");
    assert_eq!(entries[0].actor_ref.as_deref(), Some("api_key:acme-key"));
}

#[tokio::test]
async fn test_unknown_or_inactive_purpose_writes_nothing() {
    let (services, _receiver) = setup_services().await;
    let ctx = manager_ctx("acme");
    seed_purposes(&services, &ctx).await;

    let missing = services.consent.record_consent(&ctx, &grant("U1", "profiling")).await;
    assert!(matches!(missing, Err(LedgerError::NotFound(_))));

    services.registry().set_purpose_active(&ctx, "analytics", false).await.unwrap();
    let inactive = services.consent.record_consent(&ctx, &grant("U1", "analytics")).await;
    assert!(matches!(inactive, Err(LedgerError::NotFound(_))));

    let report = services.ledger.verify_tenant("acme").await.unwrap();
    assert_eq!(report.entry_count, 0);
    assert!(matches!(
        services.consent.latest(&ctx, "U1", "marketing").await,
        Err(LedgerError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_personal_data_is_hashed_or_encrypted() {
    let (services, _receiver) = setup_services().await;
    let ctx = manager_ctx("acme");
    seed_purposes(&services, &ctx).await;

    let mut request = grant("U1", "marketing");
    request.ip = Some("203.0.113.7".to_string());
    request.user_agent = Some("Mozilla/5.0".to_string());
    request.encrypted_fields = Some(BTreeMap::from([("email".to_string(), "u1@example.com".to_string())]));

    let aggregate = services.consent.record_consent(&ctx, &request).await.unwrap();
    let sealed = aggregate.encrypted_fields.clone().unwrap();
    assert_ne!(sealed["email"], "u1@example.com");
    assert_eq!(
        services.consent.decrypt_fields(&ctx, &aggregate).unwrap()["email"],
        "u1@example.com"
    );
    assert!(matches!(
        services.consent.decrypt_fields(&manager_ctx("globex"), &aggregate),
        Err(LedgerError::Forbidden(_))
    ));

    // A later transition without fields keeps the stored ciphertext.
    let withdrawn = services.consent.record_consent(&ctx, &withdraw("U1", "marketing")).await.unwrap();
    assert_eq!(withdrawn.encrypted_fields, Some(sealed));

    let events = services
        .consent
        .list_events(&ctx, &EventFilter::default(), Pagination::default())
        .await
        .unwrap();
    let granted_event = &events[1];
    let ip_hash = granted_event.ip_hash.as_deref().unwrap();
    assert_eq!(ip_hash.len(), 64);
    assert!(!ip_hash.contains("203.0.113.7"));
    assert!(granted_event.user_agent_hash.is_some());
    assert!(events[0].ip_hash.is_none());
}

#[tokio::test]
async fn test_tenants_are_isolated() {
    let (services, _receiver) = setup_services().await;
    let acme = manager_ctx("acme");
    let globex = manager_ctx("globex");
    seed_purposes(&services, &acme).await;
    seed_purposes(&services, &globex).await;

    services.consent.record_consent(&acme, &grant("U1", "marketing")).await.unwrap();
    services.consent.record_consent(&globex, &grant("U1", "marketing")).await.unwrap();
    services.consent.record_consent(&globex, &grant("U2", "analytics")).await.unwrap();

    let acme_aggregates = services
        .consent
        .list_aggregates(&acme, &AggregateFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(acme_aggregates.len(), 1);
    assert!(acme_aggregates.iter().all(|a| a.tenant_id == "acme"));

    let globex_events = services
        .consent
        .list_events(&globex, &EventFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(globex_events.len(), 2);
    assert!(globex_events.iter().all(|e| e.tenant_id == "globex"));

    // Each tenant's chain starts at genesis.
    let acme_entries = services.ledger.entries_in_order(Some("acme")).await.unwrap();
    let globex_entries = services.ledger.entries_in_order(Some("globex")).await.unwrap();
    assert_eq!(acme_entries[0].prev_hash, GENESIS_HASH);
    assert_eq!(globex_entries[0].prev_hash, GENESIS_HASH);
    assert_eq!(globex_entries[1].prev_hash, globex_entries[0].entry_hash);

    let filtered = services
        .consent
        .list_aggregates(
            &globex,
            &AggregateFilter {
                external_user_id: Some("U2".to_string()),
                ..Default::default()
            },
            Pagination::default(),
        )
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
}

#[tokio::test]
async fn test_source_system_resolution() {
    let (services, _receiver) = setup_services().await;
    let ctx = manager_ctx("acme");
    seed_purposes(&services, &ctx).await;
    let crm = services.registry().create_system(&ctx, "crm", None).await.unwrap();

    let mut known = grant("U1", "marketing");
    known.system_code = Some("crm".to_string());
    let aggregate = services.consent.record_consent(&ctx, &known).await.unwrap();
    assert_eq!(aggregate.source_system_id, Some(crm.id));

    let mut unknown = grant("U2", "marketing");
    unknown.system_code = Some("legacy".to_string());
    let aggregate = services.consent.record_consent(&ctx, &unknown).await.unwrap();
    assert_eq!(aggregate.source_system_id, None);
}
