mod common;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use common::*;
use consent_ledger::audit::RequestObservation;
use consent_ledger::crypto::key_management::load_public_key;
use consent_ledger::crypto::{generate_keypair_files, sha256_hex, PublicKeyRing};
use consent_ledger::export::format::LEDGER_CSV_HEADER;
use consent_ledger::export::{ExportFormat, ExportScope, Exporter, PayloadMatch};
use consent_ledger::rights::RightType;
use consent_ledger::LedgerError;

#[tokio::test]
async fn test_csv_export_is_in_creation_order() {
    let (services, _receiver) = setup_services().await;
    let ctx = manager_ctx("acme");
    seed_purposes(&services, &ctx).await;

    services.consent.record_consent(&ctx, &grant("U1", "marketing")).await.unwrap();
    services.consent.record_consent(&ctx, &grant("U2", "analytics")).await.unwrap();
    services.rights.open(&ctx, "U1", RightType::Access, Some("user asked"), None).await.unwrap();

    let data = services.exporter.export(&ctx, &ExportScope::Tenant, ExportFormat::Csv).await.unwrap();
    let text = String::from_utf8(data).unwrap();
    let lines: Vec<&str> = text.split_terminator("\r\n").collect();

    assert_eq!(lines[0], LEDGER_CSV_HEADER.join(","));
    assert_eq!(lines.len(), 4);
    assert!(lines[1].contains("consent.granted"));
    assert!(lines[3].contains("right.opened"));

    let entries = services.ledger.entries_in_order(Some("acme")).await.unwrap();
    for (line, entry) in lines[1..].iter().zip(&entries) {
        assert!(line.starts_with(&format!("{},{},acme,", entry.seq, entry.id)));
        assert!(line.contains(&entry.entry_hash));
    }
}

#[tokio::test]
async fn test_all_tenant_export_requires_platform_role() {
    let (services, _receiver) = setup_services().await;
    for tenant in ["globex", "acme"] {
        services
            .rights
            .open(&manager_ctx(tenant), "U1", RightType::Erasure, None, None)
            .await
            .unwrap();
    }

    let denied = services
        .exporter
        .export(&manager_ctx("acme"), &ExportScope::AllTenants, ExportFormat::Json)
        .await;
    assert!(matches!(denied, Err(LedgerError::Forbidden(_))));

    let data = services
        .exporter
        .export(&platform_ctx("acme"), &ExportScope::AllTenants, ExportFormat::Json)
        .await
        .unwrap();
    let rows: Vec<serde_json::Value> = serde_json::from_slice(&data).unwrap();
    let tenants: Vec<&str> = rows.iter().map(|r| r["tenant_id"].as_str().unwrap()).collect();
    assert_eq!(tenants, vec!["acme", "globex"]);
}

#[tokio::test]
async fn test_signed_export_bundle() {
    let (services, _receiver) = setup_services().await;
    let ctx = manager_ctx("acme");
    services.rights.open(&ctx, "U1", RightType::Erasure, None, None).await.unwrap();

    let signed = services
        .exporter
        .export_signed(&ctx, &ExportScope::Tenant, ExportFormat::Csv)
        .await
        .unwrap();

    assert!(signed.data_filename.starts_with("ledger_export_acme_"));
    assert!(signed.data_filename.ends_with(".csv"));
    assert_eq!(signed.signature_filename, format!("{}.sig", signed.data_filename));

    let data = signed.decoded_data().unwrap();
    assert_eq!(signed.digest, sha256_hex(&data));
    assert!(Exporter::verify(&data, &signed.signature, &services.exporter.public_key()).unwrap());

    let mut tampered = data.clone();
    let last = tampered.len() - 3;
    tampered[last] ^= 0x01;
    assert!(!Exporter::verify(&tampered, &signed.signature, &services.exporter.public_key()).unwrap());

    assert!(matches!(
        Exporter::verify(&data, "%%%", &services.exporter.public_key()),
        Err(LedgerError::CryptoError(_))
    ));
    assert_eq!(BASE64.encode(&data), signed.data);
}

#[tokio::test]
async fn test_rotated_key_still_verifies_old_exports() {
    let dir = tempfile::tempdir().unwrap();
    let retired = dir.path().join("retired");
    let old_signer = generate_keypair_files(dir.path(), Some(&retired)).unwrap();
    let old_signature = old_signer.sign(b"[]");
    generate_keypair_files(dir.path(), Some(&retired)).unwrap();

    let ring = PublicKeyRing::load(&dir.path().join("audit_public.key"), Some(&retired)).unwrap();
    assert!(Exporter::verify_with_ring(b"[]", &old_signature, &ring).unwrap());

    let active = load_public_key(&dir.path().join("audit_public.key")).unwrap();
    assert!(!Exporter::verify(b"[]", &old_signature, &active).unwrap());
}

#[tokio::test]
async fn test_payload_verification_marks_first_verifier_only() {
    let (services, _receiver) = setup_services().await;
    let ctx = manager_ctx("acme");
    let body = br#"{"external_user_id":"U1","purpose":"marketing"}"#;

    services
        .requests
        .record_request(
            "acme",
            &RequestObservation {
                actor_ref: Some(ctx.actor_ref()),
                method: "POST",
                path: "/consents",
                status_code: 201,
                ip: Some("198.51.100.4"),
                request_body: Some(body),
                response_body: None,
            },
        )
        .await
        .unwrap();
    let head_before = services.ledger.latest_hash("acme").await.unwrap();

    let first = services.exporter.verify_payload_against_ledger(&ctx, body).await.unwrap();
    assert_eq!(first.digest, sha256_hex(body));
    match first.matched {
        Some(PayloadMatch::Request { record, first_verification }) => {
            assert!(first_verification);
            assert_eq!(record.verifier_ref.as_deref(), Some("api_key:acme-key"));
            assert!(record.verified_at.is_some());
        }
        other => panic!("unexpected match: {:?}", other),
    }

    let auditor = platform_ctx("platform");
    let second = services.exporter.verify_payload_against_ledger(&auditor, body).await.unwrap();
    match second.matched {
        Some(PayloadMatch::Request { record, first_verification }) => {
            assert!(!first_verification);
            assert_eq!(record.verifier_ref.as_deref(), Some("api_key:acme-key"));
        }
        other => panic!("unexpected match: {:?}", other),
    }

    // Other tenants without a platform role see nothing.
    let outsider = services
        .exporter
        .verify_payload_against_ledger(&manager_ctx("globex"), body)
        .await
        .unwrap();
    assert!(!outsider.is_match());

    let unknown = services.exporter.verify_payload_against_ledger(&ctx, b"{}").await.unwrap();
    assert!(unknown.matched.is_none());

    // Verification markers never touch the chain.
    assert_eq!(services.ledger.latest_hash("acme").await.unwrap(), head_before);
}

#[tokio::test]
async fn test_payload_matches_ledger_fingerprint() {
    let (services, _receiver) = setup_services().await;
    let ctx = manager_ctx("acme");
    seed_purposes(&services, &ctx).await;
    let body = br#"{"user":"U1","status":"granted"}"#;

    let mut request = grant("U1", "marketing");
    request.request_fingerprint = Some(sha256_hex(body));
    services.consent.record_consent(&ctx, &request).await.unwrap();

    let result = services.exporter.verify_payload_against_ledger(&ctx, body).await.unwrap();
    match result.matched {
        Some(PayloadMatch::LedgerFingerprint { entry }) => {
            assert_eq!(entry.event_type, "consent.granted");
            assert_eq!(entry.tenant_id, "acme");
        }
        other => panic!("unexpected match: {:?}", other),
    }
}

#[tokio::test]
async fn test_request_log_export() {
    let (services, _receiver) = setup_services().await;
    let ctx = manager_ctx("acme");
    services
        .requests
        .record_request(
            "acme",
            &RequestObservation {
                method: "GET",
                path: "/consents?user=a,b",
                status_code: 200,
                response_body: Some(b"[]"),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let data = services
        .exporter
        .export_request_log(&ctx, &ExportScope::Tenant, ExportFormat::Csv)
        .await
        .unwrap();
    let text = String::from_utf8(data).unwrap();
    let row = text.split_terminator("\r\n").nth(1).unwrap();
    assert!(row.contains("\"/consents?user=a,b\""));
    assert!(row.contains(&sha256_hex(b"[]")));
}
