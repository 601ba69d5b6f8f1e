//! Exporter
//!
//! Produces signed, canonical-order exports of the ledger and request log,
//! verifies them, and matches submitted payloads against stored digests.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::actor::TenantContext;
use crate::audit::{AuditLedger, LedgerEntry, RequestDigestLog, RequestRecord};
use crate::crypto::hashing::{sha256_hex, utc_now};
use crate::crypto::{verify_signature, PublicKeyRing, SignatureManager};
use crate::error::{LedgerError, Result};
use crate::export::format::{render_ledger, render_requests, ExportFormat};

/// Which tenants an export covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportScope {
    Tenant,
    AllTenants,
}

impl ExportScope {
    /// Tenant filter for the store query. All-tenant scope needs a platform role.
    fn resolve<'a>(&self, ctx: &'a TenantContext) -> Result<Option<&'a str>> {
        match self {
            ExportScope::Tenant => Ok(Some(ctx.tenant_id.as_str())),
            ExportScope::AllTenants => {
                ctx.require_platform("export every tenant")?;
                Ok(None)
            }
        }
    }

    fn label<'a>(&self, ctx: &'a TenantContext) -> &'a str {
        match self {
            ExportScope::Tenant => ctx.tenant_id.as_str(),
            ExportScope::AllTenants => "all",
        }
    }
}

/// Export bytes with their detached signature, ready for download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedExport {
    /// Base64 of the exported bytes.
    pub data: String,
    pub data_filename: String,
    /// Base64 Ed25519 signature over the SHA-256 of the exported bytes.
    pub signature: String,
    pub signature_filename: String,
    pub format: ExportFormat,
    pub timestamp: String,
    /// Hex SHA-256 of the exported bytes.
    pub digest: String,
}

impl SignedExport {
    pub fn decoded_data(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.data)
            .map_err(|e| LedgerError::ValidationError(format!("Invalid export encoding: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum PayloadMatch {
    /// A logged request or response body hashed to the digest.
    Request {
        record: RequestRecord,
        /// Whether this lookup stamped the verification marker.
        first_verification: bool,
    },
    /// A ledger entry was written with the digest as its request fingerprint.
    LedgerFingerprint { entry: LedgerEntry },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadVerification {
    pub digest: String,
    pub matched: Option<PayloadMatch>,
}

impl PayloadVerification {
    pub fn is_match(&self) -> bool {
        self.matched.is_some()
    }
}

#[derive(Clone)]
pub struct Exporter {
    ledger: AuditLedger,
    requests: RequestDigestLog,
    signer: Arc<SignatureManager>,
}

impl Exporter {
    pub fn new(ledger: AuditLedger, requests: RequestDigestLog, signer: SignatureManager) -> Self {
        Self {
            ledger,
            requests,
            signer: Arc::new(signer),
        }
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signer.verifying_key()
    }

    pub fn public_key_base64(&self) -> String {
        self.signer.public_key_base64()
    }

    /// Ledger entries in canonical order (tenant, then creation), rendered.
    pub async fn export(&self, ctx: &TenantContext, scope: &ExportScope, format: ExportFormat) -> Result<Vec<u8>> {
        let tenant = scope.resolve(ctx)?;
        let entries = self.ledger.entries_in_order(tenant).await?;
        info!(
            "Exporting {} ledger entries ({}) as {}",
            entries.len(),
            scope.label(ctx),
            format.as_str()
        );
        render_ledger(&entries, format)
    }

    /// Request digest log in canonical order, rendered.
    pub async fn export_request_log(
        &self,
        ctx: &TenantContext,
        scope: &ExportScope,
        format: ExportFormat,
    ) -> Result<Vec<u8>> {
        let tenant = scope.resolve(ctx)?;
        let records = self.requests.records_in_order(tenant).await?;
        info!(
            "Exporting {} request records ({}) as {}",
            records.len(),
            scope.label(ctx),
            format.as_str()
        );
        render_requests(&records, format)
    }

    /// Export the ledger and sign the result in one step.
    pub async fn export_signed(
        &self,
        ctx: &TenantContext,
        scope: &ExportScope,
        format: ExportFormat,
    ) -> Result<SignedExport> {
        let data = self.export(ctx, scope, format).await?;
        Ok(self.sign_as(&data, format, &format!("ledger_export_{}", scope.label(ctx))))
    }

    /// Base64 signature over the SHA-256 digest of `data`.
    pub fn sign(&self, data: &[u8]) -> String {
        self.signer.sign(data)
    }

    fn sign_as(&self, data: &[u8], format: ExportFormat, stem: &str) -> SignedExport {
        let timestamp = utc_now().format("%Y%m%dT%H%M%SZ").to_string();
        let data_filename = format!("{}_{}.{}", stem, timestamp, format.extension());
        let signature_filename = format!("{}.sig", data_filename);

        SignedExport {
            data: BASE64.encode(data),
            data_filename,
            signature: self.sign(data),
            signature_filename,
            format,
            timestamp,
            digest: sha256_hex(data),
        }
    }

    /// Check `signature` over `data` against a single public key.
    pub fn verify(data: &[u8], signature: &str, public_key: &VerifyingKey) -> Result<bool> {
        verify_signature(data, signature, public_key)
    }

    /// Check `signature` against the active key and every retired one.
    pub fn verify_with_ring(data: &[u8], signature: &str, ring: &PublicKeyRing) -> Result<bool> {
        Ok(ring.verify(data, signature)?.is_some())
    }

    /// Hash `payload` and look the digest up in the request log, then in
    /// ledger request fingerprints. Platform roles search every tenant.
    ///
    /// A request-log hit gets its verification marker stamped by the caller,
    /// unless an earlier verification already did.
    pub async fn verify_payload_against_ledger(&self, ctx: &TenantContext, payload: &[u8]) -> Result<PayloadVerification> {
        let digest = sha256_hex(payload);
        let tenant = if ctx.role.is_platform() {
            None
        } else {
            Some(ctx.tenant_id.as_str())
        };

        if let Some(record) = self.requests.find_by_digest(tenant, &digest).await? {
            let first_verification = self.requests.mark_verified(record.id, &ctx.actor_ref()).await?;
            let record = self.requests.get(record.id).await?.unwrap_or(record);
            info!("Payload {} matched request record {}", digest, record.id);
            return Ok(PayloadVerification {
                digest,
                matched: Some(PayloadMatch::Request {
                    record,
                    first_verification,
                }),
            });
        }

        if let Some(entry) = self.ledger.find_by_fingerprint(tenant, &digest).await? {
            info!("Payload {} matched ledger entry {}", digest, entry.id);
            return Ok(PayloadVerification {
                digest,
                matched: Some(PayloadMatch::LedgerFingerprint { entry }),
            });
        }

        debug!("Payload {} has no stored match", digest);
        Ok(PayloadVerification { digest, matched: None })
    }
}
