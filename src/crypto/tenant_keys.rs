//! Tenant Key Derivation
//!
//! Derives one symmetric key per tenant from the master secret and uses it
//! for salted identifier hashing and field-level encryption.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{LedgerError, Result};

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;

fn hmac_sha256(key: &[u8], message: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| LedgerError::CryptoError(format!("Invalid HMAC key: {}", e)))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().into())
}

/// Source of every tenant-scoped key.
#[derive(Clone)]
pub struct TenantSecrets {
    master: Arc<Vec<u8>>,
}

impl TenantSecrets {
    pub fn new(master_key: &str) -> Result<Self> {
        if master_key.is_empty() {
            return Err(LedgerError::ConfigError(
                "Master encryption key must not be empty".to_string(),
            ));
        }
        Ok(Self {
            master: Arc::new(master_key.as_bytes().to_vec()),
        })
    }

    /// Deterministic 256-bit key for `tenant_id`.
    pub fn tenant_key(&self, tenant_id: &str) -> Result<[u8; 32]> {
        hmac_sha256(&self.master, format!("tenant:{}", tenant_id).as_bytes())
    }

    /// One-way, tenant-salted digest of an identifier such as an IP address.
    ///
    /// Equal inputs within a tenant collide so repeat submissions can be
    /// correlated; the same input under another tenant does not.
    pub fn hash_identifier(&self, tenant_id: &str, value: &str) -> Result<String> {
        let key = self.tenant_key(tenant_id)?;
        Ok(hex::encode(hmac_sha256(&key, value.as_bytes())?))
    }

    pub fn field_cipher(&self, tenant_id: &str) -> Result<FieldCipher> {
        FieldCipher::new(&self.tenant_key(tenant_id)?)
    }
}

/// AES-256-GCM over individual string values.
pub struct FieldCipher {
    cipher: Aes256Gcm,
}

impl FieldCipher {
    pub fn new(key: &[u8; 32]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| LedgerError::CryptoError(format!("Invalid cipher key: {}", e)))?;
        Ok(Self { cipher })
    }

    /// Encrypt to base64(nonce || ciphertext). Each call draws a fresh nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| LedgerError::CryptoError("Field encryption failed".to_string()))?;

        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    pub fn decrypt(&self, sealed: &str) -> Result<String> {
        let bytes = BASE64
            .decode(sealed)
            .map_err(|e| LedgerError::CryptoError(format!("Invalid ciphertext encoding: {}", e)))?;
        if bytes.len() <= NONCE_LEN {
            return Err(LedgerError::CryptoError("Ciphertext too short".to_string()));
        }

        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| LedgerError::CryptoError("Field decryption failed".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| LedgerError::CryptoError(format!("Decrypted field is not UTF-8: {}", e)))
    }

    pub fn encrypt_fields(&self, fields: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
        fields
            .iter()
            .map(|(name, value)| Ok((name.clone(), self.encrypt(value)?)))
            .collect()
    }

    pub fn decrypt_fields(&self, fields: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
        fields
            .iter()
            .map(|(name, value)| Ok((name.clone(), self.decrypt(value)?)))
            .collect()
    }
}
