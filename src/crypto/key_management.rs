//! Export Key Management
//!
//! File-based storage for the Ed25519 keypair that signs ledger exports,
//! plus the ring of retired public keys that keeps older exports verifiable
//! after a rotation.

use chrono::Utc;
use ed25519_dalek::VerifyingKey;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::signatures::{decode_public_key, decode_signing_key, verify_signature, SignatureManager};
use crate::error::{LedgerError, Result};

pub const PRIVATE_KEY_FILE: &str = "audit_private.key";
pub const PUBLIC_KEY_FILE: &str = "audit_public.key";

fn read_key_file(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| LedgerError::CryptoError(format!("Failed to read key file {:?}: {}", path, e)))
}

/// Load the signing key from a base64 key file.
pub fn load_signature_manager(private_key_path: &Path) -> Result<SignatureManager> {
    let encoded = read_key_file(private_key_path)?;
    Ok(SignatureManager::new(decode_signing_key(&encoded)?))
}

pub fn load_public_key(public_key_path: &Path) -> Result<VerifyingKey> {
    decode_public_key(&read_key_file(public_key_path)?)
}

/// Unused file name for a retired key, ordered by retirement time.
fn retired_key_path(retired_dir: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%6f").to_string();
    let mut path = retired_dir.join(format!("audit_public_{}.key", stamp));
    let mut counter = 1;
    while path.exists() {
        path = retired_dir.join(format!("audit_public_{}_{}.key", stamp, counter));
        counter += 1;
    }
    path
}

/// Generate a fresh keypair and write it into `dir`.
///
/// If `retire_into` is given and a public key already exists in `dir`, that
/// key is moved there first under a timestamped name.
pub fn generate_keypair_files(dir: &Path, retire_into: Option<&Path>) -> Result<SignatureManager> {
    fs::create_dir_all(dir)
        .map_err(|e| LedgerError::CryptoError(format!("Failed to create key directory: {}", e)))?;

    let public_path = dir.join(PUBLIC_KEY_FILE);
    if let Some(retired_dir) = retire_into {
        if public_path.exists() {
            fs::create_dir_all(retired_dir).map_err(|e| {
                LedgerError::CryptoError(format!("Failed to create retired key directory: {}", e))
            })?;
            let retired_path = retired_key_path(retired_dir);
            fs::copy(&public_path, &retired_path)
                .map_err(|e| LedgerError::CryptoError(format!("Failed to retire public key: {}", e)))?;
            info!("Retired previous public key to {:?}", retired_path);
        }
    }

    let manager = SignatureManager::generate();
    let private_b64 = manager.private_key_base64();
    fs::write(dir.join(PRIVATE_KEY_FILE), private_b64)
        .map_err(|e| LedgerError::CryptoError(format!("Failed to write private key: {}", e)))?;
    fs::write(&public_path, manager.public_key_base64())
        .map_err(|e| LedgerError::CryptoError(format!("Failed to write public key: {}", e)))?;

    info!("Generated export signing keypair in {:?}", dir);
    Ok(manager)
}

/// The active public key plus every retired one still trusted.
#[derive(Debug, Clone)]
pub struct PublicKeyRing {
    keys: Vec<(String, VerifyingKey)>,
}

impl PublicKeyRing {
    pub fn new(active: VerifyingKey) -> Self {
        Self {
            keys: vec![("active".to_string(), active)],
        }
    }

    /// Load the active key and, if given, every `*.key` file in the retired directory.
    pub fn load(public_key_path: &Path, retired_dir: Option<&Path>) -> Result<Self> {
        let mut ring = Self::new(load_public_key(public_key_path)?);

        if let Some(dir) = retired_dir {
            if dir.exists() {
                ring.load_retired(dir)?;
            }
        }

        Ok(ring)
    }

    fn load_retired(&mut self, dir: &Path) -> Result<()> {
        let entries = fs::read_dir(dir)
            .map_err(|e| LedgerError::CryptoError(format!("Failed to read {:?}: {}", dir, e)))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().map(|ext| ext == "key").unwrap_or(false))
            .collect();
        paths.sort();

        for path in paths {
            match load_public_key(&path) {
                Ok(key) => {
                    debug!("Loaded retired public key {:?}", path);
                    self.keys.push((path.to_string_lossy().to_string(), key));
                }
                Err(e) => warn!("Skipping unreadable retired key {:?}: {}", path, e),
            }
        }
        Ok(())
    }

    pub fn add(&mut self, label: impl Into<String>, key: VerifyingKey) {
        self.keys.push((label.into(), key));
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Label of the first key the signature verifies under, if any.
    pub fn verify(&self, data: &[u8], signature_b64: &str) -> Result<Option<String>> {
        for (label, key) in &self.keys {
            if verify_signature(data, signature_b64, key)? {
                return Ok(Some(label.clone()));
            }
        }
        Ok(None)
    }
}
