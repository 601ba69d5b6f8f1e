use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::crypto::hashing::sha256_digest;
use crate::error::{LedgerError, Result};

/// Signs and verifies export artifacts.
///
/// The signed message is the SHA-256 digest of the content, not the content
/// itself, so verifiers only ever hash the file they were handed.
pub struct SignatureManager {
    signing_key: SigningKey,
}

impl SignatureManager {
    pub fn new(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    /// Generate a new keypair
    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut OsRng))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn private_key_base64(&self) -> String {
        BASE64.encode(self.signing_key.to_bytes())
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.verifying_key().to_bytes())
    }

    /// Sign `data`, returning the base64 signature.
    pub fn sign(&self, data: &[u8]) -> String {
        let digest = sha256_digest(data);
        let signature = self.signing_key.sign(&digest);
        BASE64.encode(signature.to_bytes())
    }
}

/// Verify a base64 signature produced by [`SignatureManager::sign`].
///
/// Malformed keys or signatures are errors; a well-formed signature that does
/// not match is `Ok(false)`.
pub fn verify_signature(data: &[u8], signature_b64: &str, public_key: &VerifyingKey) -> Result<bool> {
    let signature = decode_signature(signature_b64)?;
    let digest = sha256_digest(data);

    match public_key.verify(&digest, &signature) {
        Ok(_) => Ok(true),
        Err(_) => Ok(false),
    }
}

pub fn decode_signature(signature_b64: &str) -> Result<Signature> {
    let bytes = BASE64
        .decode(signature_b64.trim())
        .map_err(|e| LedgerError::CryptoError(format!("Invalid signature encoding: {}", e)))?;
    Signature::from_slice(&bytes)
        .map_err(|e| LedgerError::CryptoError(format!("Invalid signature format: {}", e)))
}

pub fn decode_public_key(public_key_b64: &str) -> Result<VerifyingKey> {
    let bytes = BASE64
        .decode(public_key_b64.trim())
        .map_err(|e| LedgerError::CryptoError(format!("Invalid public key encoding: {}", e)))?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| LedgerError::CryptoError(format!("Public key must be 32 bytes, got {}", bytes.len())))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| LedgerError::CryptoError(format!("Invalid public key: {}", e)))
}

pub fn decode_signing_key(private_key_b64: &str) -> Result<SigningKey> {
    let bytes = BASE64
        .decode(private_key_b64.trim())
        .map_err(|e| LedgerError::CryptoError(format!("Invalid private key encoding: {}", e)))?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| LedgerError::CryptoError(format!("Private key must be 32 bytes, got {}", bytes.len())))?;
    Ok(SigningKey::from_bytes(&bytes))
}
