//! Cryptographic Primitives
//!
//! Canonical hashing for the ledger chain, tenant-derived keys for
//! identifier hashing and field encryption, and Ed25519 export signatures.

pub mod hashing;
pub mod key_management;
pub mod signatures;
pub mod tenant_keys;

pub use hashing::{canonical_json, canonical_timestamp, compute_entry_hash, sha256_hex, utc_now, GENESIS_HASH};
pub use key_management::{generate_keypair_files, load_signature_manager, PublicKeyRing};
pub use signatures::{verify_signature, SignatureManager};
pub use tenant_keys::{FieldCipher, TenantSecrets};
