//! Chain Verification
//!
//! Replays a tenant's entries from genesis and reports the first link that
//! does not reproduce. Detection only; nothing here repairs a chain.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::audit::entry::LedgerEntry;
use crate::crypto::hashing::GENESIS_HASH;

/// Outcome of replaying one tenant's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    pub entry_count: usize,
    pub head_hash: String,
    pub valid: bool,
    /// Index, in creation order, of the first entry that failed.
    pub broken_at: Option<usize>,
    pub broken_entry_id: Option<String>,
    pub error: Option<String>,
}

impl ChainReport {
    fn intact(entry_count: usize, head_hash: String) -> Self {
        Self {
            entry_count,
            head_hash,
            valid: true,
            broken_at: None,
            broken_entry_id: None,
            error: None,
        }
    }

    fn broken(entries: &[LedgerEntry], index: usize, error: String) -> Self {
        warn!("{} [{}]", error, entries[index].summary());
        Self {
            entry_count: entries.len(),
            head_hash: entries
                .last()
                .map(|e| e.entry_hash.clone())
                .unwrap_or_else(|| GENESIS_HASH.to_string()),
            valid: false,
            broken_at: Some(index),
            broken_entry_id: Some(entries[index].id.clone()),
            error: Some(error),
        }
    }
}

/// Verify a single tenant's entries, given in creation order.
///
/// Each entry must name its predecessor's hash (genesis for the first) and
/// its stored hash must equal `SHA256(prev_hash || canonical_json(payload))`.
pub fn verify_chain(entries: &[LedgerEntry]) -> ChainReport {
    let mut expected_prev = GENESIS_HASH.to_string();

    for (i, entry) in entries.iter().enumerate() {
        if entry.tenant_id != entries[0].tenant_id {
            return ChainReport::broken(
                entries,
                i,
                format!(
                    "Entry {} belongs to tenant {}, chain is {}",
                    i, entry.tenant_id, entries[0].tenant_id
                ),
            );
        }

        if entry.prev_hash != expected_prev {
            return ChainReport::broken(
                entries,
                i,
                format!(
                    "Hash chain broken at entry {}: expected prev_hash {}, got {}",
                    i, expected_prev, entry.prev_hash
                ),
            );
        }

        let recomputed = entry.recompute_hash();
        if recomputed != entry.entry_hash {
            return ChainReport::broken(
                entries,
                i,
                format!(
                    "Invalid hash in entry {}: stored {}, recomputed {}",
                    i, entry.entry_hash, recomputed
                ),
            );
        }

        expected_prev = entry.entry_hash.clone();
    }

    debug!("Chain verification successful: {} entries", entries.len());
    ChainReport::intact(entries.len(), expected_prev)
}

/// Indices of entries whose predecessor was already claimed by an earlier
/// entry of the same tenant.
pub fn find_forks(entries: &[LedgerEntry]) -> Vec<usize> {
    let mut claimed: HashSet<(&str, &str)> = HashSet::new();
    entries
        .iter()
        .enumerate()
        .filter(|(_, entry)| !claimed.insert((entry.tenant_id.as_str(), entry.prev_hash.as_str())))
        .map(|(i, _)| i)
        .collect()
}
