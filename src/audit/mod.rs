//! Audit Ledger
//!
//! Tamper-evident, per-tenant hash chains over every state change, with
//! replay verification and the request digest log used for payload lookups
//! and compliance metrics.

pub mod entry;
pub mod ledger;
pub mod metrics;
pub mod requests;
pub mod verify;

pub use entry::{LedgerDraft, LedgerEntry, LedgerFilter};
pub use ledger::AuditLedger;
pub use metrics::{AuditMetrics, Bucket, MetricsScope, TimeWindow, Timeseries};
pub use requests::{RequestDigestLog, RequestObservation, RequestRecord};
pub use verify::{find_forks, verify_chain, ChainReport};
