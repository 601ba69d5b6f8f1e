//! Export & Verification
//!
//! Signed ledger exports, offline signature checks and payload lookups
//! against stored request digests.

pub mod exporter;
pub mod format;

pub use exporter::{ExportScope, Exporter, PayloadMatch, PayloadVerification, SignedExport};
pub use format::ExportFormat;
