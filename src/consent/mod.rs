//! Consent
//!
//! Event-sourced consent state: an immutable, hash-chained event per
//! transition and a current-state aggregate per (tenant, user, purpose).

pub mod engine;
pub mod registry;
pub mod types;

pub use engine::ConsentEngine;
pub use registry::PurposeRegistry;
pub use types::{
    AggregateFilter, ConsentAggregate, ConsentEvent, ConsentMethod, ConsentRequest, ConsentStatus, EventFilter,
    Purpose, SourceSystem,
};
