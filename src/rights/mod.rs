//! Rights Requests
//!
//! Lifecycle of data-subject requests, ledgered like consent transitions.

pub mod engine;
pub mod types;

pub use engine::RightsEngine;
pub use types::{RequestStatus, RightType, RightsFilter, RightsRequest};
