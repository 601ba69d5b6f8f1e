//! Webhooks
//!
//! Fan-out of domain events to tenant-registered endpoints, signed delivery
//! on a background worker, and operator replay.

pub mod dispatcher;
pub mod signing;
pub mod types;
pub mod worker;

pub use dispatcher::{delivery_channel, DeliveryQueue, DeliveryReceiver, WebhookDispatcher};
pub use signing::{sign_payload, verify_signature};
pub use types::{DeliveryStatus, WebhookDelivery, WebhookEndpoint};
pub use worker::{DeliveryOutcome, DeliveryWorker, RetryPolicy};
