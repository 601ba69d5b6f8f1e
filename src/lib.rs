pub mod actor;
pub mod audit;
pub mod config;
pub mod consent;
pub mod crypto;
pub mod database;
pub mod error;
pub mod export;
pub mod ids;
pub mod rights;
pub mod services;
pub mod webhooks;

pub use config::AppConfig;
pub use error::{LedgerError, Result};
pub use services::Services;
