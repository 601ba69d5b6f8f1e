use thiserror::Error;

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::ValidationError(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        Self::StorageError(format!("Database error: {}", err))
    }
}

impl From<sqlx::migrate::MigrateError> for LedgerError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::StorageError(format!("Migration error: {}", err))
    }
}

impl From<config::ConfigError> for LedgerError {
    fn from(err: config::ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Webhook delivery error: {0}")]
    DeliveryError(String),

    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A replayed chain did not reproduce its stored hashes. Never repaired
    /// automatically.
    #[error("Ledger chain corrupted: {0}")]
    ChainCorruption(String),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

impl LedgerError {
    pub fn purpose_not_found(code: &str) -> Self {
        Self::NotFound(format!("Purpose '{}' not found", code))
    }

    pub fn request_not_found(id: &str) -> Self {
        Self::NotFound(format!("Rights request '{}' not found", id))
    }

    pub fn delivery_not_found(id: &str) -> Self {
        Self::NotFound(format!("Webhook delivery '{}' not found", id))
    }

    pub fn invalid_transition(from: &str, to: &str) -> Self {
        Self::ValidationError(format!("Cannot transition from '{}' to '{}'", from, to))
    }

    pub fn platform_only(operation: &str) -> Self {
        Self::Forbidden(format!("Only platform administrators may {}", operation))
    }
}
