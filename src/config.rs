use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::{LedgerError, Result};

const DEFAULT_CONFIG_FILE: &str = "consent-ledger.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Root secret every tenant key is derived from.
    pub master_encryption_key: String,
    #[serde(default)]
    pub signing: SigningConfig,
    #[serde(default)]
    pub webhooks: WebhookConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    #[serde(default = "default_private_key_path")]
    pub private_key_path: String,
    #[serde(default = "default_public_key_path")]
    pub public_key_path: String,
    /// Directory of public keys retired by rotation, still trusted for verification.
    #[serde(default)]
    pub retired_keys_dir: Option<String>,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            private_key_path: default_private_key_path(),
            public_key_path: default_public_key_path(),
            retired_keys_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Re-enqueue failed deliveries on the backoff schedule instead of
    /// waiting for an operator replay.
    #[serde(default)]
    pub auto_retry: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            auto_retry: false,
            concurrency: default_concurrency(),
        }
    }
}

impl WebhookConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_database_url() -> String {
    "sqlite://consent-ledger.db".to_string()
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    3000
}

fn default_private_key_path() -> String {
    "keys/audit_private.key".to_string()
}

fn default_public_key_path() -> String {
    "keys/audit_public.key".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    6
}

fn default_concurrency() -> usize {
    8
}

impl AppConfig {
    /// Load configuration from the optional config file and `LEDGER_*`
    /// environment variables, environment taking precedence.
    pub fn load() -> Result<Self> {
        let path = env::var("LEDGER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        let config: AppConfig = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix("LEDGER")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the services cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.master_encryption_key.trim().is_empty() {
            return Err(LedgerError::ConfigError(
                "master_encryption_key must not be empty".to_string(),
            ));
        }
        if self.webhooks.timeout_secs == 0 {
            return Err(LedgerError::ConfigError(
                "webhooks.timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.webhooks.max_attempts == 0 {
            return Err(LedgerError::ConfigError(
                "webhooks.max_attempts must be greater than zero".to_string(),
            ));
        }
        if self.webhooks.concurrency == 0 {
            return Err(LedgerError::ConfigError(
                "webhooks.concurrency must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        serde_json::from_value(serde_json::json!({
            "master_encryption_key": "test-master-key"
        }))
        .unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let config = base_config();
        assert_eq!(config.database_url, "sqlite://consent-ledger.db");
        assert_eq!(config.server_port, 3000);
        assert_eq!(config.webhooks.timeout_secs, 10);
        assert_eq!(config.webhooks.max_attempts, 6);
        assert!(!config.webhooks.auto_retry);
        assert_eq!(config.signing.private_key_path, "keys/audit_private.key");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_master_key_rejected() {
        let mut config = base_config();
        config.master_encryption_key = "  ".to_string();
        assert!(matches!(config.validate(), Err(LedgerError::ConfigError(_))));
    }

    #[test]
    fn test_zero_attempt_budget_rejected() {
        let mut config = base_config();
        config.webhooks.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
