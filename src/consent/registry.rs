//! Purpose & Source-System Registry
//!
//! Tenant-scoped catalogues that consent records refer to by code.

use tracing::info;

use crate::actor::TenantContext;
use crate::consent::types::{Purpose, SourceSystem};
use crate::crypto::hashing::{canonical_timestamp, utc_now};
use crate::database::Database;
use crate::error::{LedgerError, Result};

fn duplicate_or_storage(err: sqlx::Error, kind: &str, code: &str) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            LedgerError::ValidationError(format!("{} '{}' already exists", kind, code))
        }
        other => other.into(),
    }
}

fn require_code(code: &str) -> Result<()> {
    if code.trim().is_empty() {
        return Err(LedgerError::ValidationError("Code must not be empty".to_string()));
    }
    Ok(())
}

#[derive(Clone)]
pub struct PurposeRegistry {
    db: Database,
}

impl PurposeRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create_purpose(&self, ctx: &TenantContext, code: &str, description: Option<&str>) -> Result<Purpose> {
        require_code(code)?;
        let created_at = utc_now();

        let result = sqlx::query(
            "INSERT INTO purposes (tenant_id, code, description, active, created_at) VALUES (?, ?, ?, 1, ?)",
        )
        .bind(&ctx.tenant_id)
        .bind(code)
        .bind(description)
        .bind(canonical_timestamp(&created_at))
        .execute(self.db.pool())
        .await
        .map_err(|e| duplicate_or_storage(e, "Purpose", code))?;

        info!("Created purpose {} for tenant {}", code, ctx.tenant_id);

        Ok(Purpose {
            id: result.last_insert_rowid(),
            tenant_id: ctx.tenant_id.clone(),
            code: code.to_string(),
            description: description.map(str::to_string),
            active: true,
            created_at,
        })
    }

    pub async fn set_purpose_active(&self, ctx: &TenantContext, code: &str, active: bool) -> Result<Purpose> {
        let result = sqlx::query("UPDATE purposes SET active = ? WHERE tenant_id = ? AND code = ?")
            .bind(active)
            .bind(&ctx.tenant_id)
            .bind(code)
            .execute(self.db.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::purpose_not_found(code));
        }

        info!("Purpose {} for tenant {} active={}", code, ctx.tenant_id, active);
        self.purpose(&ctx.tenant_id, code)
            .await?
            .ok_or_else(|| LedgerError::purpose_not_found(code))
    }

    pub async fn list_purposes(&self, ctx: &TenantContext) -> Result<Vec<Purpose>> {
        let rows = sqlx::query("SELECT * FROM purposes WHERE tenant_id = ? ORDER BY code")
            .bind(&ctx.tenant_id)
            .fetch_all(self.db.pool())
            .await?;
        rows.iter().map(Purpose::from_row).collect()
    }

    pub async fn purpose(&self, tenant_id: &str, code: &str) -> Result<Option<Purpose>> {
        let row = sqlx::query("SELECT * FROM purposes WHERE tenant_id = ? AND code = ?")
            .bind(tenant_id)
            .bind(code)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(Purpose::from_row).transpose()
    }

    /// Resolve a purpose code that consent may be recorded against.
    /// Missing and inactive purposes are both `NotFound`.
    pub async fn active_purpose(&self, tenant_id: &str, code: &str) -> Result<Purpose> {
        match self.purpose(tenant_id, code).await? {
            Some(purpose) if purpose.active => Ok(purpose),
            _ => Err(LedgerError::purpose_not_found(code)),
        }
    }

    pub async fn create_system(&self, ctx: &TenantContext, code: &str, description: Option<&str>) -> Result<SourceSystem> {
        require_code(code)?;
        let created_at = utc_now();

        let result = sqlx::query(
            "INSERT INTO source_systems (tenant_id, code, description, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&ctx.tenant_id)
        .bind(code)
        .bind(description)
        .bind(canonical_timestamp(&created_at))
        .execute(self.db.pool())
        .await
        .map_err(|e| duplicate_or_storage(e, "System", code))?;

        info!("Created source system {} for tenant {}", code, ctx.tenant_id);

        Ok(SourceSystem {
            id: result.last_insert_rowid(),
            tenant_id: ctx.tenant_id.clone(),
            code: code.to_string(),
            description: description.map(str::to_string),
            created_at,
        })
    }

    pub async fn list_systems(&self, ctx: &TenantContext) -> Result<Vec<SourceSystem>> {
        let rows = sqlx::query("SELECT * FROM source_systems WHERE tenant_id = ? ORDER BY code")
            .bind(&ctx.tenant_id)
            .fetch_all(self.db.pool())
            .await?;
        rows.iter().map(SourceSystem::from_row).collect()
    }

    pub async fn find_system(&self, tenant_id: &str, code: &str) -> Result<Option<SourceSystem>> {
        let row = sqlx::query("SELECT * FROM source_systems WHERE tenant_id = ? AND code = ?")
            .bind(tenant_id)
            .bind(code)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(SourceSystem::from_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{Actor, Role};

    async fn registry() -> PurposeRegistry {
        PurposeRegistry::new(Database::new_in_memory().await.unwrap())
    }

    fn ctx(tenant: &str) -> TenantContext {
        TenantContext::new(tenant, Actor::User("admin".into()), Role::Admin)
    }

    #[tokio::test]
    async fn test_purpose_lifecycle() {
        let registry = registry().await;
        registry.create_purpose(&ctx("acme"), "marketing", Some("Email offers")).await.unwrap();

        assert!(registry.active_purpose("acme", "marketing").await.is_ok());

        registry.set_purpose_active(&ctx("acme"), "marketing", false).await.unwrap();
        assert!(matches!(
            registry.active_purpose("acme", "marketing").await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_codes_unique_per_tenant() {
        let registry = registry().await;
        registry.create_purpose(&ctx("acme"), "marketing", None).await.unwrap();

        let duplicate = registry.create_purpose(&ctx("acme"), "marketing", None).await;
        assert!(matches!(duplicate, Err(LedgerError::ValidationError(_))));

        registry.create_purpose(&ctx("globex"), "marketing", None).await.unwrap();
        assert!(matches!(
            registry.active_purpose("globex", "analytics").await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_systems_are_tenant_scoped() {
        let registry = registry().await;
        registry.create_system(&ctx("acme"), "crm", None).await.unwrap();

        assert!(registry.find_system("acme", "crm").await.unwrap().is_some());
        assert!(registry.find_system("globex", "crm").await.unwrap().is_none());
        assert_eq!(registry.list_systems(&ctx("acme")).await.unwrap().len(), 1);
    }
}
