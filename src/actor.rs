//! Actors and Tenant Context
//!
//! Who is acting, on behalf of which tenant, with which role. Resolved once
//! at the boundary and passed into every engine operation.

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};

/// The principal behind a state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    ApiKey(String),
    User(String),
    /// An organization acting as its own actor.
    Organization(String),
    /// Background work with no human or key behind it.
    System,
}

impl Actor {
    /// Stable reference recorded as the ledger `actor_ref`.
    pub fn identity_ref(&self) -> String {
        match self {
            Actor::ApiKey(id) => format!("api_key:{}", id),
            Actor::User(id) => format!("user:{}", id),
            Actor::Organization(id) => format!("org:{}", id),
            Actor::System => "system".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Manager,
    Admin,
    Superadmin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Manager => "manager",
            Role::Admin => "admin",
            Role::Superadmin => "superadmin",
        }
    }

    /// Platform roles may act across tenants.
    pub fn is_platform(&self) -> bool {
        matches!(self, Role::Superadmin)
    }
}

impl std::str::FromStr for Role {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "viewer" => Ok(Role::Viewer),
            "manager" => Ok(Role::Manager),
            "admin" => Ok(Role::Admin),
            "superadmin" => Ok(Role::Superadmin),
            _ => Err(LedgerError::ValidationError(format!("Unknown role: {}", s))),
        }
    }
}

/// Tenant scope and caller identity for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: String,
    pub actor: Actor,
    pub role: Role,
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<String>, actor: Actor, role: Role) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            actor,
            role,
        }
    }

    pub fn actor_ref(&self) -> String {
        self.actor.identity_ref()
    }

    /// Fail with `Forbidden` unless the caller holds a platform role.
    pub fn require_platform(&self, operation: &str) -> Result<()> {
        if self.role.is_platform() {
            Ok(())
        } else {
            Err(LedgerError::platform_only(operation))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_refs() {
        assert_eq!(Actor::ApiKey("k1".into()).identity_ref(), "api_key:k1");
        assert_eq!(Actor::User("u1".into()).identity_ref(), "user:u1");
        assert_eq!(Actor::Organization("acme".into()).identity_ref(), "org:acme");
        assert_eq!(Actor::System.identity_ref(), "system");
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("Admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("superadmin".parse::<Role>().unwrap(), Role::Superadmin);
        assert!("owner".parse::<Role>().is_err());
    }

    #[test]
    fn test_only_superadmin_is_platform() {
        assert!(Role::Superadmin.is_platform());
        for role in [Role::Viewer, Role::Manager, Role::Admin] {
            assert!(!role.is_platform());
        }

        let ctx = TenantContext::new("acme", Actor::User("u1".into()), Role::Admin);
        assert!(matches!(ctx.require_platform("export all tenants"), Err(LedgerError::Forbidden(_))));
    }
}
