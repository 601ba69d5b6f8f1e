//! Storage
//!
//! SQLite pool, embedded migrations and the pagination shared by every list
//! query.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::Result;

pub const DEFAULT_PAGE_SIZE: i64 = 100;
pub const MAX_PAGE_SIZE: i64 = 1000;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the database at `database_url`.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        info!("Connected to {}", database_url);
        Ok(Database { pool })
    }

    /// Private in-memory database with the schema applied.
    ///
    /// Every pooled connection to `:memory:` is its own database, so the pool
    /// is pinned to one connection that is never recycled.
    pub async fn new_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Database { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Row counts reported by the status endpoint.
    pub async fn stats(&self) -> Result<DatabaseStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(DISTINCT tenant_id) FROM ledger_entries) AS tenants,
                (SELECT COUNT(*) FROM ledger_entries) AS ledger_entries,
                (SELECT COUNT(*) FROM consent_aggregates) AS consent_aggregates,
                (SELECT COUNT(*) FROM webhook_deliveries WHERE status = 'pending') AS pending_deliveries,
                (SELECT COUNT(*) FROM webhook_deliveries WHERE status = 'failed') AS failed_deliveries
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(DatabaseStats {
            tenants: row.try_get("tenants")?,
            ledger_entries: row.try_get("ledger_entries")?,
            consent_aggregates: row.try_get("consent_aggregates")?,
            pending_deliveries: row.try_get("pending_deliveries")?,
            failed_deliveries: row.try_get("failed_deliveries")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub tenants: i64,
    pub ledger_entries: i64,
    pub consent_aggregates: i64,
    pub pending_deliveries: i64,
    pub failed_deliveries: i64,
}

/// Limit/offset pagination. The limit is clamped to `1..=MAX_PAGE_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: i64, offset: i64) -> Self {
        Self {
            limit: limit.clamp(1, MAX_PAGE_SIZE),
            offset: offset.max(0),
        }
    }

    pub fn limit(&self) -> i64 {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }

    pub fn offset(&self) -> i64 {
        self.offset.max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_clamps() {
        assert_eq!(Pagination::default().limit(), 100);
        assert_eq!(Pagination::new(5000, -3), Pagination { limit: 1000, offset: 0 });
        assert_eq!(Pagination::new(0, 10).limit(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_database_migrates() {
        let db = Database::new_in_memory().await.unwrap();
        let stats = db.stats().await.unwrap();
        assert_eq!(stats.ledger_entries, 0);
        assert_eq!(stats.pending_deliveries, 0);
    }

    #[tokio::test]
    async fn test_ledger_table_rejects_updates() {
        let db = Database::new_in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO ledger_entries (id, tenant_id, event_type, object_type, object_id, prev_hash, entry_hash, payload, created_at)
             VALUES ('e1', 't1', 'x', 'y', 'z', 'p', 'h', '{}', '2026-01-01T00:00:00.000000Z')",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let update = sqlx::query("UPDATE ledger_entries SET entry_hash = 'forged'")
            .execute(db.pool())
            .await;
        assert!(update.is_err());

        let delete = sqlx::query("DELETE FROM ledger_entries").execute(db.pool()).await;
        assert!(delete.is_err());
    }
}
