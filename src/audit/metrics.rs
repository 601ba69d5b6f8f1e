//! Request Log Metrics
//!
//! Compliance overview computed from the request digest log: totals, the
//! last day's status breakdown, verification coverage, the busiest paths and
//! a bucketed timeseries. Reading another tenant's figures, or all of them,
//! needs a platform role.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::debug;

use crate::actor::TenantContext;
use crate::audit::requests::RequestDigestLog;
use crate::crypto::hashing::{canonical_timestamp, utc_now};
use crate::error::{LedgerError, Result};

const TOP_PATHS_LIMIT: i64 = 10;
const TOP_PATHS_DAYS: i64 = 30;

const STATUS_SUMS: &str = "COUNT(*) AS events, \
     COALESCE(SUM(CASE WHEN status_code BETWEEN 200 AND 299 THEN 1 ELSE 0 END), 0) AS s2xx, \
     COALESCE(SUM(CASE WHEN status_code BETWEEN 400 AND 499 THEN 1 ELSE 0 END), 0) AS s4xx, \
     COALESCE(SUM(CASE WHEN status_code BETWEEN 500 AND 599 THEN 1 ELSE 0 END), 0) AS s5xx";

/// Which tenants a metrics query covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricsScope {
    Tenant(String),
    AllTenants,
}

impl MetricsScope {
    fn resolve<'a>(&'a self, ctx: &TenantContext) -> Result<Option<&'a str>> {
        match self {
            MetricsScope::Tenant(tenant_id) if *tenant_id == ctx.tenant_id => Ok(Some(tenant_id.as_str())),
            MetricsScope::Tenant(tenant_id) => {
                ctx.require_platform("read another tenant's metrics")?;
                Ok(Some(tenant_id.as_str()))
            }
            MetricsScope::AllTenants => {
                ctx.require_platform("read metrics across tenants")?;
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBreakdown {
    #[serde(rename = "2xx")]
    pub s2xx: i64,
    #[serde(rename = "4xx")]
    pub s4xx: i64,
    #[serde(rename = "5xx")]
    pub s5xx: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsTotals {
    pub events: i64,
    pub tenants: i64,
    pub actors: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentActivity {
    pub events: i64,
    pub by_status: StatusBreakdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationCoverage {
    pub verified: i64,
    pub unverified: i64,
    /// Share of records carrying a verification marker, to four places.
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathCount {
    pub path: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditMetrics {
    pub totals: MetricsTotals,
    pub last_24h: RecentActivity,
    pub verification: VerificationCoverage,
    /// Most requested paths over the last 30 days.
    pub top_paths: Vec<PathCount>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeWindow {
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
}

impl TimeWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeWindow::Day => "24h",
            TimeWindow::Week => "7d",
            TimeWindow::Month => "30d",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Day => Duration::hours(24),
            TimeWindow::Week => Duration::days(7),
            TimeWindow::Month => Duration::days(30),
        }
    }

    /// Hourly buckets only make sense over a single day.
    pub fn effective_bucket(&self, requested: Bucket) -> Bucket {
        match self {
            TimeWindow::Day => requested,
            TimeWindow::Week | TimeWindow::Month => Bucket::Day,
        }
    }
}

impl std::str::FromStr for TimeWindow {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "24h" => Ok(TimeWindow::Day),
            "7d" => Ok(TimeWindow::Week),
            "30d" => Ok(TimeWindow::Month),
            _ => Err(LedgerError::ValidationError(format!(
                "Unknown window '{}', expected 24h, 7d or 30d",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Hour,
    Day,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Hour => "hour",
            Bucket::Day => "day",
        }
    }

    /// SQL truncating the canonical `created_at` text to the bucket start.
    fn truncate_sql(&self) -> &'static str {
        match self {
            Bucket::Hour => "substr(created_at, 1, 13) || ':00:00.000000Z'",
            Bucket::Day => "substr(created_at, 1, 10) || 'T00:00:00.000000Z'",
        }
    }
}

impl std::str::FromStr for Bucket {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hour" => Ok(Bucket::Hour),
            "day" => Ok(Bucket::Day),
            _ => Err(LedgerError::ValidationError(format!(
                "Unknown bucket '{}', expected hour or day",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeseriesPoint {
    /// Bucket start, canonical RFC 3339.
    pub ts: String,
    pub events: i64,
    #[serde(flatten)]
    pub by_status: StatusBreakdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeseries {
    pub window: TimeWindow,
    pub bucket: Bucket,
    pub series: Vec<TimeseriesPoint>,
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, tenant_id: Option<&str>, since: Option<&DateTime<Utc>>) {
    let mut joiner = " WHERE ";
    if let Some(tenant_id) = tenant_id {
        qb.push(joiner).push("tenant_id = ").push_bind(tenant_id.to_string());
        joiner = " AND ";
    }
    if let Some(since) = since {
        qb.push(joiner).push("created_at >= ").push_bind(canonical_timestamp(since));
    }
}

fn breakdown(row: &sqlx::sqlite::SqliteRow) -> Result<StatusBreakdown> {
    Ok(StatusBreakdown {
        s2xx: row.try_get("s2xx")?,
        s4xx: row.try_get("s4xx")?,
        s5xx: row.try_get("s5xx")?,
    })
}

fn round_rate(verified: i64, total: i64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let rate = verified as f64 / total as f64;
    (rate * 10_000.0).round() / 10_000.0
}

impl RequestDigestLog {
    pub async fn metrics(&self, ctx: &TenantContext, scope: &MetricsScope) -> Result<AuditMetrics> {
        let tenant_id = scope.resolve(ctx)?;
        let now = utc_now();
        let pool = self.db.pool();

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT COUNT(*) AS events, COUNT(DISTINCT tenant_id) AS tenants, \
             COUNT(DISTINCT actor_ref) AS actors, \
             COALESCE(SUM(CASE WHEN verified_at IS NOT NULL THEN 1 ELSE 0 END), 0) AS verified \
             FROM request_log",
        );
        push_filters(&mut qb, tenant_id, None);
        let row = qb.build().fetch_one(pool).await?;
        let events: i64 = row.try_get("events")?;
        let verified: i64 = row.try_get("verified")?;
        let totals = MetricsTotals {
            events,
            tenants: row.try_get("tenants")?,
            actors: row.try_get("actors")?,
        };

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!("SELECT {} FROM request_log", STATUS_SUMS));
        push_filters(&mut qb, tenant_id, Some(&(now - Duration::hours(24))));
        let row = qb.build().fetch_one(pool).await?;
        let last_24h = RecentActivity {
            events: row.try_get("events")?,
            by_status: breakdown(&row)?,
        };

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT path, COUNT(*) AS count FROM request_log");
        push_filters(&mut qb, tenant_id, Some(&(now - Duration::days(TOP_PATHS_DAYS))));
        qb.push(" GROUP BY path ORDER BY count DESC, path ASC LIMIT ")
            .push_bind(TOP_PATHS_LIMIT);
        let top_paths = qb
            .build()
            .fetch_all(pool)
            .await?
            .iter()
            .map(|row| -> Result<PathCount> {
                Ok(PathCount {
                    path: row.try_get("path")?,
                    count: row.try_get("count")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "Computed request metrics for {} ({} events)",
            tenant_id.unwrap_or("all tenants"),
            events
        );

        Ok(AuditMetrics {
            totals,
            last_24h,
            verification: VerificationCoverage {
                verified,
                unverified: events - verified,
                rate: round_rate(verified, events),
            },
            top_paths,
        })
    }

    /// Request counts per bucket over `window`, oldest bucket first. Empty
    /// buckets are omitted.
    pub async fn timeseries(
        &self,
        ctx: &TenantContext,
        scope: &MetricsScope,
        window: TimeWindow,
        bucket: Bucket,
    ) -> Result<Timeseries> {
        let tenant_id = scope.resolve(ctx)?;
        let bucket = window.effective_bucket(bucket);
        let since = utc_now() - window.duration();

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} AS ts, {} FROM request_log",
            bucket.truncate_sql(),
            STATUS_SUMS
        ));
        push_filters(&mut qb, tenant_id, Some(&since));
        qb.push(" GROUP BY ts ORDER BY ts ASC");

        let series = qb
            .build()
            .fetch_all(self.db.pool())
            .await?
            .iter()
            .map(|row| -> Result<TimeseriesPoint> {
                Ok(TimeseriesPoint {
                    ts: row.try_get("ts")?,
                    events: row.try_get("events")?,
                    by_status: breakdown(row)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "Request timeseries over {} by {}: {} buckets",
            window.as_str(),
            bucket.as_str(),
            series.len()
        );
        Ok(Timeseries { window, bucket, series })
    }
}
