//! Rights Request Types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::{LedgerError, Result};

/// Data-subject right being exercised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RightType {
    Access,
    Erasure,
    Portability,
}

impl RightType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RightType::Access => "access",
            RightType::Erasure => "erasure",
            RightType::Portability => "portability",
        }
    }
}

impl std::str::FromStr for RightType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "access" => Ok(RightType::Access),
            "erasure" => Ok(RightType::Erasure),
            "portability" => Ok(RightType::Portability),
            _ => Err(LedgerError::ValidationError(format!("Unsupported right: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Open,
    InProgress,
    Completed,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Open => "open",
            RequestStatus::InProgress => "in_progress",
            RequestStatus::Completed => "completed",
            RequestStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Rejected)
    }

    /// States a transition into `self` may start from.
    pub fn allowed_sources(&self) -> &'static [RequestStatus] {
        match self {
            RequestStatus::Open => &[],
            RequestStatus::InProgress => &[RequestStatus::Open],
            RequestStatus::Completed | RequestStatus::Rejected => {
                &[RequestStatus::Open, RequestStatus::InProgress]
            }
        }
    }

    /// Ledger and webhook event type announcing arrival in this state.
    pub fn event_type(&self) -> &'static str {
        match self {
            RequestStatus::Open => "right.opened",
            RequestStatus::InProgress => "right.in_progress",
            RequestStatus::Completed => "right.completed",
            RequestStatus::Rejected => "right.rejected",
        }
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(RequestStatus::Open),
            "in_progress" => Ok(RequestStatus::InProgress),
            "completed" => Ok(RequestStatus::Completed),
            "rejected" => Ok(RequestStatus::Rejected),
            _ => Err(LedgerError::ValidationError(format!("Unknown request status: {}", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RightsRequest {
    pub id: String,
    pub tenant_id: String,
    pub external_user_id: String,
    pub right: RightType,
    pub status: RequestStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub evidence_ref: Option<String>,
}

impl RightsRequest {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        let right: String = row.try_get("right_type")?;
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            external_user_id: row.try_get("external_user_id")?,
            right: right.parse()?,
            status: status.parse()?,
            opened_at: row.try_get("opened_at")?,
            closed_at: row.try_get("closed_at")?,
            reason: row.try_get("reason")?,
            evidence_ref: row.try_get("evidence_ref")?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct RightsFilter {
    pub status: Option<RequestStatus>,
    pub right: Option<RightType>,
}
