//! Core domain model for the asset inventory mirror.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "aim-core";

/// Local mirror row for one hardware asset, keyed by the upstream numeric id.
///
/// Fields are overwritten on every sync that returns the same id; the engine
/// never deletes a row except while repairing a tag-uniqueness conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: i64,
    pub asset_name: String,
    /// Business key; unique across all rows, enforced by the storage layer.
    pub asset_tag: String,
    pub serial: Option<String>,
    pub model: Option<String>,
    pub model_no: Option<String>,
    pub status: Option<String>,
    pub category: Option<String>,
    pub manufacturer: Option<String>,
    pub location: Option<String>,
    pub company: Option<String>,
    /// Resolved department name, plain text (not a foreign key).
    pub department: Option<String>,
    pub assigned_user: Option<String>,
    pub warranty_months: Option<i64>,
    pub warranty_expires: Option<NaiveDate>,
    /// Opaque upstream timestamp string; never parsed at storage time.
    pub created_at: Option<String>,
}

/// Local mirror row for one directory user, keyed by the upstream numeric id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    /// Free-text region field from the directory payload.
    pub region: Option<String>,
    pub department_id: Option<i64>,
    pub department_name: Option<String>,
    pub location_id: Option<i64>,
    pub assets_count: Option<i64>,
    pub license_count: Option<i64>,
}

/// Which entity types a sync invocation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncScope {
    Assets,
    Users,
    All,
}

impl std::fmt::Display for SyncScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncScope::Assets => write!(f, "assets"),
            SyncScope::Users => write!(f, "users"),
            SyncScope::All => write!(f, "all"),
        }
    }
}

impl std::str::FromStr for SyncScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "assets" => Ok(SyncScope::Assets),
            "users" => Ok(SyncScope::Users),
            "all" => Ok(SyncScope::All),
            other => Err(format!("unknown sync scope {other:?}")),
        }
    }
}

/// Counters for one entity phase (assets or users) of a sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySyncSummary {
    pub run_id: Uuid,
    pub scope: SyncScope,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_fetched: u32,
    pub rows_seen: u64,
    pub rows_upserted: u64,
    pub conflicts_repaired: u32,
    pub batches_committed: u32,
}

/// Outcome of one sync invocation; surfaced via logs and the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub scope: SyncScope,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub assets: Option<EntitySyncSummary>,
    pub users: Option<EntitySyncSummary>,
}

impl SyncReport {
    pub fn rows_upserted(&self) -> u64 {
        self.assets.as_ref().map_or(0, |s| s.rows_upserted)
            + self.users.as_ref().map_or(0, |s| s.rows_upserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_scope_round_trips_through_str() {
        for scope in [SyncScope::Assets, SyncScope::Users, SyncScope::All] {
            let parsed: SyncScope = scope.to_string().parse().expect("parse");
            assert_eq!(parsed, scope);
        }
        assert!("everything".parse::<SyncScope>().is_err());
    }
}
