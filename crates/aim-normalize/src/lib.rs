//! Normalization of upstream wire rows into flat mirror rows, plus the
//! per-run department lookup used to resolve asset assignments.

use std::collections::HashMap;

use aim_client::{AssignmentTarget, DirectoryUserRow, HardwareRow, InventorySource, SourceError};
use aim_core::{AssetRecord, UserRecord};
use chrono::NaiveDate;
use scraper::Html;
use tracing::warn;

pub const CRATE_NAME: &str = "aim-normalize";

/// Decode HTML-entity-escaped text (`R&amp;D` -> `R&D`) into plain text.
pub fn decode_entities(raw: &str) -> String {
    let fragment = Html::parse_fragment(raw);
    fragment.root_element().text().collect::<String>()
}

/// Mapping from user id to department name, built from one fully drained
/// users fetch. Scoped to a single sync invocation: construct it at the start
/// of a run and drop it with the run, never cache it process-wide.
#[derive(Debug, Clone, Default)]
pub struct DepartmentLookup {
    by_user: HashMap<i64, String>,
}

impl DepartmentLookup {
    /// Drain the users listing page by page and record each user's
    /// department name, entity-decoded.
    pub async fn build<C>(source: &C, page_limit: u32) -> Result<Self, SourceError>
    where
        C: InventorySource + ?Sized,
    {
        let mut by_user = HashMap::new();
        let mut offset = 0;
        loop {
            let (rows, has_more) = source.fetch_users_page(offset, page_limit).await?;
            for user in &rows {
                if let Some(name) = user.department.as_ref().and_then(|d| d.name.as_deref()) {
                    by_user.insert(user.id, decode_entities(name));
                }
            }
            if !has_more {
                break;
            }
            offset += page_limit;
        }
        Ok(Self { by_user })
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (i64, String)>) -> Self {
        Self {
            by_user: entries.into_iter().collect(),
        }
    }

    pub fn department_for(&self, user_id: i64) -> Option<&str> {
        self.by_user.get(&user_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_user.is_empty()
    }
}

/// Resolved assignment fields for one hardware row.
struct Assignment {
    assigned_user: Option<String>,
    department: Option<String>,
}

fn resolve_assignment(target: Option<&AssignmentTarget>, lookup: &DepartmentLookup) -> Assignment {
    let Some(target) = target else {
        return Assignment {
            assigned_user: None,
            department: None,
        };
    };

    match target.kind.as_deref() {
        Some("user") => {
            let joined = format!(
                "{} {}",
                target.first_name.as_deref().unwrap_or_default(),
                target.last_name.as_deref().unwrap_or_default()
            );
            let joined = joined.trim().to_string();
            let assigned_user = if joined.is_empty() {
                target.name.clone()
            } else {
                Some(joined)
            };
            let department = target
                .id
                .and_then(|id| lookup.department_for(id))
                .map(str::to_string);
            Assignment {
                assigned_user,
                department,
            }
        }
        Some("department") => Assignment {
            assigned_user: None,
            department: target.name.as_deref().map(decode_entities),
        },
        _ => Assignment {
            assigned_user: None,
            department: None,
        },
    }
}

fn parse_warranty_date(asset_id: i64, raw: &str) -> Option<NaiveDate> {
    match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        Ok(date) => Some(date),
        Err(err) => {
            warn!(asset_id, raw, error = %err, "unparseable warranty expiry; storing null");
            None
        }
    }
}

/// Flatten one upstream hardware row into the local mirror shape.
pub fn normalize_hardware(row: &HardwareRow, lookup: &DepartmentLookup) -> AssetRecord {
    let asset_tag = row.asset_tag.clone().unwrap_or_default();
    let asset_name = row
        .name
        .clone()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| asset_tag.clone());

    let assignment = resolve_assignment(row.assigned_to.as_ref(), lookup);

    AssetRecord {
        id: row.id,
        asset_name,
        asset_tag,
        serial: row.serial.clone(),
        model: row.model.as_ref().and_then(|m| m.name.clone()),
        model_no: row.model_number.clone(),
        status: row.status_label.as_ref().and_then(|s| s.name.clone()),
        category: row.category.as_ref().and_then(|c| c.name.clone()),
        manufacturer: row.manufacturer.as_ref().and_then(|m| m.name.clone()),
        location: row.location.as_ref().and_then(|l| l.name.clone()),
        company: row.company.as_ref().and_then(|c| c.name.clone()),
        department: assignment.department,
        assigned_user: assignment.assigned_user,
        warranty_months: row.warranty_months,
        warranty_expires: row
            .warranty_expires
            .as_ref()
            .and_then(|w| w.date())
            .and_then(|raw| parse_warranty_date(row.id, raw)),
        created_at: row.created_at.as_ref().and_then(|c| c.datetime.clone()),
    }
}

/// Flatten one upstream directory user into the local mirror shape.
pub fn normalize_user(row: &DirectoryUserRow) -> UserRecord {
    UserRecord {
        id: row.id,
        first_name: row.first_name.clone(),
        last_name: row.last_name.clone(),
        username: row.username.clone(),
        email: row.email.clone(),
        region: row.country.clone(),
        department_id: row.department.as_ref().and_then(|d| d.id),
        department_name: row
            .department
            .as_ref()
            .and_then(|d| d.name.as_deref())
            .map(decode_entities),
        location_id: row.location.as_ref().and_then(|l| l.id),
        assets_count: row.assets_count,
        license_count: row.licenses_count,
    }
}
