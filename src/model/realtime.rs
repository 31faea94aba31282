use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Id, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RowEventKind {
    Insert,
    Update,
    Delete,
}

/// Row-level event from the data plane, keyed by internal column names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChangeEvent {
    pub namespace: String,
    pub table: String,
    pub kind: RowEventKind,
    #[serde(default)]
    pub record: Row,
    /// Previous row for updates and deletes, when the feed provides it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_record: Option<Row>,
}

/// Schema-level event: the audit record of an applied change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChangeEvent {
    pub project_id: Id,
    pub change_type: String,
    pub change_data: serde_json::Value,
    pub created_by: String,
    pub applied_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
}

impl From<crate::model::SchemaChangeRecord> for SchemaChangeEvent {
    fn from(record: crate::model::SchemaChangeRecord) -> Self {
        Self {
            project_id: record.project_id,
            change_type: record.change_type,
            change_data: record.change_data,
            created_by: record.created_by,
            applied_at: record.applied_at,
            version: Some(record.version),
        }
    }
}

/// Lifecycle of a feed subscription. Only `Active` guarantees delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Joining,
    /// Joined but not yet confirmed by the feed
    Joined,
    Active,
    Closed,
}

impl SubscriptionState {
    pub fn is_reliable(&self) -> bool {
        *self == SubscriptionState::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Sort and filters for a watched table, addressed by display name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableQuery {
    #[serde(default)]
    pub sort: Vec<(String, SortDirection)>,
    #[serde(default)]
    pub filters: Vec<(String, serde_json::Value)>,
}

/// The same query translated to internal column names for the data plane.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowQuery {
    pub order_by: Vec<(String, SortDirection)>,
    pub filters: Vec<(String, serde_json::Value)>,
}

/// Reconciled, display-keyed row set of one table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciledView {
    pub table_id: Id,
    pub display_name: String,
    pub version: i64,
    pub rows: Vec<Row>,
    /// True when the rows come from an in-place patch after a failed reload
    pub degraded: bool,
}
