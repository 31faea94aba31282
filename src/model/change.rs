use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{generate_id, Column, Id, LogicalType, SchemaDocument, Table};

/// One atomic schema operation submitted to the coordinator. Immutable once
/// created; persisted as an audit record after a successful apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchemaChange {
    CreateTable {
        table: Table,
    },
    DropTable {
        table_id: Id,
        table_name: String,
    },
    /// Column-level operations on one table. An empty list is the
    /// display-only path (reorder, rename) and executes no DDL.
    AlterTable {
        table_id: Id,
        table_name: String,
        operations: Vec<ColumnOperation>,
    },
    AddForeignKey {
        table_id: Id,
        constraint: ForeignKeyConstraint,
    },
    DropForeignKey {
        table_id: Id,
        constraint: ForeignKeyConstraint,
    },
    /// Document-only edit not scoped to a table (relationship display
    /// columns, phases, relationship metadata).
    UpdateDocument {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

/// Physical operations produced by the table diff. Columns are addressed by
/// their immutable internal name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ColumnOperation {
    AddColumn {
        column: Column,
    },
    DropColumn {
        column_id: Id,
        column_name: String,
    },
    AlterColumnType {
        column_id: Id,
        column_name: String,
        from: LogicalType,
        to: LogicalType,
    },
    AddUniqueConstraint {
        column_id: Id,
        column_name: String,
    },
    DropUniqueConstraint {
        column_id: Id,
        column_name: String,
    },
    AlterColumnDefault {
        column_id: Id,
        column_name: String,
        default_value: Option<String>,
    },
    AlterColumnNullable {
        column_id: Id,
        column_name: String,
        nullable: bool,
    },
}

/// A named foreign-key constraint between two physical tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyConstraint {
    pub name: String,
    pub table_name: String,
    pub column_name: String,
    pub references_table_id: Id,
    pub references_table_name: String,
    pub references_column_name: String,
}

impl ForeignKeyConstraint {
    pub fn constraint_name(table_name: &str, column_name: &str) -> String {
        format!("fk_{}_{}", table_name, column_name)
    }
}

impl SchemaChange {
    /// Table this change is scoped to, if any
    pub fn table_id(&self) -> Option<&Id> {
        match self {
            SchemaChange::CreateTable { table } => Some(&table.id),
            SchemaChange::DropTable { table_id, .. }
            | SchemaChange::AlterTable { table_id, .. }
            | SchemaChange::AddForeignKey { table_id, .. }
            | SchemaChange::DropForeignKey { table_id, .. } => Some(table_id),
            SchemaChange::UpdateDocument { .. } => None,
        }
    }

    /// Whether applying this change executes any physical DDL
    pub fn has_ddl(&self) -> bool {
        match self {
            SchemaChange::AlterTable { operations, .. } => !operations.is_empty(),
            SchemaChange::UpdateDocument { .. } => false,
            _ => true,
        }
    }

    /// Wire name used as `change_type` in the audit log
    pub fn kind(&self) -> &'static str {
        match self {
            SchemaChange::CreateTable { .. } => "create_table",
            SchemaChange::DropTable { .. } => "drop_table",
            SchemaChange::AlterTable { .. } => "alter_table",
            SchemaChange::AddForeignKey { .. } => "add_foreign_key",
            SchemaChange::DropForeignKey { .. } => "drop_foreign_key",
            SchemaChange::UpdateDocument { .. } => "update_document",
        }
    }

    pub fn operation_count(&self) -> usize {
        match self {
            SchemaChange::AlterTable { operations, .. } => operations.len(),
            SchemaChange::UpdateDocument { .. } => 0,
            _ => 1,
        }
    }
}

impl ColumnOperation {
    pub fn column_id(&self) -> &Id {
        match self {
            ColumnOperation::AddColumn { column } => &column.id,
            ColumnOperation::DropColumn { column_id, .. }
            | ColumnOperation::AlterColumnType { column_id, .. }
            | ColumnOperation::AddUniqueConstraint { column_id, .. }
            | ColumnOperation::DropUniqueConstraint { column_id, .. }
            | ColumnOperation::AlterColumnDefault { column_id, .. }
            | ColumnOperation::AlterColumnNullable { column_id, .. } => column_id,
        }
    }
}

/// Append-only audit entry, also what the schema change-feed carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChangeRecord {
    pub id: Id,
    pub project_id: Id,
    pub change_type: String,
    pub change_data: serde_json::Value,
    pub created_by: String,
    pub applied_at: DateTime<Utc>,
    /// Document version produced by this change
    pub version: i64,
}

impl SchemaChangeRecord {
    pub fn new(
        project_id: &Id,
        change: &SchemaChange,
        created_by: &str,
        version: i64,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            id: generate_id(),
            project_id: project_id.clone(),
            change_type: change.kind().to_string(),
            change_data: serde_json::to_value(change)?,
            created_by: created_by.to_string(),
            applied_at: Utc::now(),
            version,
        })
    }
}

/// Request body of the apply endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyRequest {
    pub tenant_id: Id,
    pub project_id: Id,
    pub change: SchemaChange,
    pub full_new_document: SchemaDocument,
    pub observed_version: i64,
    pub user_id: String,
}

/// Response of the apply endpoint. 409/423 hints are retryable conflicts,
/// 503 is a connectivity failure, everything else is fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_hint: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_version: Option<i64>,
    /// Live version when a version conflict was detected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<i64>,
}

impl ApplyResponse {
    pub fn applied(new_version: i64) -> Self {
        Self {
            success: true,
            error: None,
            status_hint: None,
            new_version: Some(new_version),
            current_version: Some(new_version),
        }
    }

    pub fn failed(error: &crate::error::SyncError, current_version: Option<i64>) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            status_hint: Some(error.status_hint()),
            new_version: None,
            current_version,
        }
    }
}
