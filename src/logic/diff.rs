use std::collections::{HashMap, HashSet};

use crate::error::{SyncError, SyncResult};
use crate::model::{Column, ColumnOperation, Id, SchemaChange, Table};

/// Computes the physical operations that take a table from one definition
/// to another. Columns are matched by stable id, never by position or name.
pub struct TableDiffEngine;

impl TableDiffEngine {
    /// Ordered operations: added columns, removed columns, type changes,
    /// then uniqueness/default/nullability changes. Reorders and display
    /// renames produce nothing.
    pub fn diff(old: &Table, new: &Table) -> SyncResult<Vec<ColumnOperation>> {
        Self::check_comparable(old, new)?;

        let old_columns: HashMap<&Id, &Column> = old.columns.iter().map(|c| (&c.id, c)).collect();
        let new_ids: HashSet<&Id> = new.columns.iter().map(|c| &c.id).collect();
        let old_internal: HashSet<&str> = old.columns.iter().map(|c| c.internal_name.as_str()).collect();

        let mut operations = Vec::new();

        // 1. Added
        for column in new.columns.iter().filter(|c| !old_columns.contains_key(&c.id)) {
            if old_internal.contains(column.internal_name.as_str()) {
                return Err(SyncError::Validation(format!(
                    "New column '{}' reuses the physical name '{}' of an existing column",
                    column.name, column.internal_name
                )));
            }
            operations.push(ColumnOperation::AddColumn {
                column: column.clone(),
            });
        }

        // 2. Removed
        for column in old.columns.iter().filter(|c| !new_ids.contains(&c.id)) {
            operations.push(ColumnOperation::DropColumn {
                column_id: column.id.clone(),
                column_name: column.internal_name.clone(),
            });
        }

        let retained: Vec<(&Column, &Column)> = new
            .columns
            .iter()
            .filter_map(|c| old_columns.get(&c.id).map(|before| (*before, c)))
            .collect();

        // 3. Type changes
        for (before, after) in &retained {
            if before.data_type != after.data_type {
                operations.push(ColumnOperation::AlterColumnType {
                    column_id: after.id.clone(),
                    column_name: after.internal_name.clone(),
                    from: before.data_type,
                    to: after.data_type,
                });
            }
        }

        // 4. Constraints
        for (before, after) in &retained {
            if before.unique != after.unique {
                let column_id = after.id.clone();
                let column_name = after.internal_name.clone();
                operations.push(if after.unique {
                    ColumnOperation::AddUniqueConstraint { column_id, column_name }
                } else {
                    ColumnOperation::DropUniqueConstraint { column_id, column_name }
                });
            }
            if before.default_value != after.default_value {
                operations.push(ColumnOperation::AlterColumnDefault {
                    column_id: after.id.clone(),
                    column_name: after.internal_name.clone(),
                    default_value: after.default_value.clone(),
                });
            }
            if before.nullable != after.nullable {
                operations.push(ColumnOperation::AlterColumnNullable {
                    column_id: after.id.clone(),
                    column_name: after.internal_name.clone(),
                    nullable: after.nullable,
                });
            }
        }

        Ok(operations)
    }

    /// The diff wrapped as one `AlterTable` change (possibly with no operations)
    pub fn diff_change(old: &Table, new: &Table) -> SyncResult<SchemaChange> {
        Ok(SchemaChange::AlterTable {
            table_id: new.id.clone(),
            table_name: new.internal_name.clone(),
            operations: Self::diff(old, new)?,
        })
    }

    /// True when only display names or column order differ
    pub fn is_display_only(old: &Table, new: &Table) -> SyncResult<bool> {
        Ok(Self::diff(old, new)?.is_empty())
    }

    fn check_comparable(old: &Table, new: &Table) -> SyncResult<()> {
        if old.id != new.id {
            return Err(SyncError::Validation(format!(
                "Cannot diff table '{}' against a different table '{}'",
                old.id, new.id
            )));
        }
        if old.internal_name != new.internal_name {
            return Err(SyncError::Validation(format!(
                "Physical name of table '{}' cannot change ({} -> {})",
                new.name, old.internal_name, new.internal_name
            )));
        }

        let mut seen = HashSet::new();
        for column in &new.columns {
            if !seen.insert(&column.id) {
                return Err(SyncError::Validation(format!(
                    "Column id '{}' appears twice in table '{}'",
                    column.id, new.name
                )));
            }
        }

        for column in &new.columns {
            if let Some(before) = old.get_column(&column.id) {
                if before.internal_name != column.internal_name {
                    return Err(SyncError::Validation(format!(
                        "Physical name of column '{}' cannot change ({} -> {})",
                        column.name, before.internal_name, column.internal_name
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogicalType;

    fn orders() -> Table {
        let mut total = Column::new("Total", LogicalType::Decimal);
        total.nullable = false;
        Table::new("Orders")
            .with_column(Column::primary_key("id"))
            .with_column(Column::new("Reference", LogicalType::Text))
            .with_column(total)
    }

    #[test]
    fn test_self_diff_is_empty() {
        let table = orders();
        assert!(TableDiffEngine::diff(&table, &table).unwrap().is_empty());
    }

    #[test]
    fn test_reorder_and_rename_emit_nothing() {
        let old = orders();
        let mut new = old.clone();
        new.columns.swap(1, 2);
        new.columns[1].name = "Order total".to_string();
        new.name = "Purchase orders".to_string();

        assert!(TableDiffEngine::is_display_only(&old, &new).unwrap());
        match TableDiffEngine::diff_change(&old, &new).unwrap() {
            SchemaChange::AlterTable { operations, table_name, .. } => {
                assert!(operations.is_empty());
                assert_eq!(table_name, old.internal_name);
            }
            other => panic!("unexpected change: {:?}", other),
        }
    }

    #[test]
    fn test_operations_follow_category_order() {
        let old = orders();
        let mut new = old.clone();

        // Nullable toggle listed first in the column order, type change later
        new.columns[1].nullable = false;
        new.columns[1].unique = true;
        new.columns[2].data_type = LogicalType::Integer;
        new.columns[2].default_value = Some("0".to_string());
        let dropped = new.columns.remove(0);
        let added = Column::new("Notes", LogicalType::Text);
        new.columns.insert(0, added.clone());

        let operations = TableDiffEngine::diff(&old, &new).unwrap();
        let kinds: Vec<&str> = operations
            .iter()
            .map(|op| match op {
                ColumnOperation::AddColumn { .. } => "add",
                ColumnOperation::DropColumn { .. } => "drop",
                ColumnOperation::AlterColumnType { .. } => "type",
                ColumnOperation::AddUniqueConstraint { .. } => "unique",
                ColumnOperation::DropUniqueConstraint { .. } => "drop_unique",
                ColumnOperation::AlterColumnDefault { .. } => "default",
                ColumnOperation::AlterColumnNullable { .. } => "nullable",
            })
            .collect();
        assert_eq!(kinds, vec!["add", "drop", "type", "unique", "nullable", "default"]);

        assert_eq!(operations[0].column_id(), &added.id);
        match &operations[1] {
            ColumnOperation::DropColumn { column_name, .. } => {
                assert_eq!(column_name, &dropped.internal_name)
            }
            other => panic!("unexpected operation: {:?}", other),
        }
    }

    #[test]
    fn test_physical_names_are_immutable() {
        let old = orders();
        let mut new = old.clone();
        new.columns[1].internal_name = "c_renamed".to_string();
        assert!(matches!(
            TableDiffEngine::diff(&old, &new),
            Err(SyncError::Validation(_))
        ));

        let other = Table::new("Other");
        assert!(TableDiffEngine::diff(&old, &other).is_err());
    }

    #[test]
    fn test_recreated_column_cannot_reuse_physical_name() {
        let old = orders();
        let mut new = old.clone();
        let mut recreated = new.columns.remove(1);
        recreated.id = "brand-new".to_string();
        new.columns.push(recreated);

        assert!(TableDiffEngine::diff(&old, &new).is_err());
    }
}
