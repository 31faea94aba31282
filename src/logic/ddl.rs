//! Postgres statements for a [`SchemaChange`]. Every statement is idempotent
//! so a resubmitted apply never fails on objects the first attempt created.

use crate::error::{SyncError, SyncResult};
use crate::model::{
    is_valid_identifier, Column, ColumnOperation, ForeignKeyConstraint, LogicalType, SchemaChange,
    Table,
};

pub struct DdlRenderer;

/// Default expressions passed through unquoted
const SQL_FUNCTIONS: &[&str] = &[
    "now()",
    "current_timestamp",
    "current_date",
    "gen_random_uuid()",
];

impl DdlRenderer {
    pub fn render(namespace: &str, change: &SchemaChange) -> SyncResult<Vec<String>> {
        let ns = ident(namespace)?;

        match change {
            SchemaChange::CreateTable { table } => Ok(vec![Self::create_table(&ns, table)?]),
            SchemaChange::DropTable { table_name, .. } => Ok(vec![format!(
                "DROP TABLE IF EXISTS {}.{}",
                ns,
                ident(table_name)?
            )]),
            SchemaChange::AlterTable {
                table_name,
                operations,
                ..
            } => {
                let target = format!("{}.{}", ns, ident(table_name)?);
                let mut statements = Vec::new();
                for op in operations {
                    statements.extend(Self::column_operation(&target, table_name, op)?);
                }
                Ok(statements)
            }
            SchemaChange::AddForeignKey { constraint, .. } => {
                Ok(vec![Self::add_foreign_key(&ns, constraint)?])
            }
            SchemaChange::DropForeignKey { constraint, .. } => Ok(vec![format!(
                "ALTER TABLE {}.{} DROP CONSTRAINT IF EXISTS {}",
                ns,
                ident(&constraint.table_name)?,
                ident(&constraint.name)?
            )]),
            SchemaChange::UpdateDocument { .. } => Ok(Vec::new()),
        }
    }

    pub fn unique_constraint_name(table_name: &str, column_name: &str) -> String {
        format!("uq_{}_{}", table_name, column_name)
    }

    /// Quoted physical identifier, rejecting anything outside the allowed alphabet
    pub fn quote_ident(name: &str) -> SyncResult<String> {
        ident(name)
    }

    fn create_table(ns: &str, table: &Table) -> SyncResult<String> {
        if table.columns.is_empty() {
            return Err(SyncError::Validation(format!(
                "Table '{}' needs at least one column",
                table.name
            )));
        }

        let mut parts = Vec::with_capacity(table.columns.len() + 1);
        for column in &table.columns {
            parts.push(column_definition(column)?);
        }

        let primary_keys = table
            .primary_key_columns()
            .map(|c| ident(&c.internal_name))
            .collect::<SyncResult<Vec<_>>>()?;
        if !primary_keys.is_empty() {
            parts.push(format!("PRIMARY KEY ({})", primary_keys.join(", ")));
        }

        for column in table.columns.iter().filter(|c| c.unique && !c.primary_key) {
            parts.push(format!(
                "CONSTRAINT {} UNIQUE ({})",
                ident(&Self::unique_constraint_name(&table.internal_name, &column.internal_name))?,
                ident(&column.internal_name)?
            ));
        }

        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {}.{} ({})",
            ns,
            ident(&table.internal_name)?,
            parts.join(", ")
        ))
    }

    fn column_operation(
        target: &str,
        table_name: &str,
        op: &ColumnOperation,
    ) -> SyncResult<Vec<String>> {
        let statements = match op {
            ColumnOperation::AddColumn { column } => {
                let mut statements = vec![format!(
                    "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}",
                    target,
                    column_definition(column)?
                )];
                if column.unique && !column.primary_key {
                    statements.push(add_unique(target, table_name, &column.internal_name)?);
                }
                statements
            }
            ColumnOperation::DropColumn { column_name, .. } => vec![format!(
                "ALTER TABLE {} DROP COLUMN IF EXISTS {}",
                target,
                ident(column_name)?
            )],
            ColumnOperation::AlterColumnType {
                column_name, to, ..
            } => {
                let column = ident(column_name)?;
                vec![format!(
                    "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{}",
                    target,
                    column,
                    to.sql_type(),
                    column,
                    to.sql_type()
                )]
            }
            ColumnOperation::AddUniqueConstraint { column_name, .. } => {
                vec![add_unique(target, table_name, column_name)?]
            }
            ColumnOperation::DropUniqueConstraint { column_name, .. } => vec![format!(
                "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
                target,
                ident(&Self::unique_constraint_name(table_name, column_name))?
            )],
            ColumnOperation::AlterColumnDefault {
                column_name,
                default_value,
                ..
            } => {
                let column = ident(column_name)?;
                match default_value {
                    Some(value) => vec![format!(
                        "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
                        target,
                        column,
                        default_expression(value)
                    )],
                    None => vec![format!(
                        "ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT",
                        target, column
                    )],
                }
            }
            ColumnOperation::AlterColumnNullable {
                column_name,
                nullable,
                ..
            } => vec![format!(
                "ALTER TABLE {} ALTER COLUMN {} {} NOT NULL",
                target,
                ident(column_name)?,
                if *nullable { "DROP" } else { "SET" }
            )],
        };

        Ok(statements)
    }

    fn add_foreign_key(ns: &str, constraint: &ForeignKeyConstraint) -> SyncResult<String> {
        let statement = format!(
            "ALTER TABLE {ns}.{table} ADD CONSTRAINT {name} FOREIGN KEY ({column}) REFERENCES {ns}.{ref_table} ({ref_column})",
            ns = ns,
            table = ident(&constraint.table_name)?,
            name = ident(&constraint.name)?,
            column = ident(&constraint.column_name)?,
            ref_table = ident(&constraint.references_table_name)?,
            ref_column = ident(&constraint.references_column_name)?,
        );
        Ok(guard_duplicate(&statement))
    }
}

fn add_unique(target: &str, table_name: &str, column_name: &str) -> SyncResult<String> {
    let statement = format!(
        "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
        target,
        ident(&DdlRenderer::unique_constraint_name(table_name, column_name))?,
        ident(column_name)?
    );
    Ok(guard_duplicate(&statement))
}

/// `ADD CONSTRAINT` has no `IF NOT EXISTS`; swallow the duplicate instead.
fn guard_duplicate(statement: &str) -> String {
    format!(
        "DO $$ BEGIN {}; EXCEPTION WHEN duplicate_object OR duplicate_table THEN NULL; END $$",
        statement
    )
}

fn column_definition(column: &Column) -> SyncResult<String> {
    let mut definition = format!("{} {}", ident(&column.internal_name)?, column.data_type.sql_type());

    if column.auto_increment && column.data_type.is_integer() {
        definition.push_str(" GENERATED BY DEFAULT AS IDENTITY");
    } else if let Some(value) = &column.default_value {
        definition.push_str(" DEFAULT ");
        definition.push_str(&default_expression(value));
    } else if column.auto_generate {
        match column.data_type {
            LogicalType::Uuid => definition.push_str(" DEFAULT gen_random_uuid()"),
            LogicalType::Timestamp => definition.push_str(" DEFAULT now()"),
            LogicalType::Date => definition.push_str(" DEFAULT current_date"),
            _ => {}
        }
    }

    if !column.nullable || column.primary_key {
        definition.push_str(" NOT NULL");
    }

    Ok(definition)
}

/// Finite numbers, booleans, NULL and a few well-known functions pass through;
/// everything else becomes a quoted string literal.
fn default_expression(value: &str) -> String {
    let trimmed = value.trim();
    let lowered = trimmed.to_ascii_lowercase();

    if trimmed.parse::<f64>().is_ok_and(f64::is_finite)
        || matches!(lowered.as_str(), "true" | "false" | "null")
        || SQL_FUNCTIONS.contains(&lowered.as_str())
    {
        return lowered;
    }

    let unquoted = trimmed
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .unwrap_or(trimmed);
    format!("'{}'", unquoted.replace('\'', "''"))
}

fn ident(name: &str) -> SyncResult<String> {
    if is_valid_identifier(name) {
        Ok(format!("\"{}\"", name))
    } else {
        Err(SyncError::Validation(format!(
            "'{}' is not a valid physical identifier",
            name
        )))
    }
}
