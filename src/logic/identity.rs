//! Translation between physical row payloads (keyed by internal column names)
//! and user-facing payloads (keyed by display names).

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{SyncError, SyncResult};
use crate::model::{Id, Row, RowQuery, SchemaDocument, Table, TableQuery};

/// Display key every table's identity column is surfaced under
pub const IDENTITY_KEY: &str = "id";

#[derive(Debug, Clone)]
struct TableMapping {
    internal_name: String,
    display_name: String,
    fingerprint: String,
    version: i64,
    identity: Option<String>,
    column_internal: HashMap<Id, String>,
    to_display: HashMap<String, String>,
    to_internal: HashMap<String, String>,
}

impl TableMapping {
    fn build(table: &Table, version: i64) -> Self {
        let identity = table.identity_column().map(|c| c.internal_name.clone());

        let mut to_display = HashMap::with_capacity(table.columns.len());
        let mut to_internal = HashMap::with_capacity(table.columns.len());
        let mut column_internal = HashMap::with_capacity(table.columns.len());

        if let Some(identity) = &identity {
            to_display.insert(identity.clone(), IDENTITY_KEY.to_string());
            to_internal.insert(IDENTITY_KEY.to_string(), identity.clone());
        }

        for column in &table.columns {
            column_internal.insert(column.id.clone(), column.internal_name.clone());
            if identity.as_deref() == Some(column.internal_name.as_str()) {
                continue;
            }
            // Display names are not unique; a taken name falls back to the
            // physical one so no two keys collide
            let display = if to_internal.contains_key(&column.name) {
                column.internal_name.clone()
            } else {
                column.name.clone()
            };
            to_internal.insert(display.clone(), column.internal_name.clone());
            to_display.insert(column.internal_name.clone(), display);
        }

        Self {
            internal_name: table.internal_name.clone(),
            display_name: table.name.clone(),
            fingerprint: table.fingerprint(),
            version,
            identity,
            column_internal,
            to_display,
            to_internal,
        }
    }
}

/// Per-project cache of table mappings. Entries are rebuilt whenever the
/// table's fingerprint moves, so rows are never keyed by an outdated mapping.
#[derive(Debug, Default)]
pub struct ColumnIdentityMapper {
    tables: RwLock<HashMap<Id, TableMapping>>,
}

impl ColumnIdentityMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_document(document: &SchemaDocument) -> Self {
        let mapper = Self::new();
        mapper.rebuild_document(document);
        mapper
    }

    /// Rebuild every table and forget tables no longer in the document
    pub fn rebuild_document(&self, document: &SchemaDocument) {
        let mut tables = self.tables.write();
        tables.clear();
        for table in &document.tables {
            tables.insert(table.id.clone(), TableMapping::build(table, document.version));
        }
    }

    pub fn rebuild_table(&self, table: &Table, version: i64) {
        self.tables
            .write()
            .insert(table.id.clone(), TableMapping::build(table, version));
    }

    pub fn remove_table(&self, table_id: &Id) {
        self.tables.write().remove(table_id);
    }

    /// Whether the cached entry no longer describes `table`
    pub fn is_stale(&self, table: &Table) -> bool {
        match self.tables.read().get(&table.id) {
            Some(mapping) => mapping.fingerprint != table.fingerprint(),
            None => true,
        }
    }

    /// Rebuild the entry if it is stale. Returns true when it was rebuilt.
    pub fn ensure_fresh(&self, table: &Table, version: i64) -> bool {
        if self.is_stale(table) {
            log::debug!(
                "Rebuilding column mapping of table {} ({}) at version {}",
                table.name,
                table.id,
                version
            );
            self.rebuild_table(table, version);
            true
        } else {
            false
        }
    }

    /// Document version the table's entry was built from
    pub fn mapped_version(&self, table_id: &Id) -> Option<i64> {
        self.tables.read().get(table_id).map(|m| m.version)
    }

    pub fn physical_table(&self, table_id: &Id) -> Option<String> {
        self.tables.read().get(table_id).map(|m| m.internal_name.clone())
    }

    pub fn display_table(&self, table_id: &Id) -> Option<String> {
        self.tables.read().get(table_id).map(|m| m.display_name.clone())
    }

    pub fn internal_name_of(&self, table_id: &Id, column_id: &Id) -> Option<String> {
        self.tables
            .read()
            .get(table_id)
            .and_then(|m| m.column_internal.get(column_id).cloned())
    }

    pub fn display_name_of(&self, table_id: &Id, internal_name: &str) -> Option<String> {
        self.tables
            .read()
            .get(table_id)
            .and_then(|m| m.to_display.get(internal_name).cloned())
    }

    pub fn internal_name_for_display(&self, table_id: &Id, display_name: &str) -> Option<String> {
        self.tables
            .read()
            .get(table_id)
            .and_then(|m| m.to_internal.get(display_name).cloned())
    }

    pub fn identity_internal_name(&self, table_id: &Id) -> Option<String> {
        self.tables.read().get(table_id).and_then(|m| m.identity.clone())
    }

    /// Physical row to display row. Physical columns the document does not
    /// describe are not user-visible and are left out.
    pub fn to_display_row(&self, table_id: &Id, row: &Row) -> SyncResult<Row> {
        let tables = self.tables.read();
        let mapping = tables
            .get(table_id)
            .ok_or_else(|| SyncError::NotFound(format!("no column mapping for table {}", table_id)))?;

        Ok(row
            .iter()
            .filter_map(|(internal, value)| {
                mapping
                    .to_display
                    .get(internal)
                    .map(|display| (display.clone(), value.clone()))
            })
            .collect())
    }

    pub fn to_display_rows(&self, table_id: &Id, rows: &[Row]) -> SyncResult<Vec<Row>> {
        rows.iter().map(|row| self.to_display_row(table_id, row)).collect()
    }

    /// Display row to physical row; unknown display keys are rejected.
    pub fn to_internal_row(&self, table_id: &Id, row: &Row) -> SyncResult<Row> {
        let tables = self.tables.read();
        let mapping = tables
            .get(table_id)
            .ok_or_else(|| SyncError::NotFound(format!("no column mapping for table {}", table_id)))?;

        row.iter()
            .map(|(display, value)| {
                mapping
                    .to_internal
                    .get(display)
                    .map(|internal| (internal.clone(), value.clone()))
                    .ok_or_else(|| {
                        SyncError::Validation(format!(
                            "table '{}' has no column '{}'",
                            mapping.display_name, display
                        ))
                    })
            })
            .collect()
    }

    pub fn translate_query(&self, table_id: &Id, query: &TableQuery) -> SyncResult<RowQuery> {
        let lookup = |display: &str| {
            self.internal_name_for_display(table_id, display).ok_or_else(|| {
                SyncError::Validation(format!("unknown column '{}' in table query", display))
            })
        };

        let mut translated = RowQuery::default();
        for (column, direction) in &query.sort {
            translated.order_by.push((lookup(column)?, *direction));
        }
        for (column, value) in &query.filters {
            translated.filters.push((lookup(column)?, value.clone()));
        }
        Ok(translated)
    }
}
