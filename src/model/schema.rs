use crate::model::{generate_id, generate_internal_name, is_valid_identifier, Id, LogicalType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

fn default_true() -> bool {
    true
}

/// The control-plane description of one project. Stored as a single JSON blob
/// per project; `version` moves forward by exactly one per applied change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDocument {
    /// Project this document describes
    pub project_id: Id,
    pub version: i64,
    pub tables: Vec<Table>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    /// Which column of the target table is shown when a relationship is rendered
    #[serde(default)]
    pub relationship_display_columns: Vec<RelationshipDisplayColumn>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub id: Id,
    /// Display name, freely editable
    pub name: String,
    /// Physical name, fixed at creation
    pub internal_name: String,
    pub columns: Vec<Column>,
    #[serde(default)]
    pub is_junction: bool,
    /// Optional grouping shown by the editor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Relationship that synthesized this table, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesized_by: Option<Id>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub id: Id,
    /// Display name, freely editable
    pub name: String,
    /// Physical name, fixed for the lifetime of the column
    pub internal_name: String,
    pub data_type: LogicalType,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub unique: bool,
    /// SQL default expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default)]
    pub auto_generate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<ForeignKeyRef>,
    /// Relationship that synthesized this column, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesized_by: Option<Id>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub table_id: Id,
    pub column_id: Id,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelationshipType {
    OneToOne,
    OneToMany,
    ManyToMany,
}

/// For one-to-one and one-to-many, `from` is the referenced ("one") side and
/// `to` holds the foreign-key column. For many-to-many both columns are the
/// primary keys of their tables and `junction_table_id` names the link table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: Id,
    pub relationship_type: RelationshipType,
    pub from_table_id: Id,
    pub from_column_id: Id,
    pub to_table_id: Id,
    pub to_column_id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub junction_table_id: Option<Id>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDisplayColumn {
    pub relationship_id: Id,
    pub table_id: Id,
    pub column_id: Id,
}

impl Column {
    /// New column with a freshly allocated internal name
    pub fn new(name: impl Into<String>, data_type: LogicalType) -> Self {
        Self {
            id: generate_id(),
            name: name.into(),
            internal_name: generate_internal_name("c"),
            data_type,
            nullable: true,
            unique: false,
            default_value: None,
            primary_key: false,
            auto_increment: false,
            auto_generate: false,
            foreign_key: None,
            synthesized_by: None,
        }
    }

    /// Auto-generated UUID primary key, the default identity column
    pub fn primary_key(name: impl Into<String>) -> Self {
        Self {
            nullable: false,
            primary_key: true,
            auto_generate: true,
            ..Self::new(name, LogicalType::Uuid)
        }
    }

    pub fn is_foreign_key(&self) -> bool {
        self.foreign_key.is_some()
    }
}

impl Table {
    /// New table with a freshly allocated internal name and no columns
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            name: name.into(),
            internal_name: generate_internal_name("t"),
            columns: Vec::new(),
            is_junction: false,
            phase: None,
            synthesized_by: None,
        }
    }

    pub fn with_column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn get_column(&self, column_id: &Id) -> Option<&Column> {
        self.columns.iter().find(|c| &c.id == column_id)
    }

    pub fn get_column_mut(&mut self, column_id: &Id) -> Option<&mut Column> {
        self.columns.iter_mut().find(|c| &c.id == column_id)
    }

    pub fn get_column_by_internal(&self, internal_name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.internal_name == internal_name)
    }

    pub fn primary_key_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.primary_key)
    }

    /// The one column surfaced as `id` in every row set: the first primary
    /// key column, else a column physically named `id`, else the first column.
    pub fn identity_column(&self) -> Option<&Column> {
        self.primary_key_columns()
            .next()
            .or_else(|| self.columns.iter().find(|c| c.internal_name == "id"))
            .or_else(|| self.columns.first())
    }

    /// Foreign-key column on this table referencing `table_id`, if any
    pub fn foreign_key_to(&self, table_id: &Id) -> Option<&Column> {
        self.columns.iter().find(|c| {
            c.foreign_key
                .as_ref()
                .map(|fk| &fk.table_id == table_id)
                .unwrap_or(false)
        })
    }

    /// Hash of everything the identity mapping depends on.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(format!("table:{}:{}:{}\n", self.id, self.internal_name, self.name));
        for column in &self.columns {
            hasher.update(format!(
                "column:{}:{}:{}:{}\n",
                column.id, column.internal_name, column.name, column.primary_key
            ));
        }

        hex::encode(hasher.finalize())
    }
}

impl SchemaDocument {
    pub fn new(project_id: impl Into<Id>) -> Self {
        Self {
            project_id: project_id.into(),
            version: 0,
            tables: Vec::new(),
            relationships: Vec::new(),
            relationship_display_columns: Vec::new(),
        }
    }

    pub fn get_table(&self, table_id: &Id) -> Option<&Table> {
        self.tables.iter().find(|t| &t.id == table_id)
    }

    pub fn get_table_mut(&mut self, table_id: &Id) -> Option<&mut Table> {
        self.tables.iter_mut().find(|t| &t.id == table_id)
    }

    pub fn get_table_by_internal(&self, internal_name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.internal_name == internal_name)
    }

    pub fn get_relationship(&self, relationship_id: &Id) -> Option<&Relationship> {
        self.relationships.iter().find(|r| &r.id == relationship_id)
    }

    pub fn get_relationship_mut(&mut self, relationship_id: &Id) -> Option<&mut Relationship> {
        self.relationships.iter_mut().find(|r| &r.id == relationship_id)
    }

    /// Replace the table with the same id in place, or append it.
    pub fn upsert_table(&mut self, table: Table) {
        match self.tables.iter_mut().find(|t| t.id == table.id) {
            Some(existing) => *existing = table,
            None => self.tables.push(table),
        }
    }

    /// Remove a table together with the relationships and display columns
    /// that reference it.
    pub fn remove_table(&mut self, table_id: &Id) -> Option<Table> {
        let position = self.tables.iter().position(|t| &t.id == table_id)?;
        let removed = self.tables.remove(position);

        let dropped: HashSet<Id> = self
            .relationships
            .iter()
            .filter(|r| &r.from_table_id == table_id || &r.to_table_id == table_id)
            .map(|r| r.id.clone())
            .collect();
        self.relationships.retain(|r| !dropped.contains(&r.id));
        self.relationship_display_columns
            .retain(|d| &d.table_id != table_id && !dropped.contains(&d.relationship_id));

        Some(removed)
    }

    /// Junction heuristic: explicitly flagged, referenced by a many-to-many
    /// relationship, or exactly two columns that are both foreign keys.
    pub fn is_junction_table(&self, table: &Table) -> bool {
        if table.is_junction {
            return true;
        }

        let referenced = self.relationships.iter().any(|r| {
            r.relationship_type == RelationshipType::ManyToMany
                && r.junction_table_id.as_ref() == Some(&table.id)
        });
        if referenced {
            return true;
        }

        table.columns.len() == 2 && table.columns.iter().all(Column::is_foreign_key)
    }

    /// Tables shown to users; junction tables stay in `tables` for DDL purposes.
    pub fn user_tables(&self) -> Vec<&Table> {
        self.tables
            .iter()
            .filter(|t| !self.is_junction_table(t))
            .collect()
    }

    /// Drop display-column entries whose column or relationship is gone.
    pub fn prune_display_columns(&mut self) {
        let tables = &self.tables;
        let relationships = &self.relationships;
        self.relationship_display_columns.retain(|d| {
            relationships.iter().any(|r| r.id == d.relationship_id)
                && tables
                    .iter()
                    .find(|t| t.id == d.table_id)
                    .map(|t| t.get_column(&d.column_id).is_some())
                    .unwrap_or(false)
        });
    }

    /// Structural checks run before any change is applied.
    pub fn validate(&self) -> Result<(), String> {
        let mut table_ids = HashSet::new();
        let mut table_names = HashSet::new();

        for table in &self.tables {
            if table.name.trim().is_empty() {
                return Err(format!("Table '{}' has an empty name", table.id));
            }
            if !table_ids.insert(&table.id) {
                return Err(format!("Duplicate table id '{}'", table.id));
            }
            if !is_valid_identifier(&table.internal_name) {
                return Err(format!(
                    "Table '{}' has an invalid internal name '{}'",
                    table.name, table.internal_name
                ));
            }
            if !table_names.insert(&table.internal_name) {
                return Err(format!(
                    "Duplicate table internal name '{}'",
                    table.internal_name
                ));
            }

            let mut column_ids = HashSet::new();
            let mut column_names = HashSet::new();
            for column in &table.columns {
                if column.name.trim().is_empty() {
                    return Err(format!(
                        "Column '{}' in table '{}' has an empty name",
                        column.id, table.name
                    ));
                }
                if !column_ids.insert(&column.id) {
                    return Err(format!(
                        "Duplicate column id '{}' in table '{}'",
                        column.id, table.name
                    ));
                }
                if !is_valid_identifier(&column.internal_name) {
                    return Err(format!(
                        "Column '{}' in table '{}' has an invalid internal name '{}'",
                        column.name, table.name, column.internal_name
                    ));
                }
                if !column_names.insert(&column.internal_name) {
                    return Err(format!(
                        "Duplicate column internal name '{}' in table '{}'",
                        column.internal_name, table.name
                    ));
                }
                if column.auto_increment && !column.data_type.is_integer() {
                    return Err(format!(
                        "Column '{}' in table '{}' is auto-increment but not an integer",
                        column.name, table.name
                    ));
                }
                if let Some(fk) = &column.foreign_key {
                    let target = self.get_table(&fk.table_id).ok_or_else(|| {
                        format!(
                            "Foreign key '{}.{}' references missing table '{}'",
                            table.name, column.name, fk.table_id
                        )
                    })?;
                    if target.get_column(&fk.column_id).is_none() {
                        return Err(format!(
                            "Foreign key '{}.{}' references missing column '{}' in '{}'",
                            table.name, column.name, fk.column_id, target.name
                        ));
                    }
                }
            }
        }

        for rel in &self.relationships {
            for (table_id, column_id) in [
                (&rel.from_table_id, &rel.from_column_id),
                (&rel.to_table_id, &rel.to_column_id),
            ] {
                let table = self.get_table(table_id).ok_or_else(|| {
                    format!("Relationship '{}' references missing table '{}'", rel.id, table_id)
                })?;
                if table.get_column(column_id).is_none() {
                    return Err(format!(
                        "Relationship '{}' references missing column '{}' in '{}'",
                        rel.id, column_id, table.name
                    ));
                }
            }

            match (&rel.relationship_type, &rel.junction_table_id) {
                (RelationshipType::ManyToMany, Some(junction)) => {
                    if self.get_table(junction).is_none() {
                        return Err(format!(
                            "Relationship '{}' references missing junction table '{}'",
                            rel.id, junction
                        ));
                    }
                }
                (RelationshipType::ManyToMany, None) => {
                    return Err(format!(
                        "Many-to-many relationship '{}' has no junction table",
                        rel.id
                    ));
                }
                (_, Some(_)) => {
                    return Err(format!(
                        "Only many-to-many relationships may reference a junction table ('{}')",
                        rel.id
                    ));
                }
                (_, None) => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customers_and_orders() -> SchemaDocument {
        let customers = Table::new("Customers")
            .with_column(Column::primary_key("id"))
            .with_column(Column::new("Name", LogicalType::Text));
        let mut customer_ref = Column::new("Customer", LogicalType::Uuid);
        customer_ref.foreign_key = Some(ForeignKeyRef {
            table_id: customers.id.clone(),
            column_id: customers.columns[0].id.clone(),
        });
        let orders = Table::new("Orders")
            .with_column(Column::primary_key("id"))
            .with_column(customer_ref);

        let mut doc = SchemaDocument::new("project-1");
        doc.tables.push(customers);
        doc.tables.push(orders);
        doc
    }

    #[test]
    fn test_junction_heuristic() {
        let mut doc = customers_and_orders();

        let flagged = Table {
            is_junction: true,
            ..Table::new("Flagged")
        };
        doc.tables.push(flagged.clone());
        assert!(doc.is_junction_table(&flagged));

        // Two columns, both foreign keys
        let mut a = Column::new("a", LogicalType::Uuid);
        a.foreign_key = Some(ForeignKeyRef {
            table_id: doc.tables[0].id.clone(),
            column_id: doc.tables[0].columns[0].id.clone(),
        });
        let mut b = a.clone();
        b.id = generate_id();
        b.internal_name = generate_internal_name("c");
        let implicit = Table::new("Link").with_column(a).with_column(b);
        doc.tables.push(implicit.clone());
        assert!(doc.is_junction_table(&implicit));

        // Referenced by a many-to-many junction pointer
        let pointed = Table::new("Pointed").with_column(Column::primary_key("id"));
        doc.tables.push(pointed.clone());
        doc.relationships.push(Relationship {
            id: "rel-1".to_string(),
            relationship_type: RelationshipType::ManyToMany,
            from_table_id: doc.tables[0].id.clone(),
            from_column_id: doc.tables[0].columns[0].id.clone(),
            to_table_id: doc.tables[1].id.clone(),
            to_column_id: doc.tables[1].columns[0].id.clone(),
            junction_table_id: Some(pointed.id.clone()),
        });
        assert!(doc.is_junction_table(&pointed));

        let visible: Vec<&str> = doc.user_tables().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(visible, vec!["Customers", "Orders"]);
        // Junction tables remain first-class for DDL purposes
        assert_eq!(doc.tables.len(), 5);
    }

    #[test]
    fn test_validate_rejects_dangling_foreign_key() {
        let mut doc = customers_and_orders();
        assert!(doc.validate().is_ok());

        doc.tables[1].columns[1].foreign_key = Some(ForeignKeyRef {
            table_id: "missing".to_string(),
            column_id: "missing".to_string(),
        });
        let err = doc.validate().unwrap_err();
        assert!(err.contains("missing table"));
    }

    #[test]
    fn test_validate_rejects_duplicate_internal_names() {
        let mut doc = customers_and_orders();
        let duplicate = doc.tables[0].columns[1].internal_name.clone();
        doc.tables[0].columns[0].internal_name = duplicate;
        assert!(doc.validate().unwrap_err().contains("Duplicate column internal name"));
    }

    #[test]
    fn test_identity_column_prefers_primary_key() {
        let doc = customers_and_orders();
        let customers = &doc.tables[0];
        assert_eq!(customers.identity_column().unwrap().id, customers.columns[0].id);

        let no_pk = Table::new("Notes").with_column(Column::new("Body", LogicalType::Text));
        assert_eq!(no_pk.identity_column().unwrap().name, "Body");
    }

    #[test]
    fn test_fingerprint_tracks_display_names() {
        let doc = customers_and_orders();
        let mut renamed = doc.tables[0].clone();
        let before = renamed.fingerprint();
        renamed.columns[1].name = "Full name".to_string();
        assert_ne!(before, renamed.fingerprint());
    }

    #[test]
    fn test_remove_table_drops_relationships() {
        let mut doc = customers_and_orders();
        doc.relationships.push(Relationship {
            id: "rel-1".to_string(),
            relationship_type: RelationshipType::OneToMany,
            from_table_id: doc.tables[0].id.clone(),
            from_column_id: doc.tables[0].columns[0].id.clone(),
            to_table_id: doc.tables[1].id.clone(),
            to_column_id: doc.tables[1].columns[1].id.clone(),
            junction_table_id: None,
        });
        doc.relationship_display_columns.push(RelationshipDisplayColumn {
            relationship_id: "rel-1".to_string(),
            table_id: doc.tables[0].id.clone(),
            column_id: doc.tables[0].columns[1].id.clone(),
        });

        let customers_id = doc.tables[0].id.clone();
        assert!(doc.remove_table(&customers_id).is_some());
        assert!(doc.relationships.is_empty());
        assert!(doc.relationship_display_columns.is_empty());
    }
}
