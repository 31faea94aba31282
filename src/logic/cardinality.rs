//! Realizes relationship cardinality physically: synthesized foreign-key
//! columns for one-to-many / one-to-one and junction tables for
//! many-to-many. Conversions only ever add; columns and junction tables a
//! previous conversion created are reused, never dropped.

use crate::error::{SyncError, SyncResult};
use crate::logic::diff::TableDiffEngine;
use crate::model::{
    Column, ForeignKeyConstraint, ForeignKeyRef, Id, Relationship, RelationshipType, SchemaChange,
    SchemaDocument, Table,
};

/// One coordinator call: the change and the document it produces.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedChange {
    pub change: SchemaChange,
    pub document: SchemaDocument,
}

pub struct RelationshipCardinalityConverter;

impl RelationshipCardinalityConverter {
    /// Steps that add a new relationship and realize its cardinality.
    /// Column ids the planner decides (synthesized foreign keys, junction
    /// sides) are overwritten.
    pub fn plan_create(document: &SchemaDocument, relationship: Relationship) -> SyncResult<Vec<PlannedChange>> {
        if document.get_relationship(&relationship.id).is_some() {
            return Err(SyncError::Validation(format!(
                "relationship {} already exists",
                relationship.id
            )));
        }

        let target = relationship.relationship_type;
        let relationship_id = relationship.id.clone();
        let mut working = document.clone();
        working.relationships.push(Relationship {
            junction_table_id: None,
            ..relationship
        });

        Self::plan_steps(working, &relationship_id, target)
    }

    /// Steps that convert an existing relationship to `target`.
    pub fn plan_convert(
        document: &SchemaDocument,
        relationship_id: &Id,
        target: RelationshipType,
    ) -> SyncResult<Vec<PlannedChange>> {
        if document.get_relationship(relationship_id).is_none() {
            return Err(SyncError::NotFound(format!("relationship {}", relationship_id)));
        }
        Self::plan_steps(document.clone(), relationship_id, target)
    }

    fn plan_steps(
        document: SchemaDocument,
        relationship_id: &Id,
        target: RelationshipType,
    ) -> SyncResult<Vec<PlannedChange>> {
        let mut planner = Planner {
            document,
            steps: Vec::new(),
        };
        let relationship = planner.relationship(relationship_id)?;

        match target {
            RelationshipType::OneToMany => planner.realize_foreign_key(&relationship, target, false)?,
            RelationshipType::OneToOne => planner.to_one_to_one(&relationship)?,
            RelationshipType::ManyToMany => planner.to_many_to_many(&relationship)?,
        }

        Ok(planner.steps)
    }
}

struct Planner {
    document: SchemaDocument,
    steps: Vec<PlannedChange>,
}

impl Planner {
    fn push(&mut self, change: SchemaChange) {
        self.steps.push(PlannedChange {
            change,
            document: self.document.clone(),
        });
    }

    fn describe(&mut self, relationship_id: &Id, target: RelationshipType) {
        self.push(SchemaChange::UpdateDocument {
            description: Some(format!("relationship {} is now {:?}", relationship_id, target)),
        });
    }

    fn relationship(&self, relationship_id: &Id) -> SyncResult<Relationship> {
        self.document
            .get_relationship(relationship_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("relationship {}", relationship_id)))
    }

    fn table(&self, table_id: &Id) -> SyncResult<Table> {
        self.document
            .get_table(table_id)
            .cloned()
            .ok_or_else(|| SyncError::Validation(format!("relationship table {} does not exist", table_id)))
    }

    fn update_relationship(&mut self, relationship_id: &Id, update: impl FnOnce(&mut Relationship)) {
        if let Some(relationship) = self.document.get_relationship_mut(relationship_id) {
            update(relationship);
        }
    }

    /// One-to-many (and one-to-one without an existing key): make sure the
    /// "to" side carries a nullable foreign key to the "from" side's primary
    /// key, then add the constraint. One-to-one only reaches here when
    /// neither side has a key yet, so an existing key is reused as is.
    fn realize_foreign_key(
        &mut self,
        relationship: &Relationship,
        target: RelationshipType,
        unique: bool,
    ) -> SyncResult<()> {
        let one = self.table(&relationship.from_table_id)?;
        let many = self.table(&relationship.to_table_id)?;
        let key = primary_key(&one)?.clone();

        if let Some(existing) = many.foreign_key_to(&one.id).cloned() {
            self.update_relationship(&relationship.id, |r| {
                r.relationship_type = target;
                r.from_column_id = key.id.clone();
                r.to_column_id = existing.id.clone();
                r.junction_table_id = None;
            });
            self.describe(&relationship.id, target);
            return Ok(());
        }

        let mut column = Column::new(
            unique_display_name(&many, &format!("{}_id", snake_case(&one.name))),
            key.data_type,
        );
        column.nullable = true;
        column.unique = unique;
        column.foreign_key = Some(ForeignKeyRef {
            table_id: one.id.clone(),
            column_id: key.id.clone(),
        });
        column.synthesized_by = Some(relationship.id.clone());

        let mut updated = many.clone();
        updated.columns.push(column.clone());
        let change = TableDiffEngine::diff_change(&many, &updated)?;
        self.document.upsert_table(updated.clone());
        self.update_relationship(&relationship.id, |r| {
            r.relationship_type = target;
            r.from_column_id = key.id.clone();
            r.to_column_id = column.id.clone();
            r.junction_table_id = None;
        });
        self.push(change);

        self.push(SchemaChange::AddForeignKey {
            table_id: updated.id.clone(),
            constraint: foreign_key(&updated, &column, &one, &key),
        });
        Ok(())
    }

    fn to_one_to_one(&mut self, relationship: &Relationship) -> SyncResult<()> {
        let from = self.table(&relationship.from_table_id)?;
        let to = self.table(&relationship.to_table_id)?;
        let target = RelationshipType::OneToOne;

        // An existing key on either side already realizes the relationship
        let existing = to
            .foreign_key_to(&from.id)
            .map(|c| (from.id.clone(), to.id.clone(), c.clone()))
            .or_else(|| {
                from.foreign_key_to(&to.id)
                    .map(|c| (to.id.clone(), from.id.clone(), c.clone()))
            });

        match existing {
            Some((referenced, holder, column)) => {
                let referenced_column = column
                    .foreign_key
                    .as_ref()
                    .map(|fk| fk.column_id.clone())
                    .unwrap_or_default();
                self.update_relationship(&relationship.id, |r| {
                    r.relationship_type = target;
                    r.from_table_id = referenced;
                    r.from_column_id = referenced_column;
                    r.to_table_id = holder;
                    r.to_column_id = column.id.clone();
                    r.junction_table_id = None;
                });
                self.describe(&relationship.id, target);
                Ok(())
            }
            None => self.realize_foreign_key(relationship, target, true),
        }
    }

    fn to_many_to_many(&mut self, relationship: &Relationship) -> SyncResult<()> {
        let from = self.table(&relationship.from_table_id)?;
        let to = self.table(&relationship.to_table_id)?;
        let from_key = primary_key(&from)?.clone();
        let to_key = primary_key(&to)?.clone();
        let target = RelationshipType::ManyToMany;

        let reusable = relationship
            .junction_table_id
            .as_ref()
            .and_then(|id| self.document.get_table(id))
            .or_else(|| {
                self.document.tables.iter().find(|t| {
                    t.is_junction && t.synthesized_by.as_ref() == Some(&relationship.id)
                })
            })
            .map(|t| t.id.clone());

        if let Some(junction_id) = reusable {
            self.update_relationship(&relationship.id, |r| {
                r.relationship_type = target;
                r.from_column_id = from_key.id.clone();
                r.to_column_id = to_key.id.clone();
                r.junction_table_id = Some(junction_id);
            });
            self.describe(&relationship.id, target);
            return Ok(());
        }

        let from_side = junction_column(&snake_case(&from.name), &from, &from_key, &relationship.id);
        let mut to_name = snake_case(&to.name);
        if to_name == snake_case(&from.name) {
            to_name.push_str("_2");
        }
        let to_side = junction_column(&to_name, &to, &to_key, &relationship.id);

        let junction = Table {
            is_junction: true,
            synthesized_by: Some(relationship.id.clone()),
            ..Table::new(format!("{}_{}", from.name, to.name))
        }
        .with_column(from_side.clone())
        .with_column(to_side.clone());

        self.document.tables.push(junction.clone());
        self.update_relationship(&relationship.id, |r| {
            r.relationship_type = target;
            r.from_column_id = from_key.id.clone();
            r.to_column_id = to_key.id.clone();
            r.junction_table_id = Some(junction.id.clone());
        });

        // The junction table must exist before constraints can name it
        self.push(SchemaChange::CreateTable {
            table: junction.clone(),
        });
        self.push(SchemaChange::AddForeignKey {
            table_id: junction.id.clone(),
            constraint: foreign_key(&junction, &from_side, &from, &from_key),
        });
        self.push(SchemaChange::AddForeignKey {
            table_id: junction.id.clone(),
            constraint: foreign_key(&junction, &to_side, &to, &to_key),
        });
        Ok(())
    }
}

fn primary_key(table: &Table) -> SyncResult<&Column> {
    table.primary_key_columns().next().ok_or_else(|| {
        SyncError::Validation(format!("table '{}' has no primary key to reference", table.name))
    })
}

fn junction_column(base: &str, referenced: &Table, key: &Column, relationship_id: &Id) -> Column {
    let mut column = Column::new(format!("{}_id", base), key.data_type);
    column.primary_key = true;
    column.nullable = false;
    column.foreign_key = Some(ForeignKeyRef {
        table_id: referenced.id.clone(),
        column_id: key.id.clone(),
    });
    column.synthesized_by = Some(relationship_id.clone());
    column
}

fn foreign_key(table: &Table, column: &Column, referenced: &Table, key: &Column) -> ForeignKeyConstraint {
    ForeignKeyConstraint {
        name: ForeignKeyConstraint::constraint_name(&table.internal_name, &column.internal_name),
        table_name: table.internal_name.clone(),
        column_name: column.internal_name.clone(),
        references_table_id: referenced.id.clone(),
        references_table_name: referenced.internal_name.clone(),
        references_column_name: key.internal_name.clone(),
    }
}

fn snake_case(name: &str) -> String {
    let snake: String = name
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if snake.is_empty() {
        "ref".to_string()
    } else {
        snake
    }
}

fn unique_display_name(table: &Table, base: &str) -> String {
    let taken = |name: &str| table.columns.iter().any(|c| c.name == name);
    if !taken(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}_{}", base, n))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}
