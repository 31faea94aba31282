//! Three-way rebase of an intended document onto a newer live one.
//!
//! `base` is the document the caller edited, `intended` the caller's result
//! and `live` what the control plane holds now. Whatever the caller changed
//! relative to `base` is carried over as long as `live` left that item alone;
//! everything else is taken from `live`. Display names merge independently of
//! physical attributes, so a rename never clashes with a type change.

use std::collections::HashMap;
use std::hash::Hash;

use crate::error::{ConflictKind, SyncError, SyncResult};
use crate::model::{Column, Id, Relationship, RelationshipDisplayColumn, SchemaDocument, Table};

pub fn rebase(
    base: &SchemaDocument,
    intended: &SchemaDocument,
    live: &SchemaDocument,
) -> SyncResult<SchemaDocument> {
    let mut tables = Vec::with_capacity(live.tables.len().max(intended.tables.len()));
    for id in merge_order(&intended.tables, &live.tables, |t| &t.id) {
        let merged = merge_table(
            base.get_table(&id),
            intended.get_table(&id),
            live.get_table(&id),
        )?;
        tables.extend(merged);
    }

    let mut relationships = Vec::with_capacity(live.relationships.len());
    for id in merge_order(&intended.relationships, &live.relationships, |r| &r.id) {
        let merged = pick(
            relationship(base, &id),
            relationship(intended, &id),
            relationship(live, &id),
        )
        .ok_or_else(|| conflict(format!("relationship {} changed concurrently", id)))?;
        relationships.extend(merged);
    }

    Ok(SchemaDocument {
        project_id: live.project_id.clone(),
        version: live.version,
        tables,
        relationships,
        relationship_display_columns: merge_display_columns(base, intended, live),
    })
}

/// Three-way pick. `None` means both sides changed the item differently.
fn pick<T: PartialEq + Clone>(base: Option<&T>, intended: Option<&T>, live: Option<&T>) -> Option<Option<T>> {
    if intended == base {
        Some(live.cloned())
    } else if live == base || live == intended {
        Some(intended.cloned())
    } else {
        None
    }
}

/// Display name on the side that renamed it, the caller winning ties
fn pick_name(base: Option<&str>, intended: Option<&str>, live: Option<&str>) -> String {
    match (intended, live) {
        (Some(i), Some(l)) if Some(i) == base => l.to_string(),
        (Some(i), _) => i.to_string(),
        (None, Some(l)) => l.to_string(),
        (None, None) => String::new(),
    }
}

/// Intended order first, then items only the live side has, in live order
fn merge_order<T, K, F>(intended: &[T], live: &[T], key: F) -> Vec<K>
where
    K: Clone + Eq + Hash,
    F: Fn(&T) -> &K,
{
    let mut seen = HashMap::new();
    for item in intended.iter().chain(live) {
        let next = seen.len();
        seen.entry(key(item).clone()).or_insert(next);
    }
    let mut order: Vec<(K, usize)> = seen.into_iter().collect();
    order.sort_by_key(|(_, position)| *position);
    order.into_iter().map(|(k, _)| k).collect()
}

fn column_shape(column: &Column) -> Column {
    Column {
        name: String::new(),
        ..column.clone()
    }
}

fn merge_column(
    base: Option<&Column>,
    intended: Option<&Column>,
    live: Option<&Column>,
) -> SyncResult<Option<Column>> {
    if let Some(merged) = pick(base, intended, live) {
        return Ok(merged);
    }

    let shape = |c: Option<&Column>| c.map(column_shape);
    let (b, i, l) = (shape(base), shape(intended), shape(live));
    let merged = pick(b.as_ref(), i.as_ref(), l.as_ref()).ok_or_else(|| {
        let id = intended.or(live).map(|c| c.id.as_str()).unwrap_or_default();
        conflict(format!("column {} changed concurrently", id))
    })?;

    Ok(merged.map(|mut column| {
        column.name = pick_name(
            base.map(|c| c.name.as_str()),
            intended.map(|c| c.name.as_str()),
            live.map(|c| c.name.as_str()),
        );
        column
    }))
}

/// Physical identity of a table: internal name plus column shapes by id
fn table_shape(table: &Table) -> (String, Vec<Column>) {
    let mut columns: Vec<Column> = table.columns.iter().map(column_shape).collect();
    columns.sort_by(|a, b| a.id.cmp(&b.id));
    (table.internal_name.clone(), columns)
}

fn merge_table(
    base: Option<&Table>,
    intended: Option<&Table>,
    live: Option<&Table>,
) -> SyncResult<Option<Table>> {
    if let Some(merged) = pick(base, intended, live) {
        return Ok(merged);
    }

    let (intended, live) = match (base, intended, live) {
        (_, Some(i), Some(l)) => (i, l),
        // One side dropped the table; fine as long as the other only renamed
        (Some(b), Some(other), None) | (Some(b), None, Some(other)) => {
            if table_shape(b) == table_shape(other) {
                return Ok(None);
            }
            return Err(conflict(format!(
                "table {} was dropped while being changed",
                b.id
            )));
        }
        _ => return Ok(intended.or(live).cloned()),
    };

    let id = &intended.id;
    let internal_name = field(
        pick(base.map(|t| &t.internal_name), Some(&intended.internal_name), Some(&live.internal_name)),
        "internal name",
        id,
    )?;
    let is_junction = field(
        pick(base.map(|t| &t.is_junction), Some(&intended.is_junction), Some(&live.is_junction)),
        "junction flag",
        id,
    )?;
    let phase = field(
        pick(base.map(|t| &t.phase), Some(&intended.phase), Some(&live.phase)),
        "phase",
        id,
    )?;
    let synthesized_by = field(
        pick(base.map(|t| &t.synthesized_by), Some(&intended.synthesized_by), Some(&live.synthesized_by)),
        "origin",
        id,
    )?;

    let mut columns = Vec::with_capacity(live.columns.len().max(intended.columns.len()));
    for id in merge_order(&intended.columns, &live.columns, |c| &c.id) {
        let merged = merge_column(
            base.and_then(|t| t.get_column(&id)),
            intended.get_column(&id),
            live.get_column(&id),
        )?;
        columns.extend(merged);
    }

    Ok(Some(Table {
        id: intended.id.clone(),
        name: pick_name(
            base.map(|t| t.name.as_str()),
            Some(intended.name.as_str()),
            Some(live.name.as_str()),
        ),
        internal_name: internal_name.unwrap_or_else(|| live.internal_name.clone()),
        columns,
        is_junction: is_junction.unwrap_or(live.is_junction),
        phase: phase.unwrap_or(None),
        synthesized_by: synthesized_by.unwrap_or(None),
    }))
}

/// Live entries minus the ones the caller removed, plus the ones it added
fn merge_display_columns(
    base: &SchemaDocument,
    intended: &SchemaDocument,
    live: &SchemaDocument,
) -> Vec<RelationshipDisplayColumn> {
    let removed = |d: &RelationshipDisplayColumn| {
        base.relationship_display_columns.contains(d) && !intended.relationship_display_columns.contains(d)
    };
    let mut merged: Vec<RelationshipDisplayColumn> = live
        .relationship_display_columns
        .iter()
        .filter(|d| !removed(*d))
        .cloned()
        .collect();

    for added in &intended.relationship_display_columns {
        if !base.relationship_display_columns.contains(added) && !merged.contains(added) {
            merged.push(added.clone());
        }
    }
    merged
}

fn relationship<'a>(document: &'a SchemaDocument, id: &Id) -> Option<&'a Relationship> {
    document.relationships.iter().find(|r| &r.id == id)
}

/// A table-level field both sides changed differently is a conflict
fn field<T>(merged: Option<Option<T>>, what: &str, table_id: &Id) -> SyncResult<Option<T>> {
    merged.ok_or_else(|| conflict(format!("{} of table {} changed concurrently", what, table_id)))
}

fn conflict(message: String) -> SyncError {
    SyncError::Conflict {
        kind: ConflictKind::Version,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LogicalType, RelationshipType};

    fn notes() -> Table {
        Table::new("Notes")
            .with_column(Column::primary_key("id"))
            .with_column(Column::new("Body", LogicalType::Text))
    }

    fn document(tables: Vec<Table>, version: i64) -> SchemaDocument {
        SchemaDocument {
            version,
            tables,
            ..SchemaDocument::new("project-1")
        }
    }

    fn column_names(document: &SchemaDocument, table_id: &Id) -> Vec<String> {
        document
            .get_table(table_id)
            .unwrap()
            .columns
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    #[test]
    fn test_both_sides_add_columns_to_the_same_table() {
        let table = notes();
        let base = document(vec![table.clone()], 1);

        let mut theirs = table.clone();
        theirs.columns.push(Column::new("Pinned", LogicalType::Boolean));
        let live = document(vec![theirs], 2);

        let mut ours = table.clone();
        ours.columns.push(Column::new("Color", LogicalType::Text));
        let intended = document(vec![ours], 1);

        let rebased = rebase(&base, &intended, &live).unwrap();
        assert_eq!(rebased.version, 2);
        assert_eq!(column_names(&rebased, &table.id), vec!["id", "Body", "Color", "Pinned"]);
    }

    #[test]
    fn test_concurrently_dropped_column_stays_dropped() {
        let table = notes();
        let base = document(vec![table.clone()], 1);

        let mut theirs = table.clone();
        theirs.columns.pop();
        let live = document(vec![theirs], 2);

        let mut ours = table.clone();
        ours.name = "Memos".to_string();
        ours.columns.push(Column::new("Color", LogicalType::Text));
        let intended = document(vec![ours], 1);

        let rebased = rebase(&base, &intended, &live).unwrap();
        let merged = rebased.get_table(&table.id).unwrap();
        assert_eq!(merged.name, "Memos");
        assert_eq!(column_names(&rebased, &table.id), vec!["id", "Color"]);
    }

    #[test]
    fn test_rename_and_type_change_of_one_column_merge() {
        let table = notes();
        let base = document(vec![table.clone()], 1);

        let mut theirs = table.clone();
        theirs.columns[1].name = "Content".to_string();
        let live = document(vec![theirs], 2);

        let mut ours = table.clone();
        ours.columns[1].data_type = LogicalType::Varchar;
        let intended = document(vec![ours], 1);

        let rebased = rebase(&base, &intended, &live).unwrap();
        let body = &rebased.get_table(&table.id).unwrap().columns[1];
        assert_eq!(body.name, "Content");
        assert_eq!(body.data_type, LogicalType::Varchar);
    }

    #[test]
    fn test_competing_changes_to_one_column_conflict() {
        let table = notes();
        let base = document(vec![table.clone()], 1);

        let mut theirs = table.clone();
        theirs.columns[1].data_type = LogicalType::Integer;
        let live = document(vec![theirs], 2);

        let mut ours = table.clone();
        ours.columns[1].data_type = LogicalType::Varchar;
        let intended = document(vec![ours], 1);

        let err = rebase(&base, &intended, &live).unwrap_err();
        assert!(err.is_conflict());

        // Altering a column someone else dropped conflicts as well
        let mut dropped = table.clone();
        dropped.columns.pop();
        let err = rebase(&base, &intended, &document(vec![dropped], 2)).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_same_change_on_both_sides_is_kept_once() {
        let table = notes();
        let base = document(vec![table.clone()], 1);

        let mut edited = table.clone();
        edited.columns.push(Column::new("Pinned", LogicalType::Boolean));
        let live = document(vec![edited.clone()], 2);
        let intended = document(vec![edited], 1);

        let rebased = rebase(&base, &intended, &live).unwrap();
        assert_eq!(rebased.get_table(&table.id).unwrap().columns.len(), 3);
    }

    #[test]
    fn test_relationships_merge_by_id() {
        let a = notes();
        let b = Table::new("Tags").with_column(Column::primary_key("id"));
        let relationship = |id: &str, relationship_type| Relationship {
            id: id.to_string(),
            relationship_type,
            from_table_id: a.id.clone(),
            from_column_id: a.columns[0].id.clone(),
            to_table_id: b.id.clone(),
            to_column_id: b.columns[0].id.clone(),
            junction_table_id: None,
        };

        let mut base = document(vec![a.clone(), b.clone()], 1);
        base.relationships.push(relationship("r-1", RelationshipType::OneToMany));

        let mut live = base.clone();
        live.version = 2;
        live.relationships[0].relationship_type = RelationshipType::OneToOne;

        let mut intended = base.clone();
        intended.relationships.push(relationship("r-2", RelationshipType::OneToMany));

        let rebased = rebase(&base, &intended, &live).unwrap();
        assert_eq!(rebased.relationships.len(), 2);
        assert_eq!(rebased.relationships[0].relationship_type, RelationshipType::OneToOne);

        intended.relationships[0].relationship_type = RelationshipType::ManyToMany;
        assert!(rebase(&base, &intended, &live).unwrap_err().is_conflict());
    }
}
