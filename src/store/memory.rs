//! In-process backends used in solo/dev mode and by the test-suite.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;

use crate::error::{SyncError, SyncResult};
use crate::logic::ddl::DdlRenderer;
use crate::model::{
    ColumnOperation, DeploymentConfig, ForeignKeyConstraint, Id, ResolvedTenant, Row,
    RowChangeEvent, RowEventKind, RowQuery, SchemaChange, SchemaChangeRecord, SchemaDocument,
    SortDirection, Tenant, TenantMembership,
};
use crate::store::feed::ChangeFeedHub;
use crate::store::traits::{
    ConnectionDescriptor, ConnectionFactory, ControlPlaneStore, DataPlane, DocumentLease, Store,
    TenantStore,
};

// ============================================================================
// CONTROL PLANE
// ============================================================================

#[derive(Clone, Default)]
pub struct MemoryStore {
    documents: Arc<RwLock<HashMap<Id, SchemaDocument>>>,
    locks: Arc<Mutex<HashMap<Id, Arc<tokio::sync::Mutex<()>>>>>,
    changes: Arc<RwLock<Vec<SchemaChangeRecord>>>,
    tenants: Arc<RwLock<HashMap<Id, Tenant>>>,
    configs: Arc<RwLock<HashMap<Id, DeploymentConfig>>>,
    members: Arc<RwLock<Vec<TenantMembership>>>,
    feed: Option<ChangeFeedHub>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose commits are published on the given schema feed
    pub fn with_feed(feed: ChangeFeedHub) -> Self {
        Self {
            feed: Some(feed),
            ..Self::default()
        }
    }

    /// Seed a document directly, bypassing the versioned apply path
    pub fn insert_document(&self, document: SchemaDocument) {
        self.documents
            .write()
            .insert(document.project_id.clone(), document);
    }

    fn project_lock(&self, project_id: &Id) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(project_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

struct MemoryLease {
    _guard: OwnedMutexGuard<()>,
    project_id: Id,
    version: i64,
    documents: Arc<RwLock<HashMap<Id, SchemaDocument>>>,
    changes: Arc<RwLock<Vec<SchemaChangeRecord>>>,
    feed: Option<ChangeFeedHub>,
}

#[async_trait::async_trait]
impl DocumentLease for MemoryLease {
    fn current_version(&self) -> i64 {
        self.version
    }

    async fn commit(
        self: Box<Self>,
        document: SchemaDocument,
        record: SchemaChangeRecord,
    ) -> Result<()> {
        if document.project_id != self.project_id {
            return Err(anyhow!(
                "Lease for project '{}' cannot commit document of '{}'",
                self.project_id,
                document.project_id
            ));
        }
        if document.version != self.version + 1 {
            return Err(anyhow!(
                "Document version {} does not follow leased version {}",
                document.version,
                self.version
            ));
        }

        self.documents
            .write()
            .insert(self.project_id.clone(), document);
        self.changes.write().push(record.clone());

        if let Some(feed) = &self.feed {
            feed.publish_schema(record.into());
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl ControlPlaneStore for MemoryStore {
    async fn get_document(&self, project_id: &Id) -> Result<Option<SchemaDocument>> {
        Ok(self.documents.read().get(project_id).cloned())
    }

    async fn begin_apply(&self, _tenant_id: &Id, project_id: &Id) -> Result<Box<dyn DocumentLease>> {
        let guard = self.project_lock(project_id).lock_owned().await;
        let version = self
            .documents
            .read()
            .get(project_id)
            .map(|d| d.version)
            .unwrap_or(0);

        Ok(Box::new(MemoryLease {
            _guard: guard,
            project_id: project_id.clone(),
            version,
            documents: self.documents.clone(),
            changes: self.changes.clone(),
            feed: self.feed.clone(),
        }))
    }

    async fn list_changes(
        &self,
        project_id: &Id,
        after_version: Option<i64>,
    ) -> Result<Vec<SchemaChangeRecord>> {
        let changes = self.changes.read();
        let mut records: Vec<SchemaChangeRecord> = changes
            .iter()
            .filter(|r| &r.project_id == project_id)
            .filter(|r| after_version.map(|v| r.version > v).unwrap_or(true))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.version);
        Ok(records)
    }
}

#[async_trait::async_trait]
impl TenantStore for MemoryStore {
    async fn get_tenant(&self, tenant_id: &Id) -> Result<Option<Tenant>> {
        Ok(self.tenants.read().get(tenant_id).cloned())
    }

    async fn upsert_tenant(&self, tenant: Tenant) -> Result<()> {
        self.tenants.write().insert(tenant.id.clone(), tenant);
        Ok(())
    }

    async fn get_deployment_config(&self, tenant_id: &Id) -> Result<Option<DeploymentConfig>> {
        Ok(self.configs.read().get(tenant_id).cloned())
    }

    async fn upsert_deployment_config(&self, config: DeploymentConfig) -> Result<()> {
        self.configs.write().insert(config.tenant_id.clone(), config);
        Ok(())
    }

    async fn get_membership(&self, tenant_id: &Id, user_id: &str) -> Result<Option<TenantMembership>> {
        Ok(self
            .members
            .read()
            .iter()
            .find(|m| &m.tenant_id == tenant_id && m.user_id == user_id)
            .cloned())
    }

    async fn upsert_membership(&self, membership: TenantMembership) -> Result<()> {
        let mut members = self.members.write();
        members.retain(|m| !(m.tenant_id == membership.tenant_id && m.user_id == membership.user_id));
        members.push(membership);
        Ok(())
    }

    async fn list_tenants_for_user(&self, user_id: &str) -> Result<Vec<ResolvedTenant>> {
        let members = self.members.read();
        let tenants = self.tenants.read();
        let configs = self.configs.read();

        Ok(members
            .iter()
            .filter(|m| m.user_id == user_id)
            .filter_map(|m| {
                tenants.get(&m.tenant_id).map(|tenant| ResolvedTenant {
                    tenant: tenant.clone(),
                    role: m.role,
                    deployment: configs.get(&m.tenant_id).cloned(),
                })
            })
            .collect())
    }
}

impl Store for MemoryStore {}

// ============================================================================
// DATA PLANE
// ============================================================================

/// Failure the next `execute`/`fetch_rows` calls should report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Lock,
    Unreachable,
}

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    columns: Vec<String>,
    not_null: HashSet<String>,
    constraints: HashSet<String>,
    foreign_keys: HashMap<String, ForeignKeyConstraint>,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct DataState {
    tables: HashMap<(String, String), MemoryTable>,
    statements: Vec<String>,
    failures: Vec<InjectedFailure>,
    fetch_failures: usize,
}

/// Data plane that interprets changes structurally and logs the statements
/// the Postgres data plane would have run.
pub struct MemoryDataPlane {
    endpoint: String,
    state: Mutex<DataState>,
    feed: Option<ChangeFeedHub>,
}

impl MemoryDataPlane {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            state: Mutex::new(DataState::default()),
            feed: None,
        }
    }

    /// Data plane whose row writes are published on the given row feeds
    pub fn with_feed(endpoint: impl Into<String>, feed: ChangeFeedHub) -> Self {
        Self {
            feed: Some(feed),
            ..Self::new(endpoint)
        }
    }

    /// Make the next `count` executions fail with `failure`
    pub fn inject_failures(&self, failure: InjectedFailure, count: usize) {
        let mut state = self.state.lock();
        state.failures.extend(std::iter::repeat(failure).take(count));
    }

    /// Make the next `count` row reloads fail
    pub fn fail_next_fetches(&self, count: usize) {
        self.state.lock().fetch_failures += count;
    }

    pub fn executed_statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    pub fn table_columns(&self, namespace: &str, table: &str) -> Option<Vec<String>> {
        self.state
            .lock()
            .tables
            .get(&(namespace.to_string(), table.to_string()))
            .map(|t| t.columns.clone())
    }

    pub fn has_constraint(&self, namespace: &str, table: &str, constraint: &str) -> bool {
        self.state
            .lock()
            .tables
            .get(&(namespace.to_string(), table.to_string()))
            .map(|t| t.constraints.contains(constraint) || t.foreign_keys.contains_key(constraint))
            .unwrap_or(false)
    }

    pub fn insert_row(&self, namespace: &str, table: &str, row: Row) -> SyncResult<()> {
        {
            let mut state = self.state.lock();
            let target = table_mut(&mut state.tables, namespace, table)?;
            for key in row.keys() {
                if !target.columns.contains(key) {
                    return Err(SyncError::Validation(format!(
                        "column \"{}\" of relation \"{}\" does not exist",
                        key, table
                    )));
                }
            }
            target.rows.push(row.clone());
        }
        self.publish(namespace, table, RowEventKind::Insert, row, None);
        Ok(())
    }

    /// Patch every row whose `key` column equals `value`
    pub fn update_rows(
        &self,
        namespace: &str,
        table: &str,
        key: &str,
        value: &serde_json::Value,
        patch: Row,
    ) -> SyncResult<usize> {
        let mut changed = Vec::new();
        {
            let mut state = self.state.lock();
            let target = table_mut(&mut state.tables, namespace, table)?;
            for row in target.rows.iter_mut().filter(|r| r.get(key) == Some(value)) {
                let old = row.clone();
                for (k, v) in &patch {
                    row.insert(k.clone(), v.clone());
                }
                changed.push((row.clone(), old));
            }
        }
        let count = changed.len();
        for (row, old) in changed {
            self.publish(namespace, table, RowEventKind::Update, row, Some(old));
        }
        Ok(count)
    }

    pub fn delete_rows(
        &self,
        namespace: &str,
        table: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> SyncResult<usize> {
        let removed: Vec<Row> = {
            let mut state = self.state.lock();
            let target = table_mut(&mut state.tables, namespace, table)?;
            let (removed, kept) = target
                .rows
                .drain(..)
                .partition(|r| r.get(key) == Some(value));
            target.rows = kept;
            removed
        };
        let count = removed.len();
        for row in removed {
            self.publish(namespace, table, RowEventKind::Delete, Row::new(), Some(row));
        }
        Ok(count)
    }

    fn publish(&self, namespace: &str, table: &str, kind: RowEventKind, record: Row, old: Option<Row>) {
        if let Some(feed) = &self.feed {
            feed.publish_row(RowChangeEvent {
                namespace: namespace.to_string(),
                table: table.to_string(),
                kind,
                record,
                old_record: old,
            });
        }
    }

    fn take_failure(state: &mut DataState) -> SyncResult<()> {
        if state.failures.is_empty() {
            return Ok(());
        }
        match state.failures.remove(0) {
            InjectedFailure::Lock => Err(SyncError::lock_conflict(
                "canceling statement due to lock timeout",
            )),
            InjectedFailure::Unreachable => {
                Err(SyncError::Connectivity("connection refused".to_string()))
            }
        }
    }
}

fn table_mut<'a>(
    tables: &'a mut HashMap<(String, String), MemoryTable>,
    namespace: &str,
    table: &str,
) -> SyncResult<&'a mut MemoryTable> {
    tables
        .get_mut(&(namespace.to_string(), table.to_string()))
        .ok_or_else(|| {
            SyncError::Validation(format!("relation \"{}.{}\" does not exist", namespace, table))
        })
}

fn apply_change(
    tables: &mut HashMap<(String, String), MemoryTable>,
    namespace: &str,
    change: &SchemaChange,
) -> SyncResult<()> {
    match change {
        SchemaChange::CreateTable { table } => {
            let key = (namespace.to_string(), table.internal_name.clone());
            tables.entry(key).or_insert_with(|| MemoryTable {
                columns: table.columns.iter().map(|c| c.internal_name.clone()).collect(),
                not_null: table
                    .columns
                    .iter()
                    .filter(|c| !c.nullable || c.primary_key)
                    .map(|c| c.internal_name.clone())
                    .collect(),
                constraints: table
                    .columns
                    .iter()
                    .filter(|c| c.unique && !c.primary_key)
                    .map(|c| DdlRenderer::unique_constraint_name(&table.internal_name, &c.internal_name))
                    .collect(),
                ..MemoryTable::default()
            });
        }
        SchemaChange::DropTable { table_name, .. } => {
            tables.remove(&(namespace.to_string(), table_name.clone()));
        }
        SchemaChange::AlterTable {
            table_name,
            operations,
            ..
        } => {
            let target = table_mut(tables, namespace, table_name)?;
            for op in operations {
                apply_column_operation(target, table_name, op)?;
            }
        }
        SchemaChange::AddForeignKey { constraint, .. } => {
            let referenced = tables
                .get(&(namespace.to_string(), constraint.references_table_name.clone()))
                .ok_or_else(|| {
                    SyncError::Validation(format!(
                        "relation \"{}\" does not exist",
                        constraint.references_table_name
                    ))
                })?;
            if !referenced.columns.contains(&constraint.references_column_name) {
                return Err(SyncError::Validation(format!(
                    "column \"{}\" referenced in foreign key constraint does not exist",
                    constraint.references_column_name
                )));
            }
            let target = table_mut(tables, namespace, &constraint.table_name)?;
            if !target.columns.contains(&constraint.column_name) {
                return Err(SyncError::Validation(format!(
                    "column \"{}\" referenced in foreign key constraint does not exist",
                    constraint.column_name
                )));
            }
            target
                .foreign_keys
                .entry(constraint.name.clone())
                .or_insert_with(|| constraint.clone());
        }
        SchemaChange::DropForeignKey { constraint, .. } => {
            if let Some(target) = tables.get_mut(&(namespace.to_string(), constraint.table_name.clone())) {
                target.foreign_keys.remove(&constraint.name);
            }
        }
        SchemaChange::UpdateDocument { .. } => {}
    }
    Ok(())
}

fn apply_column_operation(
    target: &mut MemoryTable,
    table_name: &str,
    op: &ColumnOperation,
) -> SyncResult<()> {
    match op {
        ColumnOperation::AddColumn { column } => {
            if !target.columns.contains(&column.internal_name) {
                if !column.nullable && column.default_value.is_none() && !target.rows.is_empty() {
                    return Err(SyncError::Validation(format!(
                        "column \"{}\" contains null values",
                        column.internal_name
                    )));
                }
                target.columns.push(column.internal_name.clone());
                if !column.nullable {
                    target.not_null.insert(column.internal_name.clone());
                }
                if column.unique && !column.primary_key {
                    target.constraints.insert(DdlRenderer::unique_constraint_name(
                        table_name,
                        &column.internal_name,
                    ));
                }
                let fill = column
                    .default_value
                    .as_ref()
                    .map(|v| serde_json::Value::String(v.clone()))
                    .unwrap_or(serde_json::Value::Null);
                for row in &mut target.rows {
                    row.insert(column.internal_name.clone(), fill.clone());
                }
            }
        }
        ColumnOperation::DropColumn { column_name, .. } => {
            target.columns.retain(|c| c != column_name);
            target.not_null.remove(column_name);
            for row in &mut target.rows {
                row.remove(column_name);
            }
        }
        ColumnOperation::AlterColumnType { column_name, .. } => {
            require_column(target, column_name)?;
        }
        ColumnOperation::AddUniqueConstraint { column_name, .. } => {
            require_column(target, column_name)?;
            target
                .constraints
                .insert(DdlRenderer::unique_constraint_name(table_name, column_name));
        }
        ColumnOperation::DropUniqueConstraint { column_name, .. } => {
            target
                .constraints
                .remove(&DdlRenderer::unique_constraint_name(table_name, column_name));
        }
        ColumnOperation::AlterColumnDefault { column_name, .. } => {
            require_column(target, column_name)?;
        }
        ColumnOperation::AlterColumnNullable {
            column_name,
            nullable,
            ..
        } => {
            require_column(target, column_name)?;
            if *nullable {
                target.not_null.remove(column_name);
            } else {
                let has_nulls = target
                    .rows
                    .iter()
                    .any(|r| r.get(column_name).map(|v| v.is_null()).unwrap_or(true));
                if has_nulls {
                    return Err(SyncError::Validation(format!(
                        "column \"{}\" contains null values",
                        column_name
                    )));
                }
                target.not_null.insert(column_name.clone());
            }
        }
    }
    Ok(())
}

fn require_column(target: &MemoryTable, column_name: &str) -> SyncResult<()> {
    if target.columns.iter().any(|c| c == column_name) {
        Ok(())
    } else {
        Err(SyncError::Validation(format!(
            "column \"{}\" does not exist",
            column_name
        )))
    }
}

fn compare_values(a: Option<&serde_json::Value>, b: Option<&serde_json::Value>) -> Ordering {
    use serde_json::Value;

    match (a, b) {
        (None, None) | (Some(Value::Null), Some(Value::Null)) => Ordering::Equal,
        (None, _) | (Some(Value::Null), _) => Ordering::Less,
        (_, None) | (_, Some(Value::Null)) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

#[async_trait::async_trait]
impl DataPlane for MemoryDataPlane {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn execute(&self, namespace: &str, change: &SchemaChange) -> SyncResult<()> {
        let statements = DdlRenderer::render(namespace, change)?;

        let mut state = self.state.lock();
        Self::take_failure(&mut state)?;

        // All or nothing, like a DDL transaction
        let mut tables = state.tables.clone();
        apply_change(&mut tables, namespace, change)?;
        state.tables = tables;
        state.statements.extend(statements);
        Ok(())
    }

    async fn fetch_rows(&self, namespace: &str, table: &str, query: &RowQuery) -> SyncResult<Vec<Row>> {
        let mut state = self.state.lock();
        if state.fetch_failures > 0 {
            state.fetch_failures -= 1;
            return Err(SyncError::Connectivity("reload timed out".to_string()));
        }
        Self::take_failure(&mut state)?;

        let target = table_mut(&mut state.tables, namespace, table)?;
        let mut rows: Vec<Row> = target
            .rows
            .iter()
            .filter(|row| {
                query
                    .filters
                    .iter()
                    .all(|(column, value)| row.get(column) == Some(value))
            })
            .cloned()
            .collect();

        rows.sort_by(|a, b| {
            for (column, direction) in &query.order_by {
                let ordering = compare_values(a.get(column), b.get(column));
                let ordering = match direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });

        Ok(rows)
    }

    async fn ping(&self) -> SyncResult<()> {
        let mut state = self.state.lock();
        Self::take_failure(&mut state)
    }
}

/// Hands out one [`MemoryDataPlane`] per endpoint, shared by every tenant
/// routed to it.
#[derive(Default)]
pub struct MemoryConnectionFactory {
    feed: Option<ChangeFeedHub>,
    planes: Mutex<HashMap<String, Arc<MemoryDataPlane>>>,
    opened: AtomicUsize,
}

impl MemoryConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feed(feed: ChangeFeedHub) -> Self {
        Self {
            feed: Some(feed),
            ..Self::default()
        }
    }

    /// The plane behind an endpoint, once something opened it
    pub fn plane(&self, endpoint: &str) -> Option<Arc<MemoryDataPlane>> {
        self.planes.lock().get(endpoint).cloned()
    }

    /// Number of `open` calls served so far
    pub fn open_count(&self) -> usize {
        self.opened.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ConnectionFactory for MemoryConnectionFactory {
    async fn open(&self, descriptor: &ConnectionDescriptor) -> SyncResult<Arc<dyn DataPlane>> {
        self.opened.fetch_add(1, AtomicOrdering::SeqCst);
        let plane = self
            .planes
            .lock()
            .entry(descriptor.endpoint_url.clone())
            .or_insert_with(|| {
                Arc::new(match &self.feed {
                    Some(feed) => MemoryDataPlane::with_feed(descriptor.endpoint_url.clone(), feed.clone()),
                    None => MemoryDataPlane::new(descriptor.endpoint_url.clone()),
                })
            })
            .clone();
        Ok(plane)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Column, LogicalType, Table};
    use serde_json::json;

    fn users_table() -> Table {
        let mut id = Column::new("id", LogicalType::Integer);
        id.internal_name = "c_1".to_string();
        id.primary_key = true;
        let mut name = Column::new("Name", LogicalType::Text);
        name.internal_name = "c_2".to_string();
        Table {
            internal_name: "t_1".to_string(),
            ..Table::new("Users")
        }
        .with_column(id)
        .with_column(name)
    }

    fn row(id: i64, name: &str) -> Row {
        let mut row = Row::new();
        row.insert("c_1".to_string(), json!(id));
        row.insert("c_2".to_string(), json!(name));
        row
    }

    #[tokio::test]
    async fn test_memory_lease_serializes_applies() {
        let store = MemoryStore::new();
        let project = "project-1".to_string();
        let tenant = "tenant-1".to_string();

        let lease = store.begin_apply(&tenant, &project).await.unwrap();
        assert_eq!(lease.current_version(), 0);

        let mut document = SchemaDocument::new(project.clone());
        document.version = 1;
        let change = SchemaChange::UpdateDocument { description: None };
        let record = SchemaChangeRecord::new(&project, &change, "alice", 1).unwrap();
        lease.commit(document, record).await.unwrap();

        let lease = store.begin_apply(&tenant, &project).await.unwrap();
        assert_eq!(lease.current_version(), 1);

        // Skipping a version is refused
        let mut skipped = SchemaDocument::new(project.clone());
        skipped.version = 5;
        let record = SchemaChangeRecord::new(&project, &change, "alice", 5).unwrap();
        assert!(lease.commit(skipped, record).await.is_err());

        let changes = store.list_changes(&project, None).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].created_by, "alice");
    }

    #[tokio::test]
    async fn test_data_plane_executes_changes_idempotently() {
        let plane = MemoryDataPlane::new("memory://data");
        let create = SchemaChange::CreateTable { table: users_table() };

        plane.execute("tenant_a", &create).await.unwrap();
        plane.execute("tenant_a", &create).await.unwrap();

        let mut age = Column::new("Age", LogicalType::Integer);
        age.internal_name = "c_3".to_string();
        let alter = SchemaChange::AlterTable {
            table_id: "table-1".to_string(),
            table_name: "t_1".to_string(),
            operations: vec![ColumnOperation::AddColumn { column: age }],
        };
        plane.execute("tenant_a", &alter).await.unwrap();
        plane.execute("tenant_a", &alter).await.unwrap();

        assert_eq!(
            plane.table_columns("tenant_a", "t_1").unwrap(),
            vec!["c_1", "c_2", "c_3"]
        );
        assert_eq!(plane.executed_statements().len(), 4);
    }

    #[tokio::test]
    async fn test_failed_change_leaves_table_untouched() {
        let plane = MemoryDataPlane::new("memory://data");
        plane
            .execute("tenant_a", &SchemaChange::CreateTable { table: users_table() })
            .await
            .unwrap();

        let mut extra = Column::new("Extra", LogicalType::Text);
        extra.internal_name = "c_4".to_string();
        let alter = SchemaChange::AlterTable {
            table_id: "table-1".to_string(),
            table_name: "t_1".to_string(),
            operations: vec![
                ColumnOperation::AddColumn { column: extra },
                ColumnOperation::AlterColumnType {
                    column_id: "missing".to_string(),
                    column_name: "c_missing".to_string(),
                    from: LogicalType::Text,
                    to: LogicalType::Integer,
                },
            ],
        };

        assert!(matches!(
            plane.execute("tenant_a", &alter).await,
            Err(SyncError::Validation(_))
        ));
        assert_eq!(plane.table_columns("tenant_a", "t_1").unwrap(), vec!["c_1", "c_2"]);
    }

    #[tokio::test]
    async fn test_injected_failures_are_classified() {
        let plane = MemoryDataPlane::new("memory://data");
        plane.inject_failures(InjectedFailure::Lock, 1);
        plane.inject_failures(InjectedFailure::Unreachable, 1);

        let create = SchemaChange::CreateTable { table: users_table() };
        let first = plane.execute("tenant_a", &create).await.unwrap_err();
        assert_eq!(first.status_hint(), 423);
        let second = plane.execute("tenant_a", &create).await.unwrap_err();
        assert!(matches!(second, SyncError::Connectivity(_)));
        assert!(plane.execute("tenant_a", &create).await.is_ok());
    }

    #[tokio::test]
    async fn test_fetch_rows_sorts_and_filters() {
        let plane = MemoryDataPlane::new("memory://data");
        plane
            .execute("tenant_a", &SchemaChange::CreateTable { table: users_table() })
            .await
            .unwrap();
        plane.insert_row("tenant_a", "t_1", row(2, "bea")).unwrap();
        plane.insert_row("tenant_a", "t_1", row(1, "al")).unwrap();
        plane.insert_row("tenant_a", "t_1", row(3, "bea")).unwrap();

        let query = RowQuery {
            order_by: vec![("c_1".to_string(), SortDirection::Desc)],
            filters: vec![("c_2".to_string(), json!("bea"))],
        };
        let rows = plane.fetch_rows("tenant_a", "t_1", &query).await.unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r["c_1"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![3, 2]);
    }
}
