use std::collections::HashSet;
use std::sync::Arc;

use schema_sync::logic::{
    DeploymentRouter, DirectApplyEndpoint, RetryPolicy, SchemaChangeCoordinator, TenantContext,
};
use schema_sync::store::{
    ControlPlaneStore, DataPlane, MemoryConnectionFactory, MemoryDataPlane, MemoryStore,
};
use schema_sync::{
    ApplyRequest, Column, ColumnOperation, LogicalType, SchemaChange, SchemaDocument, SyncError,
    Table, UserContext,
};

struct Harness {
    store: Arc<MemoryStore>,
    control: Arc<MemoryDataPlane>,
    router: Arc<DeploymentRouter>,
    coordinator: Arc<SchemaChangeCoordinator>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let control = Arc::new(MemoryDataPlane::new("memory://control"));
    let router = Arc::new(DeploymentRouter::new(
        store.clone(),
        Arc::new(MemoryConnectionFactory::new()),
        control.clone(),
    ));
    let endpoint = Arc::new(DirectApplyEndpoint::new(store.clone(), router.clone()));
    Harness {
        store,
        control,
        router,
        coordinator: Arc::new(SchemaChangeCoordinator::new(endpoint, RetryPolicy::default())),
    }
}

fn orders_table() -> Table {
    let mut id = Column::primary_key("id");
    id.internal_name = "c_1".to_string();
    let mut total = Column::new("Total", LogicalType::Decimal);
    total.internal_name = "c_2".to_string();
    Table {
        internal_name: "t_1".to_string(),
        ..Table::new("Orders")
    }
    .with_column(id)
    .with_column(total)
}

/// Document at version 5 whose table physically exists
async fn seed_version_5(h: &Harness) -> SchemaDocument {
    let table = orders_table();
    h.control
        .execute("public", &SchemaChange::CreateTable { table: table.clone() })
        .await
        .unwrap();

    let document = SchemaDocument {
        version: 5,
        tables: vec![table],
        ..SchemaDocument::new("project-1")
    };
    h.store.insert_document(document.clone());
    document
}

async fn session(h: &Harness, user: &str) -> TenantContext {
    TenantContext::open(
        &h.router,
        h.store.as_ref(),
        &"solo".to_string(),
        &"project-1".to_string(),
        UserContext::new(user),
    )
    .await
    .unwrap()
}

/// Internal column names of the live document next to the physical ones
async fn both_planes(h: &Harness) -> (Vec<String>, Vec<String>) {
    let live = h.store.get_document(&"project-1".to_string()).await.unwrap().unwrap();
    let mut documented: Vec<String> = live.tables[0]
        .columns
        .iter()
        .map(|c| c.internal_name.clone())
        .collect();
    let mut physical = h.control.table_columns("public", "t_1").unwrap();
    documented.sort();
    physical.sort();
    (documented, physical)
}

fn alter_request(
    base: &SchemaDocument,
    user: &str,
    operation: ColumnOperation,
    edit: impl FnOnce(&mut Table),
) -> ApplyRequest {
    let mut document = base.clone();
    edit(&mut document.tables[0]);
    ApplyRequest {
        tenant_id: "solo".to_string(),
        project_id: "project-1".to_string(),
        change: SchemaChange::AlterTable {
            table_id: document.tables[0].id.clone(),
            table_name: "t_1".to_string(),
            operations: vec![operation],
        },
        observed_version: base.version,
        full_new_document: document,
        user_id: user.to_string(),
    }
}

fn add_column_request(base: &SchemaDocument, user: &str) -> ApplyRequest {
    let mut column = Column::new("Quantity", LogicalType::Integer);
    column.id = "column-9".to_string();
    column.internal_name = "c_9".to_string();

    let mut document = base.clone();
    let table = &mut document.tables[0];
    table.columns.push(column.clone());

    ApplyRequest {
        tenant_id: "solo".to_string(),
        project_id: "project-1".to_string(),
        change: SchemaChange::AlterTable {
            table_id: table.id.clone(),
            table_name: "t_1".to_string(),
            operations: vec![ColumnOperation::AddColumn { column }],
        },
        full_new_document: document,
        observed_version: 5,
        user_id: user.to_string(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_add_column_twice_lands_at_six_and_seven() {
    let h = harness();
    let base = seed_version_5(&h).await;

    let first = {
        let coordinator = h.coordinator.clone();
        let (request, base) = (add_column_request(&base, "alice"), base.clone());
        tokio::spawn(async move { coordinator.apply_request(request, &base).await })
    };
    let second = {
        let coordinator = h.coordinator.clone();
        let (request, base) = (add_column_request(&base, "bob"), base.clone());
        tokio::spawn(async move { coordinator.apply_request(request, &base).await })
    };

    let a = first.await.unwrap().unwrap();
    let b = second.await.unwrap().unwrap();
    let versions: HashSet<i64> = [a.version, b.version].into_iter().collect();
    assert_eq!(versions, HashSet::from([6, 7]));

    let live = h.store.get_document(&"project-1".to_string()).await.unwrap().unwrap();
    assert_eq!(live.version, 7);
    assert_eq!(live.tables[0].columns.len(), 3);

    let columns = h.control.table_columns("public", "t_1").unwrap();
    assert_eq!(columns.iter().filter(|c| c.as_str() == "c_9").count(), 1);

    let audit = h.store.list_changes(&"project-1".to_string(), Some(5)).await.unwrap();
    let audited: Vec<i64> = audit.iter().map(|r| r.version).collect();
    assert_eq!(audited, vec![6, 7]);
}

#[tokio::test]
async fn test_stale_submit_without_retry_budget_reports_conflict() {
    let h = harness();
    let base = seed_version_5(&h).await;
    h.coordinator
        .apply_request(add_column_request(&base, "alice"), &base)
        .await
        .unwrap();

    let endpoint = {
        let router = Arc::new(DeploymentRouter::new(
            h.store.clone(),
            Arc::new(MemoryConnectionFactory::new()),
            h.control.clone(),
        ));
        Arc::new(DirectApplyEndpoint::new(h.store.clone(), router))
    };
    let single_shot = SchemaChangeCoordinator::new(
        endpoint,
        RetryPolicy::new(1, std::time::Duration::ZERO),
    );

    let err = single_shot
        .apply_request(add_column_request(&base, "bob"), &base)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Conflict { .. }));
    assert_eq!(err.status_hint(), 409);
    assert_eq!(err.to_string(), schema_sync::error::MODIFIED_BY_ANOTHER_USER);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_versions_equal_initial_plus_successes() {
    let h = harness();
    let base = SchemaDocument::new("project-1");

    let mut handles = Vec::new();
    for i in 0..6 {
        let coordinator = h.coordinator.clone();
        let table = Table::new(format!("Table {}", i)).with_column(Column::primary_key("id"));
        let mut document = base.clone();
        document.tables.push(table.clone());
        let request = ApplyRequest {
            tenant_id: "solo".to_string(),
            project_id: "project-1".to_string(),
            change: SchemaChange::CreateTable { table },
            full_new_document: document,
            observed_version: 0,
            user_id: format!("user-{}", i),
        };
        let base = base.clone();
        handles.push(tokio::spawn(async move { coordinator.apply_request(request, &base).await }));
    }

    let mut succeeded = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(applied) => succeeded.push(applied.version),
            Err(e) => assert!(e.is_conflict(), "unexpected failure: {}", e),
        }
    }

    let unique: HashSet<i64> = succeeded.iter().copied().collect();
    assert_eq!(unique.len(), succeeded.len());

    let live = h.store.get_document(&"project-1".to_string()).await.unwrap().unwrap();
    assert_eq!(live.version, succeeded.len() as i64);
    assert_eq!(live.tables.len(), succeeded.len());
    assert_eq!(
        h.store.list_changes(&"project-1".to_string(), None).await.unwrap().len(),
        succeeded.len()
    );
}

#[tokio::test]
async fn test_stale_session_keeps_concurrent_column_on_same_table() {
    let h = harness();
    let base = seed_version_5(&h).await;
    let alice = session(&h, "alice").await;
    let bob = session(&h, "bob").await;
    let table_id = base.tables[0].id.clone();

    let mut theirs = alice.table(&table_id).unwrap();
    theirs.columns.push(Column::new("X", LogicalType::Text));
    assert_eq!(h.coordinator.apply_table_edit(&alice, theirs).await.unwrap(), 6);

    // Bob still holds version 5
    let mut ours = bob.table(&table_id).unwrap();
    ours.columns.push(Column::new("Y", LogicalType::Integer));
    assert_eq!(h.coordinator.apply_table_edit(&bob, ours).await.unwrap(), 7);

    let (documented, physical) = both_planes(&h).await;
    assert_eq!(documented.len(), 4);
    assert_eq!(documented, physical);

    let names: Vec<String> = bob.table(&table_id).unwrap().columns.into_iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["id", "Total", "Y", "X"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_edits_to_one_table_keep_planes_aligned() {
    let h = harness();
    let base = seed_version_5(&h).await;

    let mut handles = Vec::new();
    for (user, label, internal) in [("alice", "Weight", "c_10"), ("bob", "Height", "c_11")] {
        let mut column = Column::new(label, LogicalType::Decimal);
        column.internal_name = internal.to_string();
        let added = column.clone();
        let request = alter_request(
            &base,
            user,
            ColumnOperation::AddColumn { column },
            move |table| table.columns.push(added),
        );
        let (coordinator, base) = (h.coordinator.clone(), base.clone());
        handles.push(tokio::spawn(async move { coordinator.apply_request(request, &base).await }));
    }

    let mut versions = HashSet::new();
    for handle in handles {
        versions.insert(handle.await.unwrap().unwrap().version);
    }
    assert_eq!(versions, HashSet::from([6, 7]));

    let (documented, physical) = both_planes(&h).await;
    assert_eq!(documented, vec!["c_1", "c_10", "c_11", "c_2"]);
    assert_eq!(documented, physical);
}

#[tokio::test]
async fn test_change_to_concurrently_dropped_column_conflicts() {
    let h = harness();
    let base = seed_version_5(&h).await;
    let total = base.tables[0].columns[1].clone();

    let drop_total = alter_request(
        &base,
        "alice",
        ColumnOperation::DropColumn {
            column_id: total.id.clone(),
            column_name: total.internal_name.clone(),
        },
        |table| {
            table.columns.pop();
        },
    );
    assert_eq!(h.coordinator.apply_request(drop_total, &base).await.unwrap().version, 6);

    let retype = alter_request(
        &base,
        "bob",
        ColumnOperation::AlterColumnType {
            column_id: total.id.clone(),
            column_name: total.internal_name.clone(),
            from: LogicalType::Decimal,
            to: LogicalType::Integer,
        },
        |table| table.columns[1].data_type = LogicalType::Integer,
    );
    let err = h.coordinator.apply_request(retype, &base).await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(err.to_string(), schema_sync::error::MODIFIED_BY_ANOTHER_USER);

    let (documented, physical) = both_planes(&h).await;
    assert_eq!(documented, vec!["c_1"]);
    assert_eq!(documented, physical);
}
