use std::sync::Arc;

use schema_sync::logic::{
    DeploymentRouter, DirectApplyEndpoint, RelationshipCardinalityConverter, RetryPolicy,
    SchemaChangeCoordinator, TenantContext,
};
use schema_sync::store::{DataPlane, MemoryConnectionFactory, MemoryDataPlane, MemoryStore};
use schema_sync::{
    Column, LogicalType, Relationship, RelationshipType, Row, RowQuery, Table, UserContext,
};
use serde_json::json;

struct Session {
    control: Arc<MemoryDataPlane>,
    coordinator: SchemaChangeCoordinator,
    ctx: TenantContext,
}

async fn session() -> Session {
    let store = Arc::new(MemoryStore::new());
    let control = Arc::new(MemoryDataPlane::new("memory://control"));
    let router = Arc::new(DeploymentRouter::new(
        store.clone(),
        Arc::new(MemoryConnectionFactory::new()),
        control.clone(),
    ));
    let endpoint = Arc::new(DirectApplyEndpoint::new(store.clone(), router.clone()));
    let ctx = TenantContext::open(
        &router,
        store.as_ref(),
        &"solo".to_string(),
        &"project-1".to_string(),
        UserContext::new("alice"),
    )
    .await
    .unwrap();

    Session {
        control,
        coordinator: SchemaChangeCoordinator::new(endpoint, RetryPolicy::default()),
        ctx,
    }
}

fn contacts() -> Table {
    Table::new("Contacts")
        .with_column(Column::primary_key("id"))
        .with_column(Column::new("Name", LogicalType::Text))
        .with_column(Column::new("Email", LogicalType::Varchar))
}

#[tokio::test]
async fn test_solo_tenant_runs_on_control_plane() {
    let s = session().await;

    assert!(s.ctx.connection.is_solo());
    assert_eq!(s.ctx.connection.data_plane.endpoint(), "memory://control");
    assert!(s.ctx.connection.limits.is_unlimited());
}

#[tokio::test]
async fn test_reorder_and_rename_bump_version_without_ddl() {
    let s = session().await;
    let table = contacts();
    s.coordinator.apply_table_edit(&s.ctx, table.clone()).await.unwrap();
    let statements = s.control.executed_statements().len();
    let email_internal = s.ctx.mapper.internal_name_of(&table.id, &table.columns[2].id);

    let mut reordered = s.ctx.table(&table.id).unwrap();
    reordered.columns.swap(1, 2);
    assert_eq!(s.coordinator.apply_table_edit(&s.ctx, reordered).await.unwrap(), 2);

    for (version, name) in [(3, "E-mail"), (4, "Mail"), (5, "Email")] {
        let mut renamed = s.ctx.table(&table.id).unwrap();
        renamed.columns[1].name = name.to_string();
        assert_eq!(
            s.coordinator.apply_table_edit(&s.ctx, renamed).await.unwrap(),
            version
        );
        assert_eq!(
            s.ctx.mapper.internal_name_of(&table.id, &table.columns[2].id),
            email_internal
        );
    }

    assert_eq!(s.control.executed_statements().len(), statements);
    assert_eq!(s.ctx.version(), 5);
}

#[tokio::test]
async fn test_many_to_many_round_trip_keeps_junction_rows() {
    let s = session().await;
    let students = Table::new("Students").with_column(Column::primary_key("id"));
    let courses = Table::new("Courses").with_column(Column::primary_key("id"));
    s.coordinator.apply_table_edit(&s.ctx, students.clone()).await.unwrap();
    s.coordinator.apply_table_edit(&s.ctx, courses.clone()).await.unwrap();

    let relationship = Relationship {
        id: "enrollment".to_string(),
        relationship_type: RelationshipType::ManyToMany,
        from_table_id: students.id.clone(),
        from_column_id: students.columns[0].id.clone(),
        to_table_id: courses.id.clone(),
        to_column_id: courses.columns[0].id.clone(),
        junction_table_id: None,
    };
    let plan = RelationshipCardinalityConverter::plan_create(&s.ctx.snapshot(), relationship).unwrap();
    s.coordinator.apply_plan(&s.ctx, plan).await.unwrap();

    let document = s.ctx.snapshot();
    let junction_id = document.relationships[0].junction_table_id.clone().unwrap();
    let junction = document.get_table(&junction_id).unwrap().clone();
    assert_eq!(document.user_tables().len(), 2);

    let mut row = Row::new();
    row.insert(junction.columns[0].internal_name.clone(), json!("s-1"));
    row.insert(junction.columns[1].internal_name.clone(), json!("c-1"));
    s.control.insert_row("public", &junction.internal_name, row).unwrap();

    let plan = RelationshipCardinalityConverter::plan_convert(
        &s.ctx.snapshot(),
        &"enrollment".to_string(),
        RelationshipType::OneToMany,
    )
    .unwrap();
    s.coordinator.apply_plan(&s.ctx, plan).await.unwrap();

    let document = s.ctx.snapshot();
    assert_eq!(document.relationships[0].relationship_type, RelationshipType::OneToMany);
    assert!(document.get_table(&junction_id).is_some());

    let rows = s
        .control
        .fetch_rows("public", &junction.internal_name, &RowQuery::default())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);

    let courses_now = document.get_table(&courses.id).unwrap();
    let foreign_key = courses_now.foreign_key_to(&students.id).unwrap();
    assert!(s.control.has_constraint(
        "public",
        &courses_now.internal_name,
        &format!("fk_{}_{}", courses_now.internal_name, foreign_key.internal_name)
    ));
}

#[tokio::test]
async fn test_internal_name_change_is_rejected_locally() {
    let s = session().await;
    let table = contacts();
    s.coordinator.apply_table_edit(&s.ctx, table.clone()).await.unwrap();

    let mut broken = s.ctx.table(&table.id).unwrap();
    broken.columns[1].internal_name = "Not Valid".to_string();
    let err = s.coordinator.apply_table_edit(&s.ctx, broken).await.unwrap_err();

    assert!(!err.is_retryable());
    assert_eq!(s.ctx.version(), 1);
}
