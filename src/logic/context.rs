use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::SyncResult;
use crate::logic::identity::ColumnIdentityMapper;
use crate::logic::router::DeploymentRouter;
use crate::model::{Id, SchemaDocument, Table, UserContext};
use crate::store::{ControlPlaneStore, RoutedConnection};

/// Local copy of a project's document, shared between the coordinator and
/// the reconciler of one session.
pub type SharedDocument = Arc<RwLock<SchemaDocument>>;

/// Everything one session needs to edit a project: who is editing, which
/// data plane the tenant is routed to, and the local document state.
#[derive(Clone)]
pub struct TenantContext {
    pub tenant_id: Id,
    pub project_id: Id,
    pub user: UserContext,
    pub connection: RoutedConnection,
    pub document: SharedDocument,
    pub mapper: Arc<ColumnIdentityMapper>,
}

impl TenantContext {
    pub fn new(
        tenant_id: impl Into<Id>,
        project_id: impl Into<Id>,
        user: UserContext,
        connection: RoutedConnection,
        document: SchemaDocument,
    ) -> Self {
        let mapper = ColumnIdentityMapper::from_document(&document);
        Self {
            tenant_id: tenant_id.into(),
            project_id: project_id.into(),
            user,
            connection,
            document: Arc::new(RwLock::new(document)),
            mapper: Arc::new(mapper),
        }
    }

    /// Route the tenant and load the project's current document (an empty
    /// version-0 document if nothing was ever applied).
    pub async fn open(
        router: &DeploymentRouter,
        store: &dyn ControlPlaneStore,
        tenant_id: &Id,
        project_id: &Id,
        user: UserContext,
    ) -> SyncResult<Self> {
        let connection = router.connection_for(tenant_id).await?;
        let document = store
            .get_document(project_id)
            .await?
            .unwrap_or_else(|| SchemaDocument::new(project_id.clone()));

        Ok(Self::new(
            tenant_id.clone(),
            project_id.clone(),
            user,
            connection,
            document,
        ))
    }

    pub fn snapshot(&self) -> SchemaDocument {
        self.document.read().clone()
    }

    pub fn version(&self) -> i64 {
        self.document.read().version
    }

    pub fn table(&self, table_id: &Id) -> Option<Table> {
        self.document.read().get_table(table_id).cloned()
    }

    /// Swap in a document (after an apply or a reload) and rebuild the
    /// mapping of every table.
    pub fn replace_document(&self, document: SchemaDocument) {
        self.mapper.rebuild_document(&document);
        *self.document.write() = document;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Column, LogicalType};
    use crate::store::{MemoryConnectionFactory, MemoryDataPlane, MemoryStore};

    #[tokio::test]
    async fn test_open_starts_from_empty_document() {
        let store = Arc::new(MemoryStore::new());
        let router = DeploymentRouter::new(
            store.clone(),
            Arc::new(MemoryConnectionFactory::new()),
            Arc::new(MemoryDataPlane::new("memory://control")),
        );

        let ctx = TenantContext::open(
            &router,
            store.as_ref(),
            &"tenant-1".to_string(),
            &"project-1".to_string(),
            UserContext::new("alice"),
        )
        .await
        .unwrap();

        assert_eq!(ctx.version(), 0);
        assert!(ctx.connection.is_solo());

        let table = Table::new("Notes").with_column(Column::new("Body", LogicalType::Text));
        let mut document = ctx.snapshot();
        document.tables.push(table.clone());
        document.version = 1;
        ctx.replace_document(document);

        assert_eq!(ctx.version(), 1);
        assert_eq!(ctx.mapper.physical_table(&table.id), Some(table.internal_name.clone()));
    }
}
