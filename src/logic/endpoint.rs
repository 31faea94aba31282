//! Server side of the apply protocol.

use std::sync::Arc;

use crate::error::{SyncError, SyncResult};
use crate::logic::router::DeploymentRouter;
use crate::model::{ApplyRequest, Id, SchemaChange, SchemaChangeRecord, SchemaDocument};
use crate::store::Store;

/// Where the coordinator submits versioned applies. Implemented in-process
/// by [`DirectApplyEndpoint`] and over HTTP by
/// [`HttpApplyEndpoint`](crate::api::client::HttpApplyEndpoint).
#[async_trait::async_trait]
pub trait ApplyEndpoint: Send + Sync {
    /// Apply one change at `observed_version`. Returns the new version.
    async fn submit(&self, request: &ApplyRequest) -> SyncResult<i64>;

    /// Live document of a project (empty at version 0 if none exists yet)
    async fn fetch_document(&self, tenant_id: &Id, project_id: &Id) -> SyncResult<SchemaDocument>;
}

pub struct DirectApplyEndpoint {
    store: Arc<dyn Store>,
    router: Arc<DeploymentRouter>,
}

impl DirectApplyEndpoint {
    pub fn new(store: Arc<dyn Store>, router: Arc<DeploymentRouter>) -> Self {
        Self { store, router }
    }

    /// Tenant must be active and the user a member allowed to edit. Tenants
    /// without a record run solo and are open to their single user.
    async fn authorize(&self, request: &ApplyRequest) -> SyncResult<()> {
        let Some(tenant) = self
            .store
            .get_tenant(&request.tenant_id)
            .await
            .map_err(SyncError::from_store)?
        else {
            return Ok(());
        };

        if !tenant.is_active() {
            return Err(SyncError::Permission(format!(
                "tenant {} is {:?}",
                tenant.id, tenant.status
            )));
        }

        let membership = self
            .store
            .get_membership(&request.tenant_id, &request.user_id)
            .await
            .map_err(SyncError::from_store)?
            .ok_or_else(|| {
                SyncError::Permission(format!(
                    "user {} is not a member of tenant {}",
                    request.user_id, request.tenant_id
                ))
            })?;

        if !membership.role.can_edit_schema() {
            return Err(SyncError::Permission(format!(
                "role {:?} cannot change the schema",
                membership.role
            )));
        }

        Ok(())
    }

    fn check_request(request: &ApplyRequest) -> SyncResult<()> {
        let document = &request.full_new_document;
        if document.project_id != request.project_id {
            return Err(SyncError::Validation(format!(
                "document belongs to project {} but was submitted for {}",
                document.project_id, request.project_id
            )));
        }
        if request.user_id.trim().is_empty() {
            return Err(SyncError::Validation("user id is required".to_string()));
        }

        document.validate().map_err(SyncError::Validation)?;

        match &request.change {
            SchemaChange::DropTable { table_id, .. } => {
                if document.get_table(table_id).is_some() {
                    return Err(SyncError::Validation(format!(
                        "dropped table {} is still in the document",
                        table_id
                    )));
                }
            }
            change => {
                if let Some(table_id) = change.table_id() {
                    if document.get_table(table_id).is_none() {
                        return Err(SyncError::Validation(format!(
                            "changed table {} is missing from the document",
                            table_id
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl ApplyEndpoint for DirectApplyEndpoint {
    async fn submit(&self, request: &ApplyRequest) -> SyncResult<i64> {
        Self::check_request(request)?;
        self.authorize(request).await?;

        let connection = self.router.connection_for(&request.tenant_id).await?;
        if let SchemaChange::CreateTable { .. } = request.change {
            let tables = request.full_new_document.user_tables().len();
            if !connection.limits.allows_tables(tables) {
                return Err(SyncError::Permission(format!(
                    "tenant {} is limited to {} tables",
                    request.tenant_id,
                    connection.limits.max_tables.unwrap_or_default()
                )));
            }
        }

        let lease = self
            .store
            .begin_apply(&request.tenant_id, &request.project_id)
            .await
            .map_err(SyncError::from_store)?;
        let live = lease.current_version();
        if request.observed_version != live {
            return Err(SyncError::version_conflict(format!(
                "observed version {} but project {} is at {}",
                request.observed_version, request.project_id, live
            )));
        }

        if request.change.has_ddl() {
            connection
                .data_plane
                .execute(&connection.namespace, &request.change)
                .await?;
        }

        let new_version = live + 1;
        let mut document = request.full_new_document.clone();
        document.version = new_version;
        document.prune_display_columns();

        let record = SchemaChangeRecord::new(
            &request.project_id,
            &request.change,
            &request.user_id,
            new_version,
        )
        .map_err(|e| SyncError::Internal(e.into()))?;

        lease
            .commit(document, record)
            .await
            .map_err(SyncError::from_store)?;

        log::info!(
            "Applied {} to project {} by {} -> v{}",
            request.change.kind(),
            request.project_id,
            request.user_id,
            new_version
        );
        Ok(new_version)
    }

    async fn fetch_document(&self, _tenant_id: &Id, project_id: &Id) -> SyncResult<SchemaDocument> {
        Ok(self
            .store
            .get_document(project_id)
            .await
            .map_err(SyncError::from_store)?
            .unwrap_or_else(|| SchemaDocument::new(project_id.clone())))
    }
}
