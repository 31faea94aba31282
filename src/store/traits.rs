use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::error::SyncResult;
use crate::model::{
    DeploymentConfig, DeploymentStrategy, Id, ResolvedTenant, ResourceLimits, Row, RowQuery,
    SchemaChange, SchemaChangeRecord, SchemaDocument, Tenant, TenantMembership,
};

/// Control-plane storage of versioned schema documents and their audit log
#[async_trait::async_trait]
pub trait ControlPlaneStore: Send + Sync {
    /// Current document of a project, if one was ever applied
    async fn get_document(&self, project_id: &Id) -> Result<Option<SchemaDocument>>;
    /// Lock the project's document for one versioned apply
    async fn begin_apply(&self, tenant_id: &Id, project_id: &Id) -> Result<Box<dyn DocumentLease>>;
    /// Audit records of a project, oldest first, optionally after a version
    async fn list_changes(
        &self,
        project_id: &Id,
        after_version: Option<i64>,
    ) -> Result<Vec<SchemaChangeRecord>>;
}

/// Exclusive hold on one project's document for the duration of an apply.
/// Dropping the lease without committing releases it unchanged.
#[async_trait::async_trait]
pub trait DocumentLease: Send {
    /// Live version under the lease (0 when the project has no document yet)
    fn current_version(&self) -> i64;
    /// Persist the document, append the audit record and emit the schema
    /// feed event, all or nothing
    async fn commit(self: Box<Self>, document: SchemaDocument, record: SchemaChangeRecord)
        -> Result<()>;
}

#[async_trait::async_trait]
pub trait TenantStore: Send + Sync {
    async fn get_tenant(&self, tenant_id: &Id) -> Result<Option<Tenant>>;
    async fn upsert_tenant(&self, tenant: Tenant) -> Result<()>;
    async fn get_deployment_config(&self, tenant_id: &Id) -> Result<Option<DeploymentConfig>>;
    async fn upsert_deployment_config(&self, config: DeploymentConfig) -> Result<()>;
    async fn get_membership(&self, tenant_id: &Id, user_id: &str) -> Result<Option<TenantMembership>>;
    async fn upsert_membership(&self, membership: TenantMembership) -> Result<()>;
    /// Tenants a user belongs to, each with the config needed to connect
    async fn list_tenants_for_user(&self, user_id: &str) -> Result<Vec<ResolvedTenant>>;
}

pub trait Store: ControlPlaneStore + TenantStore + Send + Sync {}

/// A tenant's physical store. Errors are classified so the coordinator can
/// tell transient locks and connectivity failures from fatal ones.
#[async_trait::async_trait]
pub trait DataPlane: Send + Sync {
    /// Endpoint identity, used for logging and solo-mode checks
    fn endpoint(&self) -> &str;
    /// Execute the physical DDL of a change inside `namespace`
    async fn execute(&self, namespace: &str, change: &SchemaChange) -> SyncResult<()>;
    /// Full row set of a physical table, keyed by internal column names
    async fn fetch_rows(&self, namespace: &str, table: &str, query: &RowQuery)
        -> SyncResult<Vec<Row>>;
    async fn ping(&self) -> SyncResult<()>;
}

/// Everything needed to open a tenant's data-plane connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionDescriptor {
    pub tenant_id: Id,
    pub strategy: DeploymentStrategy,
    pub endpoint_url: String,
    pub credential: String,
    pub namespace: String,
}

#[async_trait::async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn open(&self, descriptor: &ConnectionDescriptor) -> SyncResult<Arc<dyn DataPlane>>;
}

/// A live, routed data-plane handle for one tenant.
#[derive(Clone)]
pub struct RoutedConnection {
    pub tenant_id: Id,
    /// `None` in solo mode, where the control-plane connection is reused
    pub strategy: Option<DeploymentStrategy>,
    pub namespace: String,
    pub data_plane: Arc<dyn DataPlane>,
    pub limits: ResourceLimits,
}

impl RoutedConnection {
    pub fn is_solo(&self) -> bool {
        self.strategy.is_none()
    }
}

impl fmt::Debug for RoutedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutedConnection")
            .field("tenant_id", &self.tenant_id)
            .field("strategy", &self.strategy)
            .field("namespace", &self.namespace)
            .field("endpoint", &self.data_plane.endpoint())
            .field("limits", &self.limits)
            .finish()
    }
}
