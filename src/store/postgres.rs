use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::postgres::{PgConnectOptions, PgListener, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row as SqlRow, Transaction};

use crate::error::{SyncError, SyncResult};
use crate::logic::ddl::DdlRenderer;
use crate::model::{
    DeploymentConfig, DeploymentStrategy, Id, ResolvedTenant, Row, RowChangeEvent, RowQuery,
    SchemaChange, SchemaChangeEvent, SchemaChangeRecord, SchemaDocument, SortDirection, Tenant,
    TenantMembership,
};
use crate::store::feed::ChangeFeedHub;
use crate::store::traits::{
    ConnectionDescriptor, ConnectionFactory, ControlPlaneStore, DataPlane, DocumentLease, Store,
    TenantStore,
};

/// Notification channel carrying row events from data-plane triggers
pub const ROWS_CHANNEL: &str = "schema_sync_rows";
/// Notification channel announcing committed schema changes
pub const CHANGES_CHANNEL: &str = "schema_sync_changes";

fn to_text<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(text) => Ok(text),
        other => Err(anyhow!("Expected a string enum, got {}", other)),
    }
}

fn from_text<T: DeserializeOwned>(text: String) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(text.clone()))
        .with_context(|| format!("Unknown enum value '{}'", text))
}

// ============================================================================
// CONTROL PLANE
// ============================================================================

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn tenant_from_row(row: &PgRow) -> Result<Tenant> {
    Ok(Tenant {
        id: row.get("id"),
        name: row.get("name"),
        tier: from_text(row.get("tier"))?,
        strategy: from_text(row.get("strategy"))?,
        status: from_text(row.get("status"))?,
        usage: serde_json::from_value(row.get("usage")).unwrap_or_default(),
        limits: serde_json::from_value(row.get("limits")).context("Invalid tenant limits")?,
        created_at: row.get("created_at"),
    })
}

fn record_from_row(row: &PgRow) -> SchemaChangeRecord {
    SchemaChangeRecord {
        id: row.get("id"),
        project_id: row.get("project_id"),
        change_type: row.get("change_type"),
        change_data: row.get("change_data"),
        created_by: row.get("created_by"),
        applied_at: row.get("applied_at"),
        version: row.get("version"),
    }
}

/// Holds the project's advisory lock for the lifetime of the transaction.
struct PostgresLease {
    tx: Transaction<'static, Postgres>,
    tenant_id: Id,
    project_id: Id,
    version: i64,
}

#[async_trait::async_trait]
impl DocumentLease for PostgresLease {
    fn current_version(&self) -> i64 {
        self.version
    }

    async fn commit(
        self: Box<Self>,
        document: SchemaDocument,
        record: SchemaChangeRecord,
    ) -> Result<()> {
        let PostgresLease {
            mut tx,
            tenant_id,
            project_id,
            version,
        } = *self;

        if document.version != version + 1 {
            return Err(anyhow!(
                "Document version {} does not follow leased version {}",
                document.version,
                version
            ));
        }

        let blob = serde_json::to_value(&document).context("Failed to serialize document")?;
        sqlx::query(
            r#"
            INSERT INTO schema_documents (project_id, tenant_id, version, document, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (project_id) DO UPDATE SET
                version = EXCLUDED.version,
                document = EXCLUDED.document,
                updated_at = NOW()
            "#,
        )
        .bind(&project_id)
        .bind(&tenant_id)
        .bind(document.version)
        .bind(blob)
        .execute(&mut *tx)
        .await
        .context("Failed to persist schema document")?;

        sqlx::query(
            r#"
            INSERT INTO schema_changes (id, project_id, change_type, change_data, created_by, applied_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&record.id)
        .bind(&record.project_id)
        .bind(&record.change_type)
        .bind(&record.change_data)
        .bind(&record.created_by)
        .bind(record.applied_at)
        .bind(record.version)
        .execute(&mut *tx)
        .await
        .context("Failed to append schema change record")?;

        // Delivered on commit only; the bridge loads the record itself
        let announcement = serde_json::json!({
            "project_id": project_id,
            "version": record.version,
        });
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CHANGES_CHANNEL)
            .bind(announcement.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to announce schema change")?;

        tx.commit().await.context("Failed to commit schema apply")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ControlPlaneStore for PostgresStore {
    async fn get_document(&self, project_id: &Id) -> Result<Option<SchemaDocument>> {
        let row = sqlx::query("SELECT document, version FROM schema_documents WHERE project_id = $1")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch schema document")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut document: SchemaDocument = serde_json::from_value(row.get("document"))
            .context("Stored schema document is not valid")?;
        // The column is authoritative
        document.version = row.get("version");
        Ok(Some(document))
    }

    async fn begin_apply(&self, tenant_id: &Id, project_id: &Id) -> Result<Box<dyn DocumentLease>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin apply transaction")?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(project_id)
            .execute(&mut *tx)
            .await
            .context("Failed to lock schema document")?;

        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM schema_documents WHERE project_id = $1")
                .bind(project_id)
                .fetch_optional(&mut *tx)
                .await
                .context("Failed to read document version")?;

        Ok(Box::new(PostgresLease {
            tx,
            tenant_id: tenant_id.clone(),
            project_id: project_id.clone(),
            version: version.unwrap_or(0),
        }))
    }

    async fn list_changes(
        &self,
        project_id: &Id,
        after_version: Option<i64>,
    ) -> Result<Vec<SchemaChangeRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, project_id, change_type, change_data, created_by, applied_at, version
            FROM schema_changes
            WHERE project_id = $1 AND version > $2
            ORDER BY version
            "#,
        )
        .bind(project_id)
        .bind(after_version.unwrap_or(0))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list schema changes")?;

        Ok(rows.iter().map(record_from_row).collect())
    }
}

#[async_trait::async_trait]
impl TenantStore for PostgresStore {
    async fn get_tenant(&self, tenant_id: &Id) -> Result<Option<Tenant>> {
        let row = sqlx::query(
            "SELECT id, name, tier, strategy, status, usage, limits, created_at FROM tenants WHERE id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch tenant")?;

        row.as_ref().map(tenant_from_row).transpose()
    }

    async fn upsert_tenant(&self, tenant: Tenant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tenants (id, name, tier, strategy, status, usage, limits, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                tier = EXCLUDED.tier,
                strategy = EXCLUDED.strategy,
                status = EXCLUDED.status,
                usage = EXCLUDED.usage,
                limits = EXCLUDED.limits,
                updated_at = NOW()
            "#,
        )
        .bind(&tenant.id)
        .bind(&tenant.name)
        .bind(to_text(&tenant.tier)?)
        .bind(to_text(&tenant.strategy)?)
        .bind(to_text(&tenant.status)?)
        .bind(serde_json::to_value(&tenant.usage)?)
        .bind(serde_json::to_value(&tenant.limits)?)
        .bind(&tenant.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to upsert tenant")?;

        Ok(())
    }

    async fn get_deployment_config(&self, tenant_id: &Id) -> Result<Option<DeploymentConfig>> {
        let row = sqlx::query(
            "SELECT tenant_id, endpoint_url, credential, schema_namespace FROM deployment_configs WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch deployment config")?;

        Ok(row.map(|row| DeploymentConfig {
            tenant_id: row.get("tenant_id"),
            endpoint_url: row.get("endpoint_url"),
            credential: row.get("credential"),
            schema_namespace: row.get("schema_namespace"),
        }))
    }

    async fn upsert_deployment_config(&self, config: DeploymentConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO deployment_configs (tenant_id, endpoint_url, credential, schema_namespace)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id) DO UPDATE SET
                endpoint_url = EXCLUDED.endpoint_url,
                credential = EXCLUDED.credential,
                schema_namespace = EXCLUDED.schema_namespace,
                updated_at = NOW()
            "#,
        )
        .bind(&config.tenant_id)
        .bind(&config.endpoint_url)
        .bind(&config.credential)
        .bind(&config.schema_namespace)
        .execute(&self.pool)
        .await
        .context("Failed to upsert deployment config")?;

        Ok(())
    }

    async fn get_membership(&self, tenant_id: &Id, user_id: &str) -> Result<Option<TenantMembership>> {
        let row = sqlx::query(
            "SELECT tenant_id, user_id, role FROM tenant_members WHERE tenant_id = $1 AND user_id = $2",
        )
        .bind(tenant_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch tenant membership")?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(TenantMembership {
            tenant_id: row.get("tenant_id"),
            user_id: row.get("user_id"),
            role: from_text(row.get("role"))?,
        }))
    }

    async fn upsert_membership(&self, membership: TenantMembership) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tenant_members (tenant_id, user_id, role)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id, user_id) DO UPDATE SET role = EXCLUDED.role
            "#,
        )
        .bind(&membership.tenant_id)
        .bind(&membership.user_id)
        .bind(to_text(&membership.role)?)
        .execute(&self.pool)
        .await
        .context("Failed to upsert tenant membership")?;

        Ok(())
    }

    async fn list_tenants_for_user(&self, user_id: &str) -> Result<Vec<ResolvedTenant>> {
        let rows = sqlx::query(
            r#"
            SELECT t.id, t.name, t.tier, t.strategy, t.status, t.usage, t.limits, t.created_at,
                   m.role, d.endpoint_url, d.credential, d.schema_namespace
            FROM tenant_members m
            JOIN tenants t ON t.id = m.tenant_id
            LEFT JOIN deployment_configs d ON d.tenant_id = t.id
            WHERE m.user_id = $1
            ORDER BY t.created_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list tenants for user")?;

        rows.iter()
            .map(|row| {
                let tenant = tenant_from_row(row)?;
                let endpoint_url: Option<String> = row.get("endpoint_url");
                let deployment = endpoint_url.map(|endpoint_url| DeploymentConfig {
                    tenant_id: tenant.id.clone(),
                    endpoint_url,
                    credential: row.get::<Option<String>, _>("credential").unwrap_or_default(),
                    schema_namespace: row.get("schema_namespace"),
                });
                Ok(ResolvedTenant {
                    role: from_text(row.get("role"))?,
                    tenant,
                    deployment,
                })
            })
            .collect()
    }
}

impl Store for PostgresStore {}

// ============================================================================
// DATA PLANE
// ============================================================================

#[derive(Debug, Clone)]
pub struct PostgresDataPlane {
    endpoint: String,
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresDataPlane {
    pub fn new(endpoint: impl Into<String>, pool: PgPool, lock_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            pool,
            lock_timeout,
        }
    }

    /// Trigger that forwards row writes of a physical table to [`ROWS_CHANNEL`].
    /// Oversized rows are announced without their payload.
    fn row_trigger(ns: &str, table: &str) -> Vec<String> {
        vec![
            format!(
                r#"CREATE OR REPLACE FUNCTION {ns}.schema_sync_notify_row() RETURNS trigger AS $fn$
DECLARE
    payload jsonb;
BEGIN
    payload := jsonb_build_object('namespace', TG_TABLE_SCHEMA, 'table', TG_TABLE_NAME, 'kind', TG_OP);
    IF TG_OP <> 'DELETE' THEN
        payload := payload || jsonb_build_object('record', to_jsonb(NEW));
    END IF;
    IF TG_OP <> 'INSERT' THEN
        payload := payload || jsonb_build_object('old_record', to_jsonb(OLD));
    END IF;
    IF octet_length(payload::text) > 7900 THEN
        payload := jsonb_build_object('namespace', TG_TABLE_SCHEMA, 'table', TG_TABLE_NAME, 'kind', TG_OP);
    END IF;
    PERFORM pg_notify('{channel}', payload::text);
    RETURN NULL;
END
$fn$ LANGUAGE plpgsql"#,
                ns = ns,
                channel = ROWS_CHANNEL,
            ),
            format!(
                "DROP TRIGGER IF EXISTS schema_sync_rows ON {}.{}",
                ns, table
            ),
            format!(
                "CREATE TRIGGER schema_sync_rows AFTER INSERT OR UPDATE OR DELETE ON {ns}.{table} FOR EACH ROW EXECUTE FUNCTION {ns}.schema_sync_notify_row()",
                ns = ns,
                table = table,
            ),
        ]
    }
}

#[async_trait::async_trait]
impl DataPlane for PostgresDataPlane {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn execute(&self, namespace: &str, change: &SchemaChange) -> SyncResult<()> {
        let mut statements = DdlRenderer::render(namespace, change)?;
        if statements.is_empty() {
            return Ok(());
        }

        let ns = DdlRenderer::quote_ident(namespace)?;
        if let SchemaChange::CreateTable { table } = change {
            let physical = DdlRenderer::quote_ident(&table.internal_name)?;
            statements.extend(Self::row_trigger(&ns, &physical));
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = {}",
            self.lock_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", ns))
            .execute(&mut *tx)
            .await?;

        for statement in &statements {
            log::debug!("[{}] {}", self.endpoint, statement);
            sqlx::query(statement).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn fetch_rows(&self, namespace: &str, table: &str, query: &RowQuery) -> SyncResult<Vec<Row>> {
        let mut sql = format!(
            "SELECT row_to_json(t)::jsonb AS row FROM {}.{} t",
            DdlRenderer::quote_ident(namespace)?,
            DdlRenderer::quote_ident(table)?
        );

        let mut conditions = Vec::with_capacity(query.filters.len());
        for (index, (column, _)) in query.filters.iter().enumerate() {
            conditions.push(format!(
                "to_jsonb(t.{}) = ${}::jsonb",
                DdlRenderer::quote_ident(column)?,
                index + 1
            ));
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        let mut ordering = Vec::with_capacity(query.order_by.len());
        for (column, direction) in &query.order_by {
            ordering.push(format!(
                "t.{} {}",
                DdlRenderer::quote_ident(column)?,
                match direction {
                    SortDirection::Asc => "ASC",
                    SortDirection::Desc => "DESC",
                }
            ));
        }
        if !ordering.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&ordering.join(", "));
        }

        let mut statement = sqlx::query(&sql);
        for (_, value) in &query.filters {
            statement = statement.bind(value);
        }

        let rows = statement.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| match row.try_get::<serde_json::Value, _>("row")? {
                serde_json::Value::Object(map) => Ok(map),
                other => Err(SyncError::MalformedPayload(format!(
                    "row of {}.{} is not an object: {}",
                    namespace, table, other
                ))),
            })
            .collect()
    }

    async fn ping(&self) -> SyncResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Opens data-plane pools lazily. Pools are shared between tenants that
/// resolve to the same endpoint and credential.
pub struct PostgresConnectionFactory {
    shared_url: Option<String>,
    max_connections: u32,
    lock_timeout: Duration,
    feed: Option<ChangeFeedHub>,
    pools: Mutex<HashMap<String, Arc<PostgresDataPlane>>>,
}

impl PostgresConnectionFactory {
    pub fn new(shared_url: Option<String>, max_connections: u32, lock_timeout: Duration) -> Self {
        Self {
            shared_url,
            max_connections,
            lock_timeout,
            feed: None,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Forward row notifications of every opened pool into `feed`
    pub fn with_feed(mut self, feed: ChangeFeedHub) -> Self {
        self.feed = Some(feed);
        self
    }

    fn endpoint_for(&self, descriptor: &ConnectionDescriptor) -> String {
        match (descriptor.strategy, &self.shared_url) {
            (DeploymentStrategy::DedicatedInstance, _) | (_, None) => descriptor.endpoint_url.clone(),
            (_, Some(shared)) => shared.clone(),
        }
    }
}

#[async_trait::async_trait]
impl ConnectionFactory for PostgresConnectionFactory {
    async fn open(&self, descriptor: &ConnectionDescriptor) -> SyncResult<Arc<dyn DataPlane>> {
        let endpoint = self.endpoint_for(descriptor);
        let key = format!("{}#{}", endpoint, descriptor.credential);

        if let Some(existing) = self.pools.lock().get(&key) {
            return Ok(existing.clone());
        }

        let options = PgConnectOptions::from_str(&endpoint)
            .map_err(|e| {
                SyncError::Configuration(format!(
                    "endpoint for tenant '{}' is invalid: {}",
                    descriptor.tenant_id, e
                ))
            })?
            .password(&descriptor.credential);

        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy_with(options);

        let plane = Arc::new(PostgresDataPlane::new(
            endpoint.clone(),
            pool.clone(),
            self.lock_timeout,
        ));

        let mut pools = self.pools.lock();
        if let Some(raced) = pools.get(&key) {
            return Ok(raced.clone());
        }
        pools.insert(key, plane.clone());
        drop(pools);

        if let Some(feed) = &self.feed {
            PostgresFeedBridge::rows(pool, feed.clone()).spawn();
        }

        log::info!(
            "Opened data-plane pool for tenant {} ({:?}) at {}",
            descriptor.tenant_id,
            descriptor.strategy,
            endpoint
        );
        Ok(plane)
    }
}

// ============================================================================
// FEED BRIDGE
// ============================================================================

/// Forwards `LISTEN` notifications into a [`ChangeFeedHub`].
pub struct PostgresFeedBridge {
    pool: PgPool,
    hub: ChangeFeedHub,
    channels: Vec<&'static str>,
}

impl PostgresFeedBridge {
    /// Schema-change announcements of a control-plane database
    pub fn changes(pool: PgPool, hub: ChangeFeedHub) -> Self {
        Self {
            pool,
            hub,
            channels: vec![CHANGES_CHANNEL],
        }
    }

    /// Row events of a data-plane database
    pub fn rows(pool: PgPool, hub: ChangeFeedHub) -> Self {
        Self {
            pool,
            hub,
            channels: vec![ROWS_CHANNEL],
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                log::error!("Feed bridge on {:?} stopped: {:#}", self.channels, e);
            }
        })
    }

    async fn run(&self) -> Result<()> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .context("Failed to open notification listener")?;
        listener
            .listen_all(self.channels.iter().copied())
            .await
            .context("Failed to LISTEN")?;

        loop {
            let notification = listener.recv().await.context("Listener connection lost")?;
            match notification.channel() {
                ROWS_CHANNEL => self.forward_row(notification.payload()),
                CHANGES_CHANNEL => self.forward_change(notification.payload()).await,
                other => log::debug!("Ignoring notification on channel {}", other),
            }
        }
    }

    fn forward_row(&self, payload: &str) {
        match serde_json::from_str::<RowChangeEvent>(payload) {
            Ok(event) => {
                self.hub.publish_row(event);
            }
            Err(e) => log::warn!("Dropping malformed row notification: {}", e),
        }
    }

    async fn forward_change(&self, payload: &str) {
        let announcement: serde_json::Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Dropping malformed change notification: {}", e);
                return;
            }
        };
        let (Some(project_id), Some(version)) = (
            announcement["project_id"].as_str(),
            announcement["version"].as_i64(),
        ) else {
            log::warn!("Dropping change notification without project/version: {}", payload);
            return;
        };

        let row = sqlx::query(
            r#"
            SELECT id, project_id, change_type, change_data, created_by, applied_at, version
            FROM schema_changes
            WHERE project_id = $1 AND version = $2
            "#,
        )
        .bind(project_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(Some(row)) => {
                let event: SchemaChangeEvent = record_from_row(&row).into();
                self.hub.publish_schema(event);
            }
            Ok(None) => log::warn!(
                "Change notification for {} v{} has no audit record",
                project_id,
                version
            ),
            Err(e) => log::warn!("Failed to load announced change {} v{}: {}", project_id, version, e),
        }
    }
}
