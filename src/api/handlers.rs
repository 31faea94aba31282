use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    Json as RequestJson,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::SyncError;
use crate::logic::{ApplyEndpoint, DeploymentRouter, DirectApplyEndpoint};
use crate::model::{
    ApplyRequest, ApplyResponse, DeploymentStrategy, Id, ResolvedTenant, ResourceLimits,
    SchemaChangeRecord, SchemaDocument, SubscriptionTier, Table, Tenant, UserContext,
};
use crate::store::traits::Store;

/// Shared handler state: the control-plane store plus the routing and apply
/// machinery built on it.
pub struct AppState<S: Store> {
    pub store: Arc<S>,
    pub router: Arc<DeploymentRouter>,
    pub endpoint: DirectApplyEndpoint,
}

impl<S: Store + 'static> AppState<S> {
    pub fn new(store: Arc<S>, router: Arc<DeploymentRouter>) -> Self {
        let endpoint = DirectApplyEndpoint::new(store.clone(), router.clone());
        Self {
            store,
            router,
            endpoint,
        }
    }
}

pub type SharedState<S> = Arc<AppState<S>>;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(items: Vec<T>) -> Self {
        let total = items.len();
        Self { items, total }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: &str) -> Self {
        Self {
            error: message.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChangesQuery {
    /// Only records applied after this version
    pub after: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct TierRequest {
    pub tier: SubscriptionTier,
}

/// Where a tenant's data plane currently lives
#[derive(Debug, Serialize)]
pub struct ConnectionInfo {
    pub tenant_id: Id,
    pub solo: bool,
    pub strategy: Option<DeploymentStrategy>,
    pub namespace: String,
    pub endpoint: String,
    pub limits: ResourceLimits,
}

fn sync_error(e: SyncError) -> (StatusCode, Json<ErrorResponse>) {
    let status =
        StatusCode::from_u16(e.status_hint()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorResponse::new(&e.to_string())))
}

fn store_error(e: anyhow::Error) -> (StatusCode, Json<ErrorResponse>) {
    log::error!("Control-plane store error: {:#}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new(&e.to_string())),
    )
}

/// Versioned apply. The HTTP status mirrors the response's status hint so
/// both plain HTTP clients and [`HttpApplyEndpoint`](crate::api::client::HttpApplyEndpoint)
/// can classify failures.
pub async fn apply_change<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    Path((tenant_id, project_id)): Path<(Id, Id)>,
    user: UserContext,
    RequestJson(mut request): RequestJson<ApplyRequest>,
) -> (StatusCode, Json<ApplyResponse>) {
    if request.tenant_id != tenant_id || request.project_id != project_id {
        let err = SyncError::Validation(format!(
            "request targets {}/{} but was posted to {}/{}",
            request.tenant_id, request.project_id, tenant_id, project_id
        ));
        return (StatusCode::BAD_REQUEST, Json(ApplyResponse::failed(&err, None)));
    }
    if request.user_id.trim().is_empty() {
        request.user_id = user.user_id;
    }

    match state.endpoint.submit(&request).await {
        Ok(version) => (StatusCode::OK, Json(ApplyResponse::applied(version))),
        Err(err) => {
            let current_version = if err.is_conflict() {
                state
                    .store
                    .get_document(&project_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|d| d.version)
            } else {
                None
            };
            log::warn!(
                "Apply of {} to project {} by {} rejected: {}",
                request.change.kind(),
                project_id,
                request.user_id,
                err
            );
            let status = StatusCode::from_u16(err.status_hint())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(ApplyResponse::failed(&err, current_version)))
        }
    }
}

/// Live document of a project; an empty version-0 document if none exists.
pub async fn get_document<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    Path((tenant_id, project_id)): Path<(Id, Id)>,
) -> ApiResult<SchemaDocument> {
    state
        .endpoint
        .fetch_document(&tenant_id, &project_id)
        .await
        .map(Json)
        .map_err(sync_error)
}

/// User-visible tables; junction tables are left out.
pub async fn list_tables<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    Path((_tenant_id, project_id)): Path<(Id, Id)>,
) -> ApiResult<ListResponse<Table>> {
    let document = state
        .store
        .get_document(&project_id)
        .await
        .map_err(store_error)?
        .unwrap_or_else(|| SchemaDocument::new(project_id.clone()));

    let tables: Vec<Table> = document.user_tables().into_iter().cloned().collect();
    Ok(Json(tables.into()))
}

pub async fn list_changes<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    Path((_tenant_id, project_id)): Path<(Id, Id)>,
    Query(query): Query<ChangesQuery>,
) -> ApiResult<ListResponse<SchemaChangeRecord>> {
    let changes = state
        .store
        .list_changes(&project_id, query.after)
        .await
        .map_err(store_error)?;
    Ok(Json(changes.into()))
}

pub async fn get_connection<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    Path(tenant_id): Path<Id>,
) -> ApiResult<ConnectionInfo> {
    let connection = state
        .router
        .connection_for(&tenant_id)
        .await
        .map_err(sync_error)?;

    Ok(Json(ConnectionInfo {
        tenant_id: connection.tenant_id.clone(),
        solo: connection.is_solo(),
        strategy: connection.strategy,
        namespace: connection.namespace.clone(),
        endpoint: connection.data_plane.endpoint().to_string(),
        limits: connection.limits.clone(),
    }))
}

/// Tier changes are owner-only.
pub async fn change_tier<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    Path(tenant_id): Path<Id>,
    user: UserContext,
    RequestJson(request): RequestJson<TierRequest>,
) -> ApiResult<Tenant> {
    let membership = state
        .store
        .get_membership(&tenant_id, &user.user_id)
        .await
        .map_err(store_error)?;
    let is_owner = matches!(
        membership.map(|m| m.role),
        Some(crate::model::TenantRole::Owner)
    );
    if !is_owner {
        return Err(sync_error(SyncError::Permission(format!(
            "only owners can change the tier of tenant {}",
            tenant_id
        ))));
    }

    state
        .router
        .change_tier(&tenant_id, request.tier)
        .await
        .map(Json)
        .map_err(sync_error)
}

/// Tenant resolution: every tenant the user belongs to, with the deployment
/// config needed to connect.
pub async fn list_user_tenants<S: Store + 'static>(
    State(state): State<SharedState<S>>,
    Path(user_id): Path<String>,
) -> ApiResult<ListResponse<ResolvedTenant>> {
    let tenants = state
        .store
        .list_tenants_for_user(&user_id)
        .await
        .map_err(store_error)?;
    Ok(Json(tenants.into()))
}
