use axum::{
    routing::{get, post, put},
    Router,
};

use crate::api::handlers::{self, SharedState};
use crate::store::traits::Store;

pub fn create_router<S: Store + 'static>() -> Router<SharedState<S>> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Apply endpoint and document reads
        .route(
            "/tenants/:tenant_id/projects/:project_id/apply",
            post(handlers::apply_change::<S>),
        )
        .route(
            "/tenants/:tenant_id/projects/:project_id/document",
            get(handlers::get_document::<S>),
        )
        .route(
            "/tenants/:tenant_id/projects/:project_id/tables",
            get(handlers::list_tables::<S>),
        )
        .route(
            "/tenants/:tenant_id/projects/:project_id/changes",
            get(handlers::list_changes::<S>),
        )
        // Routing
        .route("/tenants/:tenant_id/connection", get(handlers::get_connection::<S>))
        .route("/tenants/:tenant_id/tier", put(handlers::change_tier::<S>))
        // Tenant resolution
        .route("/users/:user_id/tenants", get(handlers::list_user_tenants::<S>))
}
