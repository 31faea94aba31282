pub mod api;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod store;

use std::sync::Arc;

// Export API types
pub use api::handlers;
pub use api::routes;

pub use error::{ConflictKind, SyncError, SyncResult};

// Export logic types
pub use logic::{
    ApplyEndpoint, ColumnIdentityMapper, DeploymentRouter, DirectApplyEndpoint,
    RealtimeReconciler, RelationshipCardinalityConverter, RetryPolicy, SchemaChangeCoordinator,
    TableDiffEngine, TenantContext,
};

// Export all model types
pub use model::*;

// Export store types
pub use store::{ChangeFeedHub, MemoryStore, PostgresStore, Store};

/// The HTTP application: every route, with its state attached.
pub fn build_app<S: Store + 'static>(store: Arc<S>, router: Arc<DeploymentRouter>) -> axum::Router {
    let state = Arc::new(api::handlers::AppState::new(store, router));
    api::routes::create_router::<S>()
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
}
