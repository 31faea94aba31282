use axum::serve;
use schema_sync::build_app;
use schema_sync::config::{AppConfig, Backend};
use schema_sync::logic::DeploymentRouter;
use schema_sync::store::{
    ChangeFeedHub, DataPlane, MemoryConnectionFactory, MemoryDataPlane, MemoryStore,
    PostgresConnectionFactory, PostgresDataPlane, PostgresFeedBridge, PostgresStore, Store,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .parse_default_env()
        .init();

    println!("schema-sync: schema change synchronization server");

    let config = AppConfig::load()?;
    log::info!(
        "Configuration loaded: server={}:{}, backend={:?}",
        config.server.host,
        config.server.port,
        config.data_plane.backend
    );

    let feed = ChangeFeedHub::new(config.sync.feed_capacity, Duration::ZERO);

    match config.data_plane.backend {
        Backend::Memory => {
            log::warn!("Running on the in-memory backend, nothing is persisted");
            let store = Arc::new(MemoryStore::with_feed(feed.clone()));
            let control: Arc<dyn DataPlane> =
                Arc::new(MemoryDataPlane::with_feed("memory://control", feed.clone()));
            let factory = Arc::new(MemoryConnectionFactory::with_feed(feed));
            let router = Arc::new(DeploymentRouter::new(store.clone(), factory, control));
            run_server(store, router, &config).await
        }
        Backend::Postgres => {
            log::info!("Connecting to PostgreSQL...");
            let database_url = config.database_url()?;
            let postgres_store =
                PostgresStore::new(&database_url, config.database.max_connections.unwrap_or(20))
                    .await?;

            log::info!("Running database migrations...");
            postgres_store.migrate().await?;

            let pool = postgres_store.pool().clone();
            PostgresFeedBridge::changes(pool.clone(), feed.clone()).spawn();
            // Solo tenants keep their tables on the control-plane database
            PostgresFeedBridge::rows(pool.clone(), feed.clone()).spawn();

            let control: Arc<dyn DataPlane> = Arc::new(PostgresDataPlane::new(
                "control-plane",
                pool,
                config.lock_timeout(),
            ));
            let factory = Arc::new(
                PostgresConnectionFactory::new(
                    config.data_plane.shared_url.clone(),
                    config.data_plane.max_connections,
                    config.lock_timeout(),
                )
                .with_feed(feed),
            );

            let store = Arc::new(postgres_store);
            let router = Arc::new(DeploymentRouter::new(store.clone(), factory, control));
            run_server(store, router, &config).await
        }
    }
}

async fn run_server<S: Store + 'static>(
    store: Arc<S>,
    router: Arc<DeploymentRouter>,
    config: &AppConfig,
) -> anyhow::Result<()> {
    let app = build_app(store, router);

    let bind_address = config.server_address();
    let listener = TcpListener::bind(&bind_address).await?;
    log::info!("schema-sync server running on http://{}", bind_address);

    serve(listener, app).await?;

    Ok(())
}
