use std::sync::Arc;

use crate::error::{SyncError, SyncResult};
use crate::model::{
    is_valid_identifier, DeploymentStrategy, Id, ResourceLimits, SubscriptionTier, Tenant,
};
use crate::store::{
    ConnectionCache, ConnectionDescriptor, ConnectionFactory, DataPlane, RoutedConnection,
    TenantStore,
};

/// Namespace used when a tenant runs on the control-plane connection
pub const SOLO_NAMESPACE: &str = "public";

/// Resolves tenants to data-plane connections and caches them per tenant.
pub struct DeploymentRouter {
    tenants: Arc<dyn TenantStore>,
    factory: Arc<dyn ConnectionFactory>,
    control_plane: Arc<dyn DataPlane>,
    cache: ConnectionCache,
}

impl DeploymentRouter {
    pub fn new(
        tenants: Arc<dyn TenantStore>,
        factory: Arc<dyn ConnectionFactory>,
        control_plane: Arc<dyn DataPlane>,
    ) -> Self {
        Self {
            tenants,
            factory,
            control_plane,
            cache: ConnectionCache::new(),
        }
    }

    /// The connection solo-mode tenants are routed to
    pub fn control_plane(&self) -> Arc<dyn DataPlane> {
        self.control_plane.clone()
    }

    /// Live connection of a tenant, opened and cached on first use.
    pub async fn connection_for(&self, tenant_id: &Id) -> SyncResult<RoutedConnection> {
        if let Some(cached) = self.cache.get(tenant_id).await {
            return Ok(cached);
        }

        let connection = self.resolve(tenant_id).await?;
        Ok(self.cache.put(connection).await)
    }

    /// Persist a tier change. The cached connection is dropped so the next
    /// lookup routes with the new strategy and limits.
    pub async fn change_tier(&self, tenant_id: &Id, tier: SubscriptionTier) -> SyncResult<Tenant> {
        let mut tenant = self
            .tenants
            .get_tenant(tenant_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("tenant {}", tenant_id)))?;

        let previous = tenant.tier;
        tenant.set_tier(tier);
        self.tenants.upsert_tenant(tenant.clone()).await?;
        self.cache.invalidate(tenant_id).await;

        log::info!(
            "Tenant {} moved from {:?} to {:?} ({:?})",
            tenant_id,
            previous,
            tier,
            tenant.strategy
        );
        Ok(tenant)
    }

    pub async fn sign_out(&self, tenant_id: &Id) {
        if self.cache.invalidate(tenant_id).await {
            log::debug!("Dropped cached connection of tenant {}", tenant_id);
        }
    }

    pub async fn cached_connections(&self) -> usize {
        self.cache.len().await
    }

    async fn resolve(&self, tenant_id: &Id) -> SyncResult<RoutedConnection> {
        let Some(config) = self.tenants.get_deployment_config(tenant_id).await? else {
            log::info!("Tenant {} has no deployment config, running solo", tenant_id);
            return Ok(RoutedConnection {
                tenant_id: tenant_id.clone(),
                strategy: None,
                namespace: SOLO_NAMESPACE.to_string(),
                data_plane: self.control_plane.clone(),
                limits: ResourceLimits::unlimited(),
            });
        };

        config.validate().map_err(SyncError::Configuration)?;

        let tenant = self.tenants.get_tenant(tenant_id).await?.ok_or_else(|| {
            SyncError::Configuration(format!(
                "tenant {} has a deployment config but no tenant record",
                tenant_id
            ))
        })?;

        let strategy = tenant.tier.deployment_strategy();
        let namespace = match strategy {
            DeploymentStrategy::SharedSchema => derived_namespace(tenant_id),
            DeploymentStrategy::DedicatedSchema => config
                .schema_namespace
                .clone()
                .unwrap_or_else(|| derived_namespace(tenant_id)),
            DeploymentStrategy::DedicatedInstance => config
                .schema_namespace
                .clone()
                .unwrap_or_else(|| SOLO_NAMESPACE.to_string()),
        };

        let descriptor = ConnectionDescriptor {
            tenant_id: tenant_id.clone(),
            strategy,
            endpoint_url: config.endpoint_url.clone(),
            credential: config.credential.clone(),
            namespace: namespace.clone(),
        };
        let data_plane = self.factory.open(&descriptor).await?;

        log::info!(
            "Routed tenant {} ({:?}) to {} / {}",
            tenant_id,
            strategy,
            data_plane.endpoint(),
            namespace
        );

        Ok(RoutedConnection {
            tenant_id: tenant_id.clone(),
            strategy: Some(strategy),
            namespace,
            data_plane,
            limits: tenant.limits,
        })
    }
}

/// Per-tenant namespace inside a shared store, e.g. `tenant_acme_co`.
pub fn derived_namespace(tenant_id: &str) -> String {
    let mut namespace: String = format!("tenant_{}", tenant_id)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    namespace.truncate(63);
    debug_assert!(is_valid_identifier(&namespace));
    namespace
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeploymentConfig, SubscriptionTier};
    use crate::store::{MemoryConnectionFactory, MemoryDataPlane, MemoryStore};

    struct Fixture {
        store: Arc<MemoryStore>,
        factory: Arc<MemoryConnectionFactory>,
        router: DeploymentRouter,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let factory = Arc::new(MemoryConnectionFactory::new());
        let router = DeploymentRouter::new(
            store.clone(),
            factory.clone(),
            Arc::new(MemoryDataPlane::new("memory://control")),
        );
        Fixture {
            store,
            factory,
            router,
        }
    }

    async fn provision(store: &MemoryStore, id: &str, tier: SubscriptionTier, namespace: Option<&str>) {
        store
            .upsert_tenant(Tenant::new(id, "Acme", tier))
            .await
            .unwrap();
        store
            .upsert_deployment_config(DeploymentConfig {
                tenant_id: id.to_string(),
                endpoint_url: format!("postgres://{}.db.internal:5432/app", id),
                credential: "secret".to_string(),
                schema_namespace: namespace.map(str::to_string),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_solo_mode_reuses_control_plane() {
        let f = fixture();
        let connection = f.router.connection_for(&"solo".to_string()).await.unwrap();

        assert!(connection.is_solo());
        assert!(Arc::ptr_eq(&connection.data_plane, &f.router.control_plane()));
        assert!(connection.limits.is_unlimited());
        assert_eq!(f.factory.open_count(), 0);
    }

    #[tokio::test]
    async fn test_strategy_follows_tier() {
        let f = fixture();
        provision(&f.store, "free-co", SubscriptionTier::Free, Some("ignored")).await;
        provision(&f.store, "basic-co", SubscriptionTier::Basic, Some("basic_ns")).await;
        provision(&f.store, "premium-co", SubscriptionTier::Premium, None).await;

        let free = f.router.connection_for(&"free-co".to_string()).await.unwrap();
        assert_eq!(free.strategy, Some(DeploymentStrategy::SharedSchema));
        assert_eq!(free.namespace, "tenant_free_co");
        assert_eq!(free.limits.max_tables, Some(10));

        let basic = f.router.connection_for(&"basic-co".to_string()).await.unwrap();
        assert_eq!(basic.strategy, Some(DeploymentStrategy::DedicatedSchema));
        assert_eq!(basic.namespace, "basic_ns");

        let premium = f.router.connection_for(&"premium-co".to_string()).await.unwrap();
        assert_eq!(premium.strategy, Some(DeploymentStrategy::DedicatedInstance));
        assert_eq!(premium.namespace, SOLO_NAMESPACE);
        assert!(premium.limits.is_unlimited());
    }

    #[tokio::test]
    async fn test_malformed_config_is_fatal() {
        let f = fixture();
        f.store
            .upsert_deployment_config(DeploymentConfig {
                tenant_id: "broken".to_string(),
                endpoint_url: "not a url".to_string(),
                credential: "secret".to_string(),
                schema_namespace: None,
            })
            .await
            .unwrap();

        let err = f.router.connection_for(&"broken".to_string()).await.unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_connections_are_cached_until_tier_change() {
        let f = fixture();
        provision(&f.store, "acme", SubscriptionTier::Free, None).await;
        let tenant_id = "acme".to_string();

        f.router.connection_for(&tenant_id).await.unwrap();
        f.router.connection_for(&tenant_id).await.unwrap();
        assert_eq!(f.factory.open_count(), 1);

        let upgraded = f.router.change_tier(&tenant_id, SubscriptionTier::Premium).await.unwrap();
        assert_eq!(upgraded.strategy, DeploymentStrategy::DedicatedInstance);
        assert_eq!(f.router.cached_connections().await, 0);

        let connection = f.router.connection_for(&tenant_id).await.unwrap();
        assert_eq!(connection.strategy, Some(DeploymentStrategy::DedicatedInstance));
        assert_eq!(f.factory.open_count(), 2);

        f.router.sign_out(&tenant_id).await;
        assert_eq!(f.router.cached_connections().await, 0);
    }
}
