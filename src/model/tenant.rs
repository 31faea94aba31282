use crate::model::{is_valid_identifier, Id};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Basic,
    Premium,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStrategy {
    /// Shared store, tenant scoped by a derived schema namespace
    SharedSchema,
    /// Dedicated namespace inside a shared instance
    DedicatedSchema,
    /// Fully dedicated database instance
    DedicatedInstance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Suspended,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantRole {
    Owner,
    Editor,
    Viewer,
}

impl TenantRole {
    pub fn can_edit_schema(&self) -> bool {
        matches!(self, TenantRole::Owner | TenantRole::Editor)
    }
}

impl SubscriptionTier {
    pub fn deployment_strategy(&self) -> DeploymentStrategy {
        match self {
            SubscriptionTier::Free => DeploymentStrategy::SharedSchema,
            SubscriptionTier::Basic => DeploymentStrategy::DedicatedSchema,
            SubscriptionTier::Premium => DeploymentStrategy::DedicatedInstance,
        }
    }

    pub fn default_limits(&self) -> ResourceLimits {
        match self {
            SubscriptionTier::Free => ResourceLimits {
                max_tables: Some(10),
                max_rows: Some(10_000),
                max_storage_mb: Some(100),
            },
            SubscriptionTier::Basic => ResourceLimits {
                max_tables: Some(50),
                max_rows: Some(1_000_000),
                max_storage_mb: Some(5_000),
            },
            SubscriptionTier::Premium => ResourceLimits::unlimited(),
        }
    }
}

/// `None` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_tables: Option<u32>,
    pub max_rows: Option<u64>,
    pub max_storage_mb: Option<u64>,
}

impl ResourceLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_tables.is_none() && self.max_rows.is_none() && self.max_storage_mb.is_none()
    }

    pub fn allows_tables(&self, count: usize) -> bool {
        self.max_tables
            .map(|max| count <= max as usize)
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub tables: u32,
    pub rows: u64,
    pub storage_mb: u64,
}

/// Created on signup completion, never hard-deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Id,
    pub name: String,
    pub tier: SubscriptionTier,
    pub strategy: DeploymentStrategy,
    pub status: TenantStatus,
    #[serde(default)]
    pub usage: ResourceUsage,
    pub limits: ResourceLimits,
    pub created_at: String, // ISO 8601 timestamp
}

impl Tenant {
    pub fn new(id: impl Into<Id>, name: impl Into<String>, tier: SubscriptionTier) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tier,
            strategy: tier.deployment_strategy(),
            status: TenantStatus::Active,
            usage: ResourceUsage::default(),
            limits: tier.default_limits(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Upgrade or downgrade; strategy and limits follow the tier.
    pub fn set_tier(&mut self, tier: SubscriptionTier) {
        self.tier = tier;
        self.strategy = tier.deployment_strategy();
        self.limits = tier.default_limits();
    }

    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantMembership {
    pub tenant_id: Id,
    pub user_id: String,
    pub role: TenantRole,
}

/// Physical connection descriptor for a tenant's data plane. One active
/// config per tenant, created at provisioning time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub tenant_id: Id,
    pub endpoint_url: String,
    pub credential: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_namespace: Option<String>,
}

impl DeploymentConfig {
    /// Reject configs that can never produce a working connection.
    pub fn validate(&self) -> Result<(), String> {
        let url = self.endpoint_url.trim();
        let rest = url
            .strip_prefix("postgres://")
            .or_else(|| url.strip_prefix("postgresql://"))
            .ok_or_else(|| {
                format!(
                    "Deployment endpoint for tenant '{}' must be a postgres:// URL",
                    self.tenant_id
                )
            })?;

        let host = rest.rsplit('@').next().unwrap_or_default();
        let host = host.split(['/', '?']).next().unwrap_or_default();
        if host.is_empty() {
            return Err(format!(
                "Deployment endpoint for tenant '{}' has no host",
                self.tenant_id
            ));
        }
        if let Some((_, port)) = host.rsplit_once(':') {
            if port.parse::<u16>().is_err() {
                return Err(format!(
                    "Deployment endpoint for tenant '{}' has an invalid port '{}'",
                    self.tenant_id, port
                ));
            }
        }

        if self.credential.trim().is_empty() {
            return Err(format!(
                "Deployment credential for tenant '{}' is empty",
                self.tenant_id
            ));
        }

        if let Some(namespace) = &self.schema_namespace {
            if !is_valid_identifier(namespace) {
                return Err(format!(
                    "Deployment namespace '{}' for tenant '{}' is not a valid identifier",
                    namespace, self.tenant_id
                ));
            }
        }

        Ok(())
    }
}

/// One entry of the tenant resolution endpoint's response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedTenant {
    pub tenant: Tenant,
    pub role: TenantRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentConfig>,
}
