use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::model::Id;
use crate::store::RoutedConnection;

/// Per-tenant data-plane connections, kept for the process lifetime and
/// dropped on sign-out or tier change
#[derive(Debug, Clone, Default)]
pub struct ConnectionCache {
    entries: Arc<RwLock<HashMap<Id, RoutedConnection>>>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, tenant_id: &Id) -> Option<RoutedConnection> {
        self.entries.read().await.get(tenant_id).cloned()
    }

    /// Put a connection into cache, keeping an existing one if another task
    /// opened it first. Returns the connection that is now cached.
    pub async fn put(&self, connection: RoutedConnection) -> RoutedConnection {
        let mut entries = self.entries.write().await;
        entries
            .entry(connection.tenant_id.clone())
            .or_insert(connection)
            .clone()
    }

    /// Drop a tenant's connection. Returns true if one was cached.
    pub async fn invalidate(&self, tenant_id: &Id) -> bool {
        self.entries.write().await.remove(tenant_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
