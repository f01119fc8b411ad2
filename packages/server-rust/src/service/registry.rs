use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::hub_service::HubService;

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Hosted services by id.
///
/// Registration order is kept so shutdown can stop services in reverse.
pub struct ServiceRegistry {
    by_id: DashMap<String, Arc<HubService>>,
    order: RwLock<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("service {0} is already registered")]
pub struct DuplicateService(pub String);

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Adds `service` under its id.
    ///
    /// # Errors
    ///
    /// `DuplicateService` if the id is taken; the existing service is kept.
    pub fn register(&self, service: Arc<HubService>) -> Result<(), DuplicateService> {
        let id = service.id().to_string();
        match self.by_id.entry(id.clone()) {
            Entry::Occupied(_) => return Err(DuplicateService(id)),
            Entry::Vacant(slot) => {
                slot.insert(service);
            }
        }
        self.order.write().push(id);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<HubService>> {
        self.by_id.get(id).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Removes a service without stopping it.
    pub fn unregister(&self, id: &str) -> Option<Arc<HubService>> {
        let (_, service) = self.by_id.remove(id)?;
        self.order.write().retain(|s| s != id);
        Some(service)
    }

    /// Relayed services provided by `client_id`, in registration order.
    #[must_use]
    pub fn services_of(&self, client_id: &str) -> Vec<Arc<HubService>> {
        self.ids()
            .iter()
            .filter_map(|id| self.get(id))
            .filter(|service| service.is_provided_by(client_id))
            .collect()
    }

    /// Service ids in registration order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.order.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Stops and removes every service, last registered first. Returns the
    /// stopped ids in stop order.
    pub fn shutdown_all(&self) -> Vec<String> {
        let order = std::mem::take(&mut *self.order.write());
        let mut stopped = Vec::with_capacity(order.len());
        for id in order.into_iter().rev() {
            if let Some((_, service)) = self.by_id.remove(&id) {
                service.stop();
                stopped.push(id);
            }
        }
        stopped
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::network::{ChannelConnection, ConnectionConfig, ConnectionRegistry};
    use crate::pool::AsyncPool;
    use crate::relay::RelayRequestExecutor;
    use crate::service::hub_service::{LocalExecutor, ServiceStatus};

    fn pool() -> Arc<AsyncPool> {
        Arc::new(AsyncPool::new("test", 2, 16))
    }

    fn local(id: &str) -> Arc<HubService> {
        HubService::local(id, pool(), Arc::new(LocalExecutor::new(id, Duration::from_secs(1))), false)
    }

    #[test]
    fn register_rejects_duplicates() {
        let registry = ServiceRegistry::new();
        let first = local("a");
        registry.register(Arc::clone(&first)).unwrap();
        assert_eq!(registry.register(local("a")), Err(DuplicateService("a".into())));
        assert!(Arc::ptr_eq(&registry.get("a").unwrap(), &first));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_keeps_order_of_others() {
        let registry = ServiceRegistry::new();
        for id in ["a", "b", "c"] {
            registry.register(local(id)).unwrap();
        }
        assert!(registry.unregister("b").is_some());
        assert!(registry.unregister("b").is_none());
        assert_eq!(registry.ids(), ["a", "c"]);
        assert!(!registry.contains("b"));
    }

    #[test]
    fn shutdown_stops_in_reverse_order() {
        let registry = ServiceRegistry::new();
        let services: Vec<_> = ["a", "b", "c"].iter().map(|id| local(id)).collect();
        for service in &services {
            registry.register(Arc::clone(service)).unwrap();
        }
        assert_eq!(registry.shutdown_all(), ["c", "b", "a"]);
        assert!(registry.is_empty());
        assert!(services.iter().all(|s| s.status() == ServiceStatus::Stopped));
    }

    #[test]
    fn services_of_filters_by_provider() {
        let connections = Arc::new(ConnectionRegistry::new());
        let (conn, _rx) = ChannelConnection::new("10.0.0.9:1", &ConnectionConfig::default());
        connections.register(Some("client-1"), conn);

        let registry = ServiceRegistry::new();
        registry.register(local("a")).unwrap();
        for id in ["r1", "r2"] {
            let executor = RelayRequestExecutor::bind("client-1", Arc::clone(&connections), Duration::from_secs(1));
            registry.register(HubService::relay(id, "client-1", pool(), executor, false)).unwrap();
        }

        let ids: Vec<String> = registry.services_of("client-1").iter().map(|s| s.id().to_string()).collect();
        assert_eq!(ids, ["r1", "r2"]);
        assert!(registry.services_of("client-2").is_empty());
    }
}
