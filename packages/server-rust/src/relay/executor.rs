//! Forwarding requests to the remote client that provides a service.
//!
//! A [`RelayRequestExecutor`] keeps the live connections of one provider
//! client. Each request starts at the next connection in rotation and fails
//! over to the following ones until one answers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use relayhub_core::{new_message_id, ListenerId, Message, Observable};
use tracing::{debug, warn};

use crate::network::{Connection, ConnectionEvent, ConnectionRegistry, TransportError};
use crate::service::request::{RequestStatus, ServiceRequest};
use crate::service::task_queue::Executor;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("no connection registered at {0}")]
    UnknownConnection(String),
    #[error("connection {address} belongs to {owner:?}, not {provider}")]
    ForeignConnection {
        address: String,
        owner: Option<String>,
        provider: String,
    },
    #[error("connection {0} is not live")]
    NotLive(String),
    #[error("connection {0} already in the relay set")]
    Duplicate(String),
}

/// Relay executor bound to one provider client.
pub struct RelayRequestExecutor {
    provider: String,
    registry: Arc<ConnectionRegistry>,
    connections: RwLock<Vec<Arc<dyn Connection>>>,
    cursor: AtomicUsize,
    timeout: Duration,
    drained: Observable<String>,
    listener: ListenerId,
}

impl RelayRequestExecutor {
    /// Creates an executor for `provider`, seeded with every live
    /// connection the registry holds for it, and subscribes to the
    /// registry's connection events.
    #[must_use]
    pub fn bind(provider: impl Into<String>, registry: Arc<ConnectionRegistry>, timeout: Duration) -> Arc<Self> {
        let provider = provider.into();
        let seed: Vec<Arc<dyn Connection>> = registry
            .connections_of(&provider)
            .into_iter()
            .filter(|c| c.is_live())
            .collect();

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let listener = registry.events().subscribe(move |event: &ConnectionEvent| {
                if let Some(executor) = weak.upgrade() {
                    executor.on_connection_event(event);
                }
            });
            debug!(provider = %provider, connections = seed.len(), "relay executor bound");
            Self {
                provider,
                registry: Arc::clone(&registry),
                connections: RwLock::new(seed),
                cursor: AtomicUsize::new(0),
                timeout,
                drained: Observable::new(),
                listener,
            }
        })
    }

    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Addresses of the current relay set, in rotation order.
    #[must_use]
    pub fn provider_connections(&self) -> Vec<String> {
        self.connections
            .read()
            .iter()
            .map(|c| c.address().to_string())
            .collect()
    }

    #[must_use]
    pub fn has_connections(&self) -> bool {
        !self.connections.read().is_empty()
    }

    /// Fires with the provider id when the relay set becomes empty.
    #[must_use]
    pub fn drained(&self) -> &Observable<String> {
        &self.drained
    }

    /// Adds the registered connection at `address` to the relay set. A
    /// stale entry at the same address is replaced.
    ///
    /// # Errors
    ///
    /// Unknown, foreign, dead or already present connections are rejected.
    pub fn update_provider_connection(&self, address: &str) -> Result<(), RelayError> {
        let conn = self
            .registry
            .get(address)
            .ok_or_else(|| RelayError::UnknownConnection(address.to_string()))?;
        let owner = self.registry.owner_of(address);
        if owner.as_deref() != Some(self.provider.as_str()) {
            return Err(RelayError::ForeignConnection {
                address: address.to_string(),
                owner,
                provider: self.provider.clone(),
            });
        }
        if !conn.is_live() {
            return Err(RelayError::NotLive(address.to_string()));
        }

        let mut connections = self.connections.write();
        match connections.iter().position(|c| c.address() == address) {
            Some(i) if same_connection(&connections[i], &conn) => {
                return Err(RelayError::Duplicate(address.to_string()));
            }
            Some(i) => {
                connections[i] = conn;
                debug!(provider = %self.provider, address, "relay connection replaced");
            }
            None => {
                connections.push(conn);
                debug!(provider = %self.provider, address, "relay connection added");
            }
        }
        Ok(())
    }

    fn on_connection_event(&self, event: &ConnectionEvent) {
        if event.owner() != Some(self.provider.as_str()) {
            return;
        }
        if let ConnectionEvent::Registered { address, .. } = event {
            self.adopt_replacement(address);
        }
        self.prune();
    }

    /// Swaps a relay entry for the live connection now registered at the
    /// same address.
    fn adopt_replacement(&self, address: &str) {
        let Some(fresh) = self.registry.get(address).filter(|c| c.is_live()) else {
            return;
        };
        let mut connections = self.connections.write();
        if let Some(slot) = connections.iter_mut().find(|c| c.address() == address) {
            if !same_connection(slot, &fresh) {
                *slot = fresh;
                debug!(provider = %self.provider, address, "relay connection re-registered");
            }
        }
    }

    /// Drops connections that are dead or no longer the registry's entry
    /// for their address. Emits on `drained` if this empties a non-empty
    /// set.
    pub fn prune(&self) {
        let emptied = {
            let mut connections = self.connections.write();
            let before = connections.len();
            connections.retain(|c| {
                c.is_live()
                    && self
                        .registry
                        .get(c.address())
                        .is_some_and(|current| same_connection(&current, c))
            });
            before > 0 && connections.is_empty()
        };
        if emptied {
            warn!(provider = %self.provider, "relay connection set drained");
            self.drained.emit(&self.provider);
        }
    }

    async fn relay(&self, request: &ServiceRequest) -> Result<Message, TransportError> {
        let snapshot: Vec<Arc<dyn Connection>> = self.connections.read().clone();
        if snapshot.is_empty() {
            return Err(TransportError::Disconnected);
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % snapshot.len();

        let mut last_error = TransportError::Disconnected;
        for offset in 0..snapshot.len() {
            let conn = &snapshot[(start + offset) % snapshot.len()];
            if !conn.is_live() {
                last_error = TransportError::Disconnected;
                continue;
            }
            let outbound = request
                .message()
                .clone()
                .with_new_id(new_message_id())
                .with_to(self.provider.clone());
            match conn.request_with_timeout(outbound, self.timeout).await {
                Ok(response) => return Ok(response.with_new_id(request.id())),
                Err(e) => {
                    warn!(
                        provider = %self.provider,
                        address = conn.address(),
                        request = %request.id(),
                        error = %e,
                        "relay attempt failed"
                    );
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

#[async_trait]
impl Executor for RelayRequestExecutor {
    async fn execute(&self, request: Arc<ServiceRequest>) {
        if request.status() != RequestStatus::Processing {
            return;
        }
        let outcome = self.relay(&request).await;
        let failed = outcome.is_err();
        let response = match outcome {
            Ok(response) => response,
            Err(e) => Message::internal_error(
                request.message(),
                format!("relay to {} failed: {e}", self.provider),
            ),
        };
        // A request killed while in flight keeps its outcome.
        let _ = request.resolve(response);
        // Pruning may drain the set and kill the service's requests, so it
        // runs only once this one is settled.
        if failed {
            self.prune();
        }
    }
}

/// Identity of the underlying connection, ignoring vtables.
fn same_connection(a: &Arc<dyn Connection>, b: &Arc<dyn Connection>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

impl Drop for RelayRequestExecutor {
    fn drop(&mut self) {
        self.registry.events().unsubscribe(self.listener);
    }
}

impl std::fmt::Debug for RelayRequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayRequestExecutor")
            .field("provider", &self.provider)
            .field("connections", &self.provider_connections())
            .finish_non_exhaustive()
    }
}
