//! Services hosted by the hub.
//!
//! A [`HubService`] owns the uri prefix `/service/{id}` and a
//! [`ServiceTaskQueue`]. Its requests are executed either in-process by a
//! [`LocalExecutor`] or forwarded to the remote provider client by a
//! [`RelayRequestExecutor`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use parking_lot::{Mutex, RwLock};
use relayhub_core::{ListenerId, Message};
use tower::ServiceExt;
use tracing::{debug, info, warn};

use super::handler::{build_handler_stack, Handler};
use super::request::ServiceRequest;
use super::router::{method_of, normalize_short_uri, service_prefix};
use super::task_queue::{Executor, QueueError, ServiceTaskQueue};
use crate::network::ConnectionRegistry;
use crate::pool::{AsyncPool, Barrier, PoolError};
use crate::relay::RelayRequestExecutor;

// ---------------------------------------------------------------------------
// ServiceStatus
// ---------------------------------------------------------------------------

/// Service lifecycle.
///
/// `Starting -> Running`, `Running <-> Dead` (provider lost and restored),
/// and any state `-> Stopped`, which is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Starting,
    Running,
    /// No way to execute requests; waiting for the provider to come back.
    Dead,
    Stopped,
}

impl ServiceStatus {
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use ServiceStatus::{Dead, Running, Starting, Stopped};
        matches!(
            (self, next),
            (Starting, Running | Dead | Stopped) | (Running, Dead | Stopped) | (Dead, Running | Stopped)
        )
    }
}

/// Who executes a service's requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    Local,
    /// A connected client, by id.
    Remote(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("service {id}: illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        id: String,
        from: ServiceStatus,
        to: ServiceStatus,
    },
    #[error("service {0} is stopped")]
    Stopped(String),
    #[error("service {0} is not relayed")]
    NotRemote(String),
    #[error("service {service} is provided by {provider}, not {client}")]
    WrongProvider {
        service: String,
        provider: String,
        client: String,
    },
    #[error("provider {0} has no live connection")]
    NoLiveConnection(String),
    #[error("{verb} {short_uri} already has a handler")]
    DuplicateHandler { verb: Method, short_uri: String },
}

// ---------------------------------------------------------------------------
// LocalExecutor
// ---------------------------------------------------------------------------

/// Runs requests against in-process handlers keyed by verb and short uri.
pub struct LocalExecutor {
    service_id: String,
    prefix: String,
    timeout: Duration,
    handlers: Mutex<HashMap<(Method, String), Handler>>,
}

impl LocalExecutor {
    #[must_use]
    pub fn new(service_id: impl Into<String>, timeout: Duration) -> Self {
        let service_id = service_id.into();
        Self {
            prefix: service_prefix(&service_id),
            service_id,
            timeout,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Installs `handler` for `verb short_uri`, wrapped in the handler
    /// stack.
    ///
    /// # Errors
    ///
    /// `DuplicateHandler` if the route already has one.
    pub fn add_route(&self, verb: Method, short_uri: &str, handler: Handler) -> Result<(), ServiceError> {
        let key = (verb, normalize_short_uri(short_uri));
        let mut handlers = self.handlers.lock();
        if handlers.contains_key(&key) {
            return Err(ServiceError::DuplicateHandler {
                verb: key.0,
                short_uri: key.1,
            });
        }
        let stacked = build_handler_stack(&self.service_id, handler, self.timeout);
        handlers.insert(key, stacked);
        Ok(())
    }

    /// Registered `(verb, short uri)` pairs.
    #[must_use]
    pub fn routes(&self) -> Vec<(Method, String)> {
        self.handlers.lock().keys().cloned().collect()
    }

    fn handler_for(&self, request: &ServiceRequest) -> Option<Handler> {
        let method = method_of(request.message().message_type())?;
        let short = request.with_context(|ctx| {
            ctx.uri_pattern
                .as_deref()
                .and_then(|p| p.strip_prefix(self.prefix.as_str()))
                .map(normalize_short_uri)
        })?;
        self.handlers.lock().get(&(method, short)).cloned()
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn execute(&self, request: Arc<ServiceRequest>) {
        let response = match self.handler_for(&request) {
            None => Message::not_found(request.message(), "no handler for route"),
            Some(handler) => match handler.oneshot(Arc::clone(&request)).await {
                Ok(response) if response.id() == request.id() => response,
                Ok(response) => response.with_new_id(request.id()),
                Err(e) => e.to_response(request.message()),
            },
        };
        let _ = request.resolve(response);
    }
}

// ---------------------------------------------------------------------------
// HubService
// ---------------------------------------------------------------------------

struct RelayBinding {
    executor: Arc<RelayRequestExecutor>,
    drained_listener: ListenerId,
}

pub struct HubService {
    id: String,
    prefix: String,
    provider: Provider,
    require_auth: bool,
    status: Mutex<ServiceStatus>,
    queue: ServiceTaskQueue,
    local: Option<Arc<LocalExecutor>>,
    relay: RwLock<Option<RelayBinding>>,
}

impl HubService {
    /// A service executed in-process. Starts `Running`.
    #[must_use]
    pub fn local(id: impl Into<String>, pool: Arc<AsyncPool>, executor: Arc<LocalExecutor>, require_auth: bool) -> Arc<Self> {
        let id = id.into();
        Arc::new(Self {
            prefix: service_prefix(&id),
            queue: ServiceTaskQueue::new(id.clone(), pool, Arc::clone(&executor) as Arc<dyn Executor>),
            id,
            provider: Provider::Local,
            require_auth,
            status: Mutex::new(ServiceStatus::Running),
            local: Some(executor),
            relay: RwLock::new(None),
        })
    }

    /// A service relayed to `client_id`. Starts `Running` when the executor
    /// has a live connection, `Dead` otherwise.
    #[must_use]
    pub fn relay(
        id: impl Into<String>,
        client_id: impl Into<String>,
        pool: Arc<AsyncPool>,
        executor: Arc<RelayRequestExecutor>,
        require_auth: bool,
    ) -> Arc<Self> {
        let id = id.into();
        let initial = if executor.has_connections() {
            ServiceStatus::Running
        } else {
            ServiceStatus::Dead
        };
        let service = Arc::new(Self {
            prefix: service_prefix(&id),
            queue: ServiceTaskQueue::new(id.clone(), pool, Arc::clone(&executor) as Arc<dyn Executor>),
            id,
            provider: Provider::Remote(client_id.into()),
            require_auth,
            status: Mutex::new(initial),
            local: None,
            relay: RwLock::new(None),
        });
        service.bind_relay(executor);
        service
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    #[must_use]
    pub fn is_provided_by(&self, client_id: &str) -> bool {
        matches!(&self.provider, Provider::Remote(c) if c == client_id)
    }

    #[must_use]
    pub fn require_auth(&self) -> bool {
        self.require_auth
    }

    #[must_use]
    pub fn status(&self) -> ServiceStatus {
        *self.status.lock()
    }

    #[must_use]
    pub fn queue(&self) -> &ServiceTaskQueue {
        &self.queue
    }

    #[must_use]
    pub fn local_executor(&self) -> Option<&Arc<LocalExecutor>> {
        self.local.as_ref()
    }

    #[must_use]
    pub fn relay_executor(&self) -> Option<Arc<RelayRequestExecutor>> {
        self.relay.read().as_ref().map(|b| Arc::clone(&b.executor))
    }

    /// Moves the service to `to`.
    ///
    /// # Errors
    ///
    /// `IllegalTransition` for transitions outside the lifecycle; a live
    /// service is marked `Dead` before the error is returned.
    pub fn transit(&self, to: ServiceStatus) -> Result<(), ServiceError> {
        let mut status = self.status.lock();
        let from = *status;
        if from.can_transition_to(to) {
            *status = to;
            debug!(service = %self.id, ?from, ?to, "service status changed");
            return Ok(());
        }
        if from != ServiceStatus::Stopped {
            *status = ServiceStatus::Dead;
        }
        Err(ServiceError::IllegalTransition {
            id: self.id.clone(),
            from,
            to,
        })
    }

    /// Admits `request` into the service queue.
    ///
    /// # Errors
    ///
    /// The pool's error when it refuses the work.
    pub async fn schedule(&self, request: Arc<ServiceRequest>) -> Result<Option<Barrier>, PoolError> {
        self.queue.schedule(request).await
    }

    /// Marks the service dead and kills its admitted requests. A stopped
    /// service stays stopped.
    pub fn mark_dead(&self) {
        {
            let mut status = self.status.lock();
            if matches!(*status, ServiceStatus::Stopped | ServiceStatus::Dead) {
                return;
            }
            *status = ServiceStatus::Dead;
        }
        warn!(service = %self.id, "service is dead");
        self.kill_admitted();
    }

    fn kill_admitted(&self) {
        if let Err(QueueError::Aggregate(failures)) = self.queue.kill_all() {
            debug!(service = %self.id, already_ended = failures.len(), "some requests ended before kill");
        }
    }

    /// Replaces the relay executor, re-subscribing to its drain event.
    fn bind_relay(self: &Arc<Self>, executor: Arc<RelayRequestExecutor>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let drained_listener = executor.drained().subscribe(move |_provider: &String| {
            if let Some(service) = weak.upgrade() {
                service.mark_dead();
            }
        });
        self.queue.set_executor(Arc::clone(&executor) as Arc<dyn Executor>);
        let previous = self.relay.write().replace(RelayBinding {
            executor,
            drained_listener,
        });
        if let Some(old) = previous {
            old.executor.drained().unsubscribe(old.drained_listener);
        }
    }

    /// Rebinds a relayed service to a reconnected provider.
    ///
    /// A fresh executor is bound to `client_id`'s live connections. With at
    /// least one, a dead service returns to `Running`; with none, the
    /// service is left `Dead`.
    ///
    /// # Errors
    ///
    /// `NotRemote`, `WrongProvider` or `Stopped` when the service cannot be
    /// restored, `NoLiveConnection` when the provider has nothing live.
    pub fn restore_externally(
        self: &Arc<Self>,
        client_id: &str,
        registry: &Arc<ConnectionRegistry>,
        relay_timeout: Duration,
    ) -> Result<(), ServiceError> {
        let Provider::Remote(provider) = &self.provider else {
            return Err(ServiceError::NotRemote(self.id.clone()));
        };
        if provider != client_id {
            return Err(ServiceError::WrongProvider {
                service: self.id.clone(),
                provider: provider.clone(),
                client: client_id.to_string(),
            });
        }
        let current = self.status();
        if current == ServiceStatus::Stopped {
            return Err(ServiceError::Stopped(self.id.clone()));
        }

        let executor = RelayRequestExecutor::bind(client_id, Arc::clone(registry), relay_timeout);
        let live = executor.has_connections();
        self.bind_relay(executor);
        if !live {
            self.mark_dead();
            return Err(ServiceError::NoLiveConnection(client_id.to_string()));
        }
        if current != ServiceStatus::Running {
            self.transit(ServiceStatus::Running)?;
        }
        info!(service = %self.id, provider = client_id, "service restored");
        Ok(())
    }

    /// Stops the service: detaches the executor and kills admitted requests.
    pub fn stop(&self) {
        {
            let mut status = self.status.lock();
            if *status == ServiceStatus::Stopped {
                return;
            }
            *status = ServiceStatus::Stopped;
        }
        self.queue.stop();
        self.kill_admitted();
        if let Some(binding) = self.relay.write().take() {
            binding.executor.drained().unsubscribe(binding.drained_listener);
        }
        debug!(service = %self.id, "service stopped");
    }
}

impl std::fmt::Debug for HubService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubService")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("status", &self.status())
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
