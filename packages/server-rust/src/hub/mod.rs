//! The relay hub: routing, middleware, admission and execution wired
//! together behind one façade.
//!
//! An inbound request flows through [`RelayHub::dispatch`]:
//!
//! 1. the router matches the uri to a service (`NotFound` /
//!    `MethodNotAllowed` otherwise)
//! 2. the middleware pipeline runs and may end the request
//! 3. services marked `require_auth` refuse unauthorized requests
//! 4. a service that is not `Running` answers `ServiceUnavailable`
//! 5. the request is admitted into the service's task queue

pub mod lifecycle;

use std::sync::Arc;
use std::time::Duration;

use http::Method;
use relayhub_core::{Message, MessageType};
use tracing::{debug, info, warn};

pub use lifecycle::{HubLifecycle, HubState, InFlightGuard};

use crate::network::{Connection, ConnectionRegistry};
use crate::pool::{AsyncPool, PoolError};
use crate::relay::RelayRequestExecutor;
use crate::service::config::HubConfig;
use crate::service::handler::Handler;
use crate::service::hub_service::{HubService, LocalExecutor, ServiceError, ServiceStatus};
use crate::service::middleware::{
    AddressBlocklist, AuthMiddleware, BlocklistMiddleware, ConnectionTypeMiddleware, Middleware, MiddlewarePipeline,
    PipelineError, ThrottleMiddleware,
};
use crate::service::registry::{DuplicateService, ServiceRegistry};
use crate::service::request::ServiceRequest;
use crate::service::router::{RouterError, ServiceRouter};

/// Reason carried by responses to requests that ended without one.
pub const NO_RESPONSE_REASON: &str = "request cancelled or target dead";

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("hub is {0:?}")]
    NotReady(HubState),
    #[error(transparent)]
    DuplicateService(#[from] DuplicateService),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// A local route: verb, short uri below the service prefix, handler.
pub type LocalRoute = (Method, String, Handler);

pub struct RelayHub {
    config: HubConfig,
    pool: Arc<AsyncPool>,
    services: ServiceRegistry,
    router: ServiceRouter,
    pipeline: MiddlewarePipeline,
    connections: Arc<ConnectionRegistry>,
    blocklist: Arc<AddressBlocklist>,
    lifecycle: HubLifecycle,
}

impl RelayHub {
    /// Builds a hub with the built-in middlewares installed.
    ///
    /// # Errors
    ///
    /// `Pipeline` if two built-in middlewares share an id.
    pub fn new(config: HubConfig) -> Result<Arc<Self>, HubError> {
        let blocklist = Arc::new(AddressBlocklist::new());
        let pipeline = MiddlewarePipeline::new();
        let builtins: [Arc<dyn Middleware>; 4] = [
            Arc::new(ConnectionTypeMiddleware),
            Arc::new(BlocklistMiddleware::new(Arc::clone(&blocklist))),
            Arc::new(ThrottleMiddleware::new(config.throttle.clone(), Arc::clone(&blocklist))),
            Arc::new(AuthMiddleware::from_config(&config.auth)),
        ];
        for middleware in builtins {
            pipeline.register(middleware)?;
        }

        Ok(Arc::new(Self {
            pool: Arc::new(AsyncPool::from_config(format!("{}-pool", config.node_id), &config.pool)),
            config,
            services: ServiceRegistry::new(),
            router: ServiceRouter::new(),
            pipeline,
            connections: Arc::new(ConnectionRegistry::new()),
            blocklist,
            lifecycle: HubLifecycle::new(),
        }))
    }

    /// Starts the worker pool and opens the hub for requests.
    ///
    /// # Errors
    ///
    /// `Pool` if the pool was stopped, `NotReady` unless the hub was
    /// `Starting`.
    pub fn start(&self) -> Result<(), HubError> {
        self.pool.start()?;
        if !self.lifecycle.set_ready() {
            return Err(HubError::NotReady(self.lifecycle.state()));
        }
        info!(node = %self.config.node_id, workers = self.pool.worker_size(), "relay hub ready");
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> HubState {
        self.lifecycle.state()
    }

    #[must_use]
    pub fn lifecycle(&self) -> &HubLifecycle {
        &self.lifecycle
    }

    #[must_use]
    pub fn pipeline(&self) -> &MiddlewarePipeline {
        &self.pipeline
    }

    #[must_use]
    pub fn blocklist(&self) -> &Arc<AddressBlocklist> {
        &self.blocklist
    }

    #[must_use]
    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    #[must_use]
    pub fn service(&self, id: &str) -> Option<Arc<HubService>> {
        self.services.get(id)
    }

    #[must_use]
    pub fn service_ids(&self) -> Vec<String> {
        self.services.ids()
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms)
    }

    // -----------------------------------------------------------------------
    // Service registration
    // -----------------------------------------------------------------------

    /// Hosts a service whose routes run in-process.
    ///
    /// # Errors
    ///
    /// `DuplicateService` for a taken id; route errors for duplicate or
    /// malformed routes. Nothing is registered on error.
    pub fn register_local_service(
        &self,
        id: &str,
        routes: Vec<LocalRoute>,
        require_auth: bool,
    ) -> Result<Arc<HubService>, HubError> {
        if self.services.contains(id) {
            return Err(DuplicateService(id.to_string()).into());
        }
        let executor = Arc::new(LocalExecutor::new(
            id,
            Duration::from_millis(self.config.handler_timeout_ms),
        ));
        let mut patterns = Vec::with_capacity(routes.len());
        for (verb, short_uri, handler) in routes {
            executor.add_route(verb.clone(), &short_uri, handler)?;
            patterns.push((verb, short_uri));
        }
        let service = HubService::local(id, Arc::clone(&self.pool), executor, require_auth);
        self.install(service, &patterns)
    }

    /// Hosts a service executed by the remote client `client_id`. The
    /// service is `Dead` until the client has a live connection.
    ///
    /// # Errors
    ///
    /// As for [`register_local_service`](Self::register_local_service).
    pub fn register_relay_service(
        &self,
        id: &str,
        client_id: &str,
        routes: Vec<(Method, String)>,
        require_auth: bool,
    ) -> Result<Arc<HubService>, HubError> {
        if self.services.contains(id) {
            return Err(DuplicateService(id.to_string()).into());
        }
        let executor = RelayRequestExecutor::bind(
            client_id,
            Arc::clone(&self.connections),
            Duration::from_millis(self.config.relay_timeout_ms),
        );
        let service = HubService::relay(id, client_id, Arc::clone(&self.pool), executor, require_auth);
        self.install(service, &routes)
    }

    fn install(&self, service: Arc<HubService>, routes: &[(Method, String)]) -> Result<Arc<HubService>, HubError> {
        let id = service.id().to_string();
        for (verb, short_uri) in routes {
            if let Err(e) = self.router.register(&id, verb, short_uri) {
                self.router.unregister_service(&id);
                service.stop();
                return Err(e.into());
            }
        }
        if let Err(e) = self.services.register(Arc::clone(&service)) {
            self.router.unregister_service(&id);
            service.stop();
            return Err(e.into());
        }
        info!(service = %id, provider = ?service.provider(), routes = routes.len(), "service registered");
        Ok(service)
    }

    /// Stops a service, killing its admitted requests, and drops its routes.
    pub fn unregister_service(&self, id: &str) -> bool {
        let Some(service) = self.services.unregister(id) else {
            return false;
        };
        self.router.unregister_service(id);
        service.stop();
        info!(service = %id, "service unregistered");
        true
    }

    // -----------------------------------------------------------------------
    // Request flow
    // -----------------------------------------------------------------------

    /// Routes, filters and admits `message`, returning its request handle.
    ///
    /// Requests refused along the way are already ended with their error
    /// response. Callers should hold an in-flight guard while the request
    /// runs; [`request`](Self::request) does.
    pub async fn dispatch(&self, conn: &dyn Connection, message: Message) -> Arc<ServiceRequest> {
        let request = Arc::new(ServiceRequest::new(message));

        let target = match self.router.route(&request) {
            Ok(target) => target,
            Err(e) => {
                debug!(request = %request.id(), error = %e, "request not routed");
                self.refuse(&request, e.to_response(request.message()));
                return request;
            }
        };

        if !self.pipeline.run(conn, &request).await {
            return request;
        }

        let Some(service) = self.services.get(&target.service_id) else {
            let response = Message::not_found(request.message(), format!("service {} is not registered", target.service_id));
            self.refuse(&request, response);
            return request;
        };
        if service.require_auth() && !request.with_context(|ctx| ctx.authorized) {
            self.refuse(&request, Message::unauthorized(request.message(), "authorization required"));
            return request;
        }
        let status = service.status();
        if status != ServiceStatus::Running {
            let response = Message::service_unavailable(
                request.message(),
                format!("service {} is {status:?}", service.id()),
            );
            self.refuse(&request, response);
            return request;
        }

        match service.schedule(Arc::clone(&request)).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                // Same id already admitted; that request keeps running.
                let _ = request.kill();
            }
            Err(e) => warn!(service = %service.id(), request = %request.id(), error = %e, "admission failed"),
        }
        request
    }

    fn refuse(&self, request: &ServiceRequest, response: Message) {
        if let Err(e) = request.reject(self.stamp(response)) {
            debug!(request = %request.id(), error = %e, "request ended before refusal");
        }
    }

    fn stamp(&self, message: Message) -> Message {
        if message.from().is_empty() {
            message.with_from(self.config.node_id.clone())
        } else {
            message
        }
    }

    /// Dispatches `message` and waits for its response, bounded by the
    /// configured request timeout.
    ///
    /// Always yields a message: a request that ends without a response is
    /// answered with `ServiceUnavailable`.
    pub async fn request(&self, conn: &dyn Connection, message: Message) -> Message {
        let Some(_guard) = self.lifecycle.try_enter() else {
            let reason = format!("hub is {:?}", self.lifecycle.state());
            return self.stamp(Message::service_unavailable(&message, reason));
        };
        let request = self.dispatch(conn, message).await;
        match request.response_timeout(self.request_timeout()).await {
            Some(response) => self.stamp(response),
            None => self.stamp(Message::service_unavailable(request.message(), NO_RESPONSE_REASON)),
        }
    }

    /// Handles one inbound frame from `conn`.
    ///
    /// Pings are answered in place. Requests run on their own task and
    /// their response is sent back over `conn`. Responses are delivered to
    /// waiting requests by the transport and are ignored here.
    pub async fn handle_incoming(self: &Arc<Self>, conn: Arc<dyn Connection>, message: Message) {
        let message_type = message.message_type();
        if message_type == MessageType::Ping {
            let pong = self.stamp(Message::pong(&message));
            if let Err(e) = conn.send(pong).await {
                debug!(address = conn.address(), error = %e, "pong not sent");
            }
        } else if message_type.is_request() {
            let hub = Arc::clone(self);
            tokio::spawn(async move {
                let response = hub.request(conn.as_ref(), message).await;
                if let Err(e) = conn.send(response).await {
                    debug!(address = conn.address(), error = %e, "response not sent");
                }
            });
        } else {
            debug!(address = conn.address(), %message_type, "ignoring inbound frame");
        }
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Registers a connection of `client_id` and feeds it to the client's
    /// relayed services, restoring dead ones. Returns the restored ids.
    pub fn client_connected(&self, client_id: &str, conn: Arc<dyn Connection>) -> Vec<String> {
        let address = conn.address().to_string();
        if let Some(previous) = self.connections.register(Some(client_id), conn) {
            debug!(address = %address, previous = previous.address(), "connection replaced");
        }
        let relay_timeout = Duration::from_millis(self.config.relay_timeout_ms);

        let mut restored = Vec::new();
        for service in self.services.services_of(client_id) {
            match service.status() {
                ServiceStatus::Dead => match service.restore_externally(client_id, &self.connections, relay_timeout) {
                    Ok(()) => restored.push(service.id().to_string()),
                    Err(e) => warn!(service = %service.id(), error = %e, "service not restored"),
                },
                ServiceStatus::Running | ServiceStatus::Starting => {
                    if let Some(executor) = service.relay_executor() {
                        if let Err(e) = executor.update_provider_connection(&address) {
                            debug!(service = %service.id(), error = %e, "connection not added to relay set");
                        }
                    }
                }
                ServiceStatus::Stopped => {}
            }
        }
        restored
    }

    /// Reports a connection the transport has lost.
    pub fn connection_closed(&self, address: &str) -> bool {
        self.connections.report_gone(address)
    }

    /// Drains and stops the hub.
    ///
    /// New requests are refused at once; in-flight ones get up to
    /// `drain_timeout` to finish. Then every service is stopped, every
    /// connection closed and the pool stopped. Returns whether the drain
    /// finished in time.
    pub async fn shutdown(&self, drain_timeout: Duration) -> bool {
        if !self.lifecycle.begin_drain() {
            return self.lifecycle.in_flight_count() == 0;
        }
        info!(in_flight = self.lifecycle.in_flight_count(), "relay hub draining");
        let drained = self.lifecycle.wait_for_drain(drain_timeout).await;
        if !drained {
            warn!(in_flight = self.lifecycle.in_flight_count(), "drain timed out");
        }

        for id in self.services.shutdown_all() {
            self.router.unregister_service(&id);
        }
        for conn in self.connections.drain_all() {
            let _ = conn.close().await;
        }
        self.pool.stop().await;
        self.lifecycle.mark_stopped();
        info!("relay hub stopped");
        drained
    }
}

impl std::fmt::Debug for RelayHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHub")
            .field("node_id", &self.config.node_id)
            .field("state", &self.state())
            .field("services", &self.services.ids())
            .field("connections", &self.connections.count())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use relayhub_core::AUTHORIZATION_HEADER;
    use tokio::sync::mpsc;

    use super::*;
    use crate::network::{ChannelConnection, ConnectionConfig, OutboundMessage};
    use crate::service::config::StaticTokenConfig;
    use crate::service::handler::handler_fn;

    fn config() -> HubConfig {
        let mut config = HubConfig::default();
        config.pool.worker_size = 4;
        config.request_timeout_ms = 2_000;
        config.relay_timeout_ms = 1_000;
        config.auth.static_tokens.push(StaticTokenConfig {
            token: "secret-token".into(),
            principal_id: "alice".into(),
            roles: vec!["admin".into()],
        });
        config
    }

    fn echo_routes() -> Vec<LocalRoute> {
        vec![(
            Method::POST,
            "/echo".to_string(),
            handler_fn(|req: Arc<ServiceRequest>| async move {
                Ok(Message::response(req.message(), req.message().payload().to_vec()))
            }),
        )]
    }

    fn started_hub() -> Arc<RelayHub> {
        let hub = RelayHub::new(config()).unwrap();
        hub.start().unwrap();
        hub
    }

    fn caller(address: &str) -> (Arc<ChannelConnection>, mpsc::Receiver<OutboundMessage>) {
        ChannelConnection::new(address, &ConnectionConfig::default())
    }

    async fn next_frame(rx: &mut mpsc::Receiver<OutboundMessage>) -> Message {
        match rx.recv().await {
            Some(OutboundMessage::Frame(message)) => message,
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_echo_end_to_end() {
        let hub = started_hub();
        hub.register_local_service("echo", echo_routes(), false).unwrap();
        let (conn, _rx) = caller("10.1.0.1:4000");

        let msg = Message::request(MessageType::Post, "/service/echo/echo", b"ping".to_vec());
        let id = msg.id().to_string();
        let resp = hub.request(conn.as_ref(), msg).await;
        assert_eq!(resp.message_type(), MessageType::Ok);
        assert_eq!(resp.id(), id);
        assert_eq!(resp.payload(), b"ping");
        assert_eq!(resp.from(), "hub");
    }

    #[tokio::test]
    async fn routing_failures_become_responses() {
        let hub = started_hub();
        hub.register_local_service("echo", echo_routes(), false).unwrap();
        let (conn, _rx) = caller("10.1.0.1:4000");

        let resp = hub
            .request(conn.as_ref(), Message::request(MessageType::Post, "/service/nope/x", Vec::new()))
            .await;
        assert_eq!(resp.message_type(), MessageType::NotFound);

        let resp = hub
            .request(conn.as_ref(), Message::request(MessageType::Get, "/service/echo/echo", Vec::new()))
            .await;
        assert_eq!(resp.message_type(), MessageType::MethodNotAllowed);
    }

    #[tokio::test]
    async fn require_auth_checks_credentials() {
        let hub = started_hub();
        hub.register_local_service("secure", echo_routes(), true).unwrap();
        let (conn, _rx) = caller("10.1.0.2:4000");

        let anonymous = Message::request(MessageType::Post, "/service/secure/echo", Vec::new());
        assert_eq!(
            hub.request(conn.as_ref(), anonymous).await.message_type(),
            MessageType::Unauthorized
        );

        let authed = Message::request(MessageType::Post, "/service/secure/echo", b"x".to_vec())
            .with_header(AUTHORIZATION_HEADER, "Bearer secret-token");
        assert_eq!(hub.request(conn.as_ref(), authed).await.message_type(), MessageType::Ok);
    }

    #[tokio::test]
    async fn blocked_source_is_forbidden() {
        let hub = started_hub();
        hub.register_local_service("echo", echo_routes(), false).unwrap();
        hub.blocklist().block("10.9.9.9", None);
        let (conn, _rx) = caller("10.9.9.9:1234");

        let resp = hub
            .request(conn.as_ref(), Message::request(MessageType::Post, "/service/echo/echo", Vec::new()))
            .await;
        assert_eq!(resp.message_type(), MessageType::Forbidden);
    }

    #[tokio::test]
    async fn registration_conflicts_leave_no_trace() {
        let hub = started_hub();
        hub.register_local_service("echo", echo_routes(), false).unwrap();
        assert!(matches!(
            hub.register_local_service("echo", echo_routes(), false),
            Err(HubError::DuplicateService(_))
        ));

        let mut routes = echo_routes();
        routes.extend(echo_routes());
        assert!(hub.register_local_service("twice", routes, false).is_err());
        assert!(hub.service("twice").is_none());

        assert!(hub.unregister_service("echo"));
        assert!(!hub.unregister_service("echo"));
        let (conn, _rx) = caller("10.1.0.1:4000");
        let resp = hub
            .request(conn.as_ref(), Message::request(MessageType::Post, "/service/echo/echo", Vec::new()))
            .await;
        assert_eq!(resp.message_type(), MessageType::NotFound);
    }

    #[tokio::test]
    async fn relay_round_trip_and_recovery() {
        let hub = started_hub();
        let service = hub
            .register_relay_service("remote", "provider-1", vec![(Method::GET, "/time".to_string())], false)
            .unwrap();
        assert_eq!(service.status(), ServiceStatus::Dead);

        let (caller_conn, _caller_rx) = caller("10.1.0.3:4000");
        let msg = Message::request(MessageType::Get, "/service/remote/time", Vec::new());
        assert_eq!(
            hub.request(caller_conn.as_ref(), msg).await.message_type(),
            MessageType::ServiceUnavailable
        );

        // The provider connects; the dead service comes back.
        let (provider, mut provider_rx) = caller("10.2.0.1:5000");
        let restored = hub.client_connected("provider-1", Arc::clone(&provider) as Arc<dyn Connection>);
        assert_eq!(restored, ["remote"]);
        assert_eq!(service.status(), ServiceStatus::Running);

        let answering = {
            let provider = Arc::clone(&provider);
            tokio::spawn(async move {
                let forwarded = next_frame(&mut provider_rx).await;
                assert_eq!(forwarded.uri(), "/service/remote/time");
                assert_eq!(forwarded.to(), "provider-1");
                provider.deliver(Message::response(&forwarded, b"noon".to_vec()));
            })
        };
        let msg = Message::request(MessageType::Get, "/service/remote/time", Vec::new());
        let id = msg.id().to_string();
        let resp = hub.request(caller_conn.as_ref(), msg).await;
        answering.await.unwrap();
        assert_eq!(resp.message_type(), MessageType::Ok);
        assert_eq!(resp.id(), id);
        assert_eq!(resp.payload(), b"noon");

        // Losing the only provider connection kills the service.
        assert!(hub.connection_closed("10.2.0.1:5000"));
        assert_eq!(service.status(), ServiceStatus::Dead);
    }

    #[tokio::test]
    async fn dead_provider_connection_yields_internal_error() {
        let hub = started_hub();
        let (provider, provider_rx) = caller("10.2.0.2:5000");
        hub.client_connected("provider-2", Arc::clone(&provider) as Arc<dyn Connection>);
        let service = hub
            .register_relay_service("remote", "provider-2", vec![(Method::GET, "/t".to_string())], false)
            .unwrap();
        assert_eq!(service.status(), ServiceStatus::Running);
        drop(provider_rx);

        let (caller_conn, _caller_rx) = caller("10.1.0.4:4000");
        let resp = hub
            .request(caller_conn.as_ref(), Message::request(MessageType::Get, "/service/remote/t", Vec::new()))
            .await;
        assert_eq!(resp.message_type(), MessageType::InternalError);
        assert!(resp.reason().unwrap().contains("relay to provider-2 failed"));
        assert_eq!(service.status(), ServiceStatus::Dead);
    }

    #[tokio::test]
    async fn provider_reconnect_at_same_address_keeps_service_running() {
        let hub = started_hub();
        let (old, _old_rx) = caller("10.2.0.3:5000");
        hub.client_connected("provider-3", Arc::clone(&old) as Arc<dyn Connection>);
        let service = hub
            .register_relay_service("remote", "provider-3", vec![(Method::GET, "/t".to_string())], false)
            .unwrap();
        old.close().await.unwrap();

        let (fresh, mut fresh_rx) = caller("10.2.0.3:5000");
        assert!(hub
            .client_connected("provider-3", Arc::clone(&fresh) as Arc<dyn Connection>)
            .is_empty());
        assert_eq!(service.status(), ServiceStatus::Running);

        let answering = {
            let fresh = Arc::clone(&fresh);
            tokio::spawn(async move {
                let forwarded = next_frame(&mut fresh_rx).await;
                fresh.deliver(Message::response(&forwarded, b"again".to_vec()));
            })
        };
        let (caller_conn, _caller_rx) = caller("10.1.0.5:4000");
        let resp = hub
            .request(caller_conn.as_ref(), Message::request(MessageType::Get, "/service/remote/t", Vec::new()))
            .await;
        answering.await.unwrap();
        assert_eq!(resp.message_type(), MessageType::Ok);
        assert_eq!(resp.payload(), b"again");
        assert_eq!(service.status(), ServiceStatus::Running);
    }

    #[tokio::test]
    async fn handle_incoming_answers_over_the_connection() {
        let hub = started_hub();
        hub.register_local_service("echo", echo_routes(), false).unwrap();
        let (conn, mut rx) = caller("10.1.0.4:4000");
        let conn: Arc<dyn Connection> = conn;

        let ping = Message::ping("client-9");
        hub.handle_incoming(Arc::clone(&conn), ping.clone()).await;
        let pong = next_frame(&mut rx).await;
        assert_eq!(pong.message_type(), MessageType::Pong);
        assert_eq!(pong.id(), ping.id());

        let msg = Message::request(MessageType::Post, "/service/echo/echo", b"hey".to_vec());
        hub.handle_incoming(Arc::clone(&conn), msg.clone()).await;
        let resp = next_frame(&mut rx).await;
        assert_eq!(resp.id(), msg.id());
        assert_eq!(resp.payload(), b"hey");
    }

    #[tokio::test]
    async fn shutdown_refuses_new_requests() {
        let hub = started_hub();
        hub.register_local_service("echo", echo_routes(), false).unwrap();
        let service = hub.service("echo").unwrap();

        assert!(hub.shutdown(Duration::from_secs(1)).await);
        assert_eq!(hub.state(), HubState::Stopped);
        assert_eq!(service.status(), ServiceStatus::Stopped);
        assert!(hub.service_ids().is_empty());

        let (conn, _rx) = caller("10.1.0.1:4000");
        let resp = hub
            .request(conn.as_ref(), Message::request(MessageType::Post, "/service/echo/echo", Vec::new()))
            .await;
        assert_eq!(resp.message_type(), MessageType::ServiceUnavailable);
    }

    #[test]
    fn new_hub_installs_builtin_middlewares() {
        let hub = RelayHub::new(config()).unwrap();
        assert_eq!(hub.state(), HubState::Starting);
        assert_eq!(
            hub.pipeline().ids(),
            ["connection-type", "address-blocklist", "address-throttle", "auth"]
        );
    }

    #[tokio::test]
    async fn unstarted_hub_refuses_requests() {
        let hub = RelayHub::new(config()).unwrap();
        hub.register_local_service("echo", echo_routes(), false).unwrap();
        let (conn, _rx) = caller("10.1.0.1:4000");
        let resp = hub
            .request(conn.as_ref(), Message::request(MessageType::Post, "/service/echo/echo", Vec::new()))
            .await;
        assert_eq!(resp.message_type(), MessageType::ServiceUnavailable);
        assert_eq!(resp.reason(), Some("hub is Starting"));
    }
}
