//! Hosted services and the request pipeline in front of them.
//!
//! 1. **Routing** (`router`): uri and verb to owning service
//! 2. **Middleware** (`middleware`): ordered, short-circuiting filters
//! 3. **Admission** (`task_queue`): exactly-once execution on the shared pool
//! 4. **Execution** (`hub_service`): local handlers or relay to a provider

pub mod config;
pub mod handler;
pub mod hub_service;
pub mod middleware;
pub mod registry;
pub mod request;
pub mod router;
pub mod task_queue;

pub use config::{AuthConfig, HubConfig, PoolConfig, StaticTokenConfig, ThrottleConfig};
pub use handler::{handler_fn, Handler, HandlerError};
pub use hub_service::{HubService, LocalExecutor, Provider, ServiceError, ServiceStatus};
pub use registry::{DuplicateService, ServiceRegistry};
pub use request::{RequestError, RequestStatus, ServiceRequest};
pub use router::{RouteTarget, RouterError, ServiceRouter};
pub use task_queue::{Executor, QueueError, ServiceTaskQueue};
