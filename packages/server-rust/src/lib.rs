//! `RelayHub` Server — request routing and relay execution: worker pool,
//! per-service task queues, middleware, relay executor and a client-side
//! connection pool.

pub mod hub;
pub mod logging;
pub mod network;
pub mod pool;
pub mod relay;
pub mod service;

pub use hub::{HubError, HubState, RelayHub};
pub use service::config::HubConfig;
