//! Connections: the transport contract, the hub's connection registry and
//! the client-side connection pool.

pub mod config;
pub mod connection;
pub mod pool;

pub use config::*;
pub use connection::*;
pub use pool::{ConnectionFactory, ConnectionPool, ConnectionPoolError, ErrorCallback};
