//! Worker pool and one-shot barriers: the foundation for all async work in
//! the hub.

pub mod async_pool;
pub mod barrier;

pub use async_pool::{AsyncPool, PoolError, PoolStatus};
pub use barrier::{Barrier, StatefulBarrier};
