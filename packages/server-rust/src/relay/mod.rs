//! Relaying requests to remote service providers.

pub mod executor;

pub use executor::{RelayError, RelayRequestExecutor};
