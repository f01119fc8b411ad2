use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::Principal;

/// How the caller's connection delivers responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// One request, one blocking response (HTTP-style adapters).
    Sync,
    /// Persistent connection; responses are pushed back asynchronously.
    Async,
}

/// Per-request annotations accumulated between routing and execution.
///
/// The router fills the match results, middlewares add transport, source,
/// identity and throttle annotations, and handlers read whatever they need.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    /// Route pattern the request uri matched, e.g. `/service/echo/echo`.
    pub uri_pattern: Option<String>,
    /// Values bound by `:param` and `*rest` segments.
    pub path_params: BTreeMap<String, String>,
    /// Decoded query string pairs.
    pub query_params: BTreeMap<String, String>,
    /// Transport of the connection the request arrived on.
    pub transport: Option<TransportKind>,
    /// Remote address of that connection.
    pub source_addr: Option<String>,
    /// Caller identity resolved from a bearer credential.
    pub principal: Option<Principal>,
    /// Whether the caller presented a credential that resolved.
    pub authorized: bool,
    /// Hits recorded for the source in the current throttle window.
    pub throttle_hits: Option<u32>,
    /// Free-form annotations.
    pub attributes: BTreeMap<String, String>,
}

impl RequestContext {
    #[must_use]
    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}
