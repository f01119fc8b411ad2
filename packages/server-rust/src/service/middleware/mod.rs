//! Request middlewares run between routing and admission.
//!
//! - [`pipeline`]: the ordered, short-circuiting chain
//! - [`connection_type`]: transport and source tagging (priority 0)
//! - [`blocklist`]: blocked source rejection (priority 1)
//! - [`throttle`]: per-source rate limiting with escalation (priority 2)
//! - [`auth`]: bearer credential resolution (priority 3)

pub mod auth;
pub mod blocklist;
pub mod connection_type;
pub mod pipeline;
pub mod throttle;

use std::net::SocketAddr;

pub use auth::{AuthError, AuthMiddleware, CredentialResolver, JwtResolver, StaticTokenResolver};
pub use blocklist::{AddressBlocklist, BlocklistMiddleware};
pub use connection_type::ConnectionTypeMiddleware;
pub use pipeline::{Middleware, MiddlewarePipeline, PipelineError};
pub use throttle::{AddressThrottle, ThrottleMiddleware, ThrottleVerdict};

use crate::network::Connection;
use crate::service::request::ServiceRequest;

/// Source IP of a request: the tagged source address, falling back to the
/// connection address, with any port stripped.
pub(crate) fn source_ip(conn: &dyn Connection, request: &ServiceRequest) -> String {
    let addr = request
        .with_context(|ctx| ctx.source_addr.clone())
        .unwrap_or_else(|| conn.address().to_string());
    addr.parse::<SocketAddr>()
        .map_or(addr, |socket| socket.ip().to_string())
}

#[cfg(test)]
mod tests {
    use relayhub_core::{Message, MessageType};

    use super::*;
    use crate::network::{ChannelConnection, ConnectionConfig};

    #[test]
    fn source_ip_strips_port() {
        let (conn, _rx) = ChannelConnection::new("[::1]:8080", &ConnectionConfig::default());
        let req = ServiceRequest::new(Message::request(MessageType::Get, "/service/a/b", Vec::new()));
        assert_eq!(source_ip(conn.as_ref(), &req), "::1");

        req.update_context(|ctx| ctx.source_addr = Some("10.2.3.4:1".into()));
        assert_eq!(source_ip(conn.as_ref(), &req), "10.2.3.4");

        let (named, _rx) = ChannelConnection::new("client-7", &ConnectionConfig::default());
        let req = ServiceRequest::new(Message::request(MessageType::Get, "/service/a/b", Vec::new()));
        assert_eq!(source_ip(named.as_ref(), &req), "client-7");
    }
}
