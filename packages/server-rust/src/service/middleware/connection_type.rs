use async_trait::async_trait;

use super::pipeline::Middleware;
use crate::network::Connection;
use crate::service::request::ServiceRequest;

pub const CONNECTION_TYPE_ID: &str = "connection-type";
pub const CONNECTION_TYPE_PRIORITY: i32 = 0;

/// Records the transport kind and source address of the connection a
/// request arrived on.
#[derive(Debug, Default)]
pub struct ConnectionTypeMiddleware;

#[async_trait]
impl Middleware for ConnectionTypeMiddleware {
    fn id(&self) -> &str {
        CONNECTION_TYPE_ID
    }

    fn priority(&self) -> i32 {
        CONNECTION_TYPE_PRIORITY
    }

    async fn run(&self, conn: &dyn Connection, request: &ServiceRequest) {
        request.update_context(|ctx| {
            ctx.transport = Some(conn.transport());
            ctx.source_addr = Some(conn.address().to_string());
        });
    }
}

#[cfg(test)]
mod tests {
    use relayhub_core::{Message, MessageType, TransportKind};

    use super::*;
    use crate::network::{ChannelConnection, ConnectionConfig};

    #[tokio::test]
    async fn tags_transport_and_source() {
        let (conn, _rx) =
            ChannelConnection::with_transport("192.168.1.4:4000", TransportKind::Sync, &ConnectionConfig::default());
        let req = ServiceRequest::new(Message::request(MessageType::Post, "/service/a/b", Vec::new()));
        ConnectionTypeMiddleware.run(conn.as_ref(), &req).await;

        let ctx = req.context();
        assert_eq!(ctx.transport, Some(TransportKind::Sync));
        assert_eq!(ctx.source_addr.as_deref(), Some("192.168.1.4:4000"));
        assert!(!req.is_terminal());
    }
}
