//! Source address blocklist.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use relayhub_core::Message;
use tracing::warn;

use super::pipeline::Middleware;
use super::source_ip;
use crate::network::Connection;
use crate::service::request::ServiceRequest;

pub const BLOCKLIST_ID: &str = "address-blocklist";
pub const BLOCKLIST_PRIORITY: i32 = 1;

/// Blocked source IPs, each with an optional expiry.
///
/// Shared between the blocklist middleware, which enforces it, and the
/// throttle middleware, which escalates repeat offenders into it.
#[derive(Debug, Default)]
pub struct AddressBlocklist {
    entries: DashMap<String, Option<Instant>>,
}

impl AddressBlocklist {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks `ip` for `duration`, or until unblocked when `None`.
    pub fn block(&self, ip: impl Into<String>, duration: Option<Duration>) {
        let until = duration.map(|d| Instant::now() + d);
        self.entries.insert(ip.into(), until);
    }

    pub fn unblock(&self, ip: &str) -> bool {
        self.entries.remove(ip).is_some()
    }

    /// Whether `ip` is currently blocked. Expired entries are dropped.
    #[must_use]
    pub fn is_blocked(&self, ip: &str) -> bool {
        let now = Instant::now();
        let until = match self.entries.get(ip) {
            None => return false,
            Some(entry) => *entry.value(),
        };
        match until {
            None => true,
            Some(t) if t > now => true,
            Some(_) => {
                self.entries.remove_if(ip, |_, until| until.is_some_and(|t| t <= now));
                false
            }
        }
    }

    /// Drops every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, until| !until.is_some_and(|t| t <= now));
        before.saturating_sub(self.entries.len())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Rejects requests from blocklisted sources with `Forbidden`.
pub struct BlocklistMiddleware {
    blocklist: Arc<AddressBlocklist>,
}

impl BlocklistMiddleware {
    #[must_use]
    pub fn new(blocklist: Arc<AddressBlocklist>) -> Self {
        Self { blocklist }
    }
}

#[async_trait]
impl Middleware for BlocklistMiddleware {
    fn id(&self) -> &str {
        BLOCKLIST_ID
    }

    fn priority(&self) -> i32 {
        BLOCKLIST_PRIORITY
    }

    async fn run(&self, conn: &dyn Connection, request: &ServiceRequest) {
        let ip = source_ip(conn, request);
        if self.blocklist.is_blocked(&ip) {
            warn!(source = %ip, request = %request.id(), "blocked source rejected");
            let _ = request.reject(Message::forbidden(request.message(), "source address is blocked"));
        }
    }
}

#[cfg(test)]
mod tests {
    use relayhub_core::MessageType;

    use super::*;
    use crate::network::{ChannelConnection, ConnectionConfig};

    #[test]
    fn permanent_and_expiring_entries() {
        let blocklist = AddressBlocklist::new();
        blocklist.block("10.0.0.1", None);
        blocklist.block("10.0.0.2", Some(Duration::from_secs(60)));
        blocklist.block("10.0.0.3", Some(Duration::ZERO));

        assert!(blocklist.is_blocked("10.0.0.1"));
        assert!(blocklist.is_blocked("10.0.0.2"));
        assert!(!blocklist.is_blocked("10.0.0.3"));
        assert!(!blocklist.is_blocked("10.0.0.4"));
        assert_eq!(blocklist.len(), 2);

        assert!(blocklist.unblock("10.0.0.1"));
        assert!(!blocklist.is_blocked("10.0.0.1"));
    }

    #[test]
    fn purge_drops_only_expired() {
        let blocklist = AddressBlocklist::new();
        blocklist.block("a", Some(Duration::ZERO));
        blocklist.block("b", Some(Duration::ZERO));
        blocklist.block("c", None);
        assert_eq!(blocklist.purge_expired(), 2);
        assert_eq!(blocklist.len(), 1);
    }

    #[tokio::test]
    async fn blocked_source_is_forbidden() {
        let blocklist = Arc::new(AddressBlocklist::new());
        blocklist.block("10.1.1.1", None);
        let mw = BlocklistMiddleware::new(Arc::clone(&blocklist));

        let (bad, _rx1) = ChannelConnection::new("10.1.1.1:9000", &ConnectionConfig::default());
        let req = ServiceRequest::new(Message::request(MessageType::Get, "/service/a/b", Vec::new()));
        mw.run(bad.as_ref(), &req).await;
        let resp = req.response().await.unwrap();
        assert_eq!(resp.message_type(), MessageType::Forbidden);

        let (good, _rx2) = ChannelConnection::new("10.1.1.2:9000", &ConnectionConfig::default());
        let req = ServiceRequest::new(Message::request(MessageType::Get, "/service/a/b", Vec::new()));
        mw.run(good.as_ref(), &req).await;
        assert!(!req.is_terminal());
    }
}
